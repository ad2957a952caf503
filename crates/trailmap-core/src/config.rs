//! Application configuration management.
//!
//! Configuration is stored at `~/.config/trailmap/config.json`. Every field
//! has a default, so a missing file or a partial one is fine. Two
//! environment variables override the file: `TRAILMAP_ORIGIN` and
//! `TRAILMAP_CACHE_DIR`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{OfflineError, Result};
use crate::tiles::TileLayer;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "trailmap";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_ORIGIN: &str = "TRAILMAP_ORIGIN";
pub const ENV_CACHE_DIR: &str = "TRAILMAP_CACHE_DIR";

/// Files every installation needs before the map can work offline.
const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/folder.json",
    "/style.css",
    "/theme.js",
    "/leaflet-gpx.js",
    "/poi.json",
    "/rec.geojson",
    "/css/leaflet.css",
    "/css/font-awesome.css",
    "/css/leaflet-sidebar.css",
    "/css/main.css",
    "/css/L.Control.Locate.css",
    "/css/L.switchBasemap.css",
    "/src/leaflet-elevation.js",
    "/src/leaflet.legend.js",
    "/src/leaflet-sidebar.js",
    "/src/leaflet.edgebuffer.js",
    "/src/L.switchBasemap.js",
    "/src/L.Control.Locate.js",
    "/src/leaflet.permalink.js",
    "/src/leaflet-offline-bundle.js",
    "/src/SmoothWheelZoom.js",
    "/src/leaflet.legend.css",
    "/pin-icon-wpt.png",
    "/pin-shadow.png",
    "/resources/camp.png",
    "/resources/rec-site.png",
    "/resources/osm.png",
    "/resources/otm.png",
    "/resources/mapbox-dark.png",
    "/resources/mapbox-light.png",
    "/resources/mapbox-satellite-streets.png",
    "/fonts/fontawesome-webfont.woff2",
    "/fonts/fontawesome-webfont.woff",
    "/fonts/fontawesome-webfont.ttf",
];

const DEFAULT_TILE_SERVERS: &[&str] = &[
    "tile.openstreetmap.org",
    "api.mapbox.com",
    "tiles.stadiamaps.com",
    "a.tile.stamen.com",
    "b.tile.stamen.com",
    "c.tile.stamen.com",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin the application is served from. Everything else is foreign.
    pub origin: String,
    /// Generation holding application resources; bump it on every release.
    pub cache_version: String,
    /// Generation holding tiles captured by the router. Survives releases.
    pub tile_cache: String,
    /// Hosts whose tile requests are cached (exact host or subdomain of it).
    pub tile_servers: Vec<String>,
    /// Tiles above this zoom pass through uncached. `None` caches every zoom.
    pub max_zoom_to_cache: Option<u32>,
    pub manifest_path: String,
    /// Served for HTML navigations that miss both network and cache.
    pub app_shell: String,
    /// Manifest categories synced when a caller names none.
    pub priority_types: Vec<String>,
    /// Only cached URLs with this suffix take part in sync.
    pub sync_suffix: String,
    pub precache: Vec<String>,
    pub request_timeout_secs: u64,
    /// Concurrent tile downloads in a batch.
    pub parallel: usize,
    /// Download tiles even when the store already holds them.
    pub always_download: bool,
    /// Highest zoom saved by "save what you see".
    pub max_zoom: u32,
    /// Default tile template for the CLI.
    pub tile_template: String,
    /// Overrides the platform cache directory.
    pub cache_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8000".to_string(),
            cache_version: "bikemap-v1-2025-12-30-v12".to_string(),
            tile_cache: "bikemap-tiles-v1".to_string(),
            tile_servers: strings(DEFAULT_TILE_SERVERS),
            max_zoom_to_cache: Some(15),
            manifest_path: "/folder.json".to_string(),
            app_shell: "/index.html".to_string(),
            priority_types: strings(&["0-route", "1-road", "2-connector"]),
            sync_suffix: ".gpx".to_string(),
            precache: strings(DEFAULT_PRECACHE),
            request_timeout_secs: crate::http::DEFAULT_TIMEOUT_SECS,
            parallel: 50,
            always_download: true,
            max_zoom: 19,
            tile_template: "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            cache_path: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults when absent) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).map_err(|e| OfflineError::storage(&path, e))?;
            serde_json::from_str(&contents)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| OfflineError::Config("Could not find config directory".to_string()))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides looked up through `var` (the process environment in `load`).
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(origin) = var(ENV_ORIGIN).filter(|s| !s.is_empty()) {
            self.origin = origin;
        }
        if let Some(dir) = var(ENV_CACHE_DIR).filter(|s| !s.is_empty()) {
            self.cache_path = Some(PathBuf::from(dir));
        }
    }

    /// Root directory for the resource cache and the tile store.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.cache_path {
            return Ok(path.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| OfflineError::Config("Could not find cache directory".to_string()))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn resources_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("resources"))
    }

    pub fn tiles_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("tiles"))
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| OfflineError::Config(format!("Invalid origin {:?}: {}", self.origin, e)))
    }

    /// Resolve a path (or absolute URL) against the origin.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        self.origin_url()?
            .join(path)
            .map_err(|e| OfflineError::Config(format!("Invalid path {:?}: {}", path, e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Layer for `template`, falling back to the configured `tile_template`.
    pub fn tile_layer(&self, template: Option<&str>) -> TileLayer {
        TileLayer::new(template.unwrap_or(&self.tile_template))
    }
}
