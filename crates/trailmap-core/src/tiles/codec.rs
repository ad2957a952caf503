//! Tile key and URL derivation.
//!
//! A tile template such as `https://{s}.tile.openstreetmap.org/{z}/{x}/{y}{r}.png`
//! is expanded with a coordinate, a subdomain and the retina suffix. Storage
//! keys always use the first subdomain: subdomains shard the same content,
//! so a tile served by `b.` is stored under the same key as one served by `a.`
//! and re-saving it overwrites instead of duplicating.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::PixelBounds;
use crate::error::{OfflineError, Result};

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Highest zoom level a tile coordinate may carry.
pub const MAX_TILE_ZOOM: u32 = 30;

/// Suffix substituted for `{r}` on high-density displays.
const RETINA_SUFFIX: &str = "@2x";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i64,
    pub y: i64,
    pub z: u32,
}

impl TileCoord {
    pub fn new(x: i64, y: i64, z: u32) -> Self {
        Self { x, y, z }
    }
}

/// A tile ready to be fetched and stored: coordinate plus precomputed key and url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDescriptor {
    pub key: String,
    pub url: String,
    pub url_template: String,
    pub x: i64,
    pub y: i64,
    pub z: u32,
    pub created_at: DateTime<Utc>,
}

impl TileDescriptor {
    pub fn coord(&self) -> TileCoord {
        TileCoord::new(self.x, self.y, self.z)
    }
}

/// Expand `template` for one coordinate.
///
/// Placeholders are `{s}`, `{z}`, `{x}`, `{y}`, `{-y}` (TMS row), `{r}`
/// and any key of `options`. Coordinate values win over options of the
/// same name. A placeholder with no value, or a zoom above
/// [`MAX_TILE_ZOOM`], is a validation error.
pub fn resolve(
    template: &str,
    coord: TileCoord,
    subdomain: Option<&str>,
    retina: bool,
    options: &BTreeMap<String, String>,
) -> Result<String> {
    check_zoom(coord.z)?;
    let lookup = |name: &str| -> Result<String> {
        match name {
            "s" => subdomain
                .map(str::to_string)
                .ok_or_else(|| OfflineError::Validation("No subdomain configured for {s}".to_string())),
            "x" => Ok(coord.x.to_string()),
            "y" => Ok(coord.y.to_string()),
            "z" => Ok(coord.z.to_string()),
            "-y" => Ok(((1i64 << coord.z) - 1 - coord.y).to_string()),
            "r" => Ok(if retina { RETINA_SUFFIX } else { "" }.to_string()),
            other => options.get(other).cloned().ok_or_else(|| {
                OfflineError::Validation(format!("No value provided for variable {{{}}}", other))
            }),
        }
    };

    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder(&after[..end]) => {
                out.push_str(&lookup(after[..end].trim())?);
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

pub(crate) fn check_zoom(zoom: u32) -> Result<()> {
    if zoom > MAX_TILE_ZOOM {
        return Err(OfflineError::Validation(format!(
            "Zoom {} is above the maximum of {}",
            zoom, MAX_TILE_ZOOM
        )));
    }
    Ok(())
}

fn is_placeholder(inner: &str) -> bool {
    !inner.trim().is_empty()
        && inner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

/// Subdomain that serves `coord` under round-robin sharding.
pub fn subdomain_for(coord: TileCoord, subdomains: &[String]) -> Option<&str> {
    if subdomains.is_empty() {
        return None;
    }
    let index = (coord.x + coord.y).unsigned_abs() % subdomains.len() as u64;
    subdomains.get(index as usize).map(String::as_str)
}

/// Storage key for `coord`: the template resolved with subdomain slot 0.
pub fn derive_key(
    template: &str,
    coord: TileCoord,
    subdomains: &[String],
    retina: bool,
    options: &BTreeMap<String, String>,
) -> Result<String> {
    resolve(
        template,
        coord,
        subdomains.first().map(String::as_str),
        retina,
        options,
    )
}

/// A tile source as configured by the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileLayer {
    pub url_template: String,
    pub subdomains: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub retina: bool,
    pub tile_size: u32,
}

impl TileLayer {
    /// Layer with the usual `a`, `b`, `c` subdomains and 256px tiles.
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            subdomains: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            options: BTreeMap::new(),
            retina: false,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }

    pub fn with_subdomains<I, S>(mut self, subdomains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdomains = subdomains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn with_retina(mut self, retina: bool) -> Self {
        self.retina = retina;
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    /// URL the tile is actually fetched from (round-robin subdomain).
    pub fn tile_url(&self, coord: TileCoord) -> Result<String> {
        resolve(
            &self.url_template,
            coord,
            subdomain_for(coord, &self.subdomains),
            self.retina,
            &self.options,
        )
    }

    pub fn storage_key(&self, coord: TileCoord) -> Result<String> {
        derive_key(
            &self.url_template,
            coord,
            &self.subdomains,
            self.retina,
            &self.options,
        )
    }

    pub fn tile_descriptor(&self, coord: TileCoord) -> Result<TileDescriptor> {
        Ok(TileDescriptor {
            key: self.storage_key(coord)?,
            url: self.tile_url(coord)?,
            url_template: self.url_template.clone(),
            x: coord.x,
            y: coord.y,
            z: coord.z,
            created_at: Utc::now(),
        })
    }

    /// Every tile intersecting `bounds` (pixel space at `zoom`), row-major.
    pub fn expand_region_to_tiles(&self, bounds: &PixelBounds, zoom: u32) -> Result<Vec<TileDescriptor>> {
        if self.tile_size == 0 {
            return Err(OfflineError::Validation("Tile size must be positive".to_string()));
        }
        check_zoom(zoom)?;
        let size = f64::from(self.tile_size);
        let min_x = (bounds.min.x / size).floor() as i64;
        let min_y = (bounds.min.y / size).floor() as i64;
        let max_x = (bounds.max.x / size).floor() as i64;
        let max_y = (bounds.max.y / size).floor() as i64;

        let mut tiles = Vec::new();
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                tiles.push(self.tile_descriptor(TileCoord::new(x, y, zoom))?);
            }
        }
        Ok(tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::geo::Point;

    const OSM: &str = "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}{r}.png";

    fn subs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_all_placeholders() {
        let url = resolve(OSM, TileCoord::new(1320, 2841, 13), Some("b"), true, &BTreeMap::new()).unwrap();
        assert_eq!(url, "https://b.tile.openstreetmap.org/13/1320/2841@2x.png");

        let url = resolve(OSM, TileCoord::new(1320, 2841, 13), Some("a"), false, &BTreeMap::new()).unwrap();
        assert_eq!(url, "https://a.tile.openstreetmap.org/13/1320/2841.png");
    }

    #[test]
    fn test_resolve_options_and_whitespace() {
        let mut options = BTreeMap::new();
        options.insert("accessToken".to_string(), "tok".to_string());
        options.insert("x".to_string(), "ignored".to_string());
        let url = resolve(
            "https://api.mapbox.com/{ z }/{x}/{y}?access_token={accessToken}",
            TileCoord::new(3, 4, 5),
            None,
            false,
            &options,
        )
        .unwrap();
        assert_eq!(url, "https://api.mapbox.com/5/3/4?access_token=tok");
    }

    #[test]
    fn test_resolve_tms_row() {
        let url = resolve("/{z}/{x}/{-y}.png", TileCoord::new(0, 0, 2), None, false, &BTreeMap::new()).unwrap();
        assert_eq!(url, "/2/0/3.png");
    }

    #[test]
    fn test_resolve_unknown_placeholder_fails() {
        let err = resolve("/{z}/{missing}.png", TileCoord::new(0, 0, 1), None, false, &BTreeMap::new());
        assert!(matches!(err, Err(OfflineError::Validation(_))));

        let err = resolve(OSM, TileCoord::new(0, 0, 1), None, false, &BTreeMap::new());
        assert!(matches!(err, Err(OfflineError::Validation(_))));
    }

    #[test]
    fn test_zoom_above_maximum_rejected() {
        let no_opts = BTreeMap::new();
        let err = resolve("/{z}/{x}/{-y}.png", TileCoord::new(0, 0, 63), None, false, &no_opts);
        assert!(matches!(err, Err(OfflineError::Validation(_))));

        let url = resolve("/{z}/{x}/{-y}.png", TileCoord::new(0, 0, MAX_TILE_ZOOM), None, false, &no_opts);
        assert_eq!(url.unwrap(), format!("/30/0/{}.png", (1i64 << 30) - 1));

        let layer = TileLayer::new(OSM);
        let bounds = PixelBounds::new(Point::new(0.0, 0.0), Point::new(10.0, 10.0));
        assert!(matches!(
            layer.expand_region_to_tiles(&bounds, 40),
            Err(OfflineError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_keeps_non_placeholder_braces() {
        let url = resolve("/a{b.c}/{z}", TileCoord::new(0, 0, 1), None, false, &BTreeMap::new()).unwrap();
        assert_eq!(url, "/a{b.c}/1");
    }

    #[test]
    fn test_derive_key_stable_across_serving_subdomain() {
        let coord = TileCoord::new(1320, 2841, 13);
        let no_opts = BTreeMap::new();
        let k1 = derive_key(OSM, coord, &subs(&["a", "b"]), false, &no_opts).unwrap();
        let k2 = derive_key(OSM, coord, &subs(&["a", "z"]), false, &no_opts).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1, "https://a.tile.openstreetmap.org/13/1320/2841.png");
    }

    #[test]
    fn test_derive_key_no_cross_zoom_collision() {
        let no_opts = BTreeMap::new();
        let abc = subs(&["a", "b", "c"]);
        for z in 0..20u32 {
            let k1 = derive_key(OSM, TileCoord::new(7, 9, z), &abc, false, &no_opts).unwrap();
            let k2 = derive_key(OSM, TileCoord::new(7, 9, z + 1), &abc, false, &no_opts).unwrap();
            assert_ne!(k1, k2);
        }
    }

    #[test]
    fn test_subdomain_round_robin() {
        let abc = subs(&["a", "b", "c"]);
        assert_eq!(subdomain_for(TileCoord::new(0, 0, 1), &abc), Some("a"));
        assert_eq!(subdomain_for(TileCoord::new(1, 0, 1), &abc), Some("b"));
        assert_eq!(subdomain_for(TileCoord::new(1, 1, 1), &abc), Some("c"));
        assert_eq!(subdomain_for(TileCoord::new(-4, 0, 1), &abc), Some("b"));
        assert_eq!(subdomain_for(TileCoord::new(1, 1, 1), &[]), None);
    }

    #[test]
    fn test_layer_url_and_key_differ_only_in_subdomain() {
        let layer = TileLayer::new(OSM);
        let coord = TileCoord::new(1, 0, 3);
        assert_eq!(layer.tile_url(coord).unwrap(), "https://b.tile.openstreetmap.org/3/1/0.png");
        assert_eq!(layer.storage_key(coord).unwrap(), "https://a.tile.openstreetmap.org/3/1/0.png");
    }

    #[test]
    fn test_expand_region_row_major() {
        let layer = TileLayer::new(OSM);
        let bounds = PixelBounds::new(Point::new(300.0, 10.0), Point::new(600.0, 300.0));
        let tiles = layer.expand_region_to_tiles(&bounds, 4).unwrap();

        let coords: Vec<(i64, i64)> = tiles.iter().map(|t| (t.x, t.y)).collect();
        assert_eq!(coords, vec![(1, 0), (2, 0), (1, 1), (2, 1)]);
        assert!(tiles.iter().all(|t| t.z == 4 && t.url_template == OSM));
        assert_eq!(tiles[0].key, "https://a.tile.openstreetmap.org/4/1/0.png");
        assert_eq!(tiles[0].url, "https://b.tile.openstreetmap.org/4/1/0.png");
    }

    #[test]
    fn test_expand_region_single_tile_on_exact_edges() {
        let layer = TileLayer::new(OSM);
        let bounds = PixelBounds::new(Point::new(0.0, 0.0), Point::new(255.9, 255.9));
        assert_eq!(layer.expand_region_to_tiles(&bounds, 1).unwrap().len(), 1);
    }
}
