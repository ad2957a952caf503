//! Request interception: decide, per request, whether the network or the
//! local cache answers it, and what to serve when neither can.
//!
//! Every GET falls into exactly one [`RequestClass`]:
//!
//! | Class           | Strategy                                   | Generation      |
//! |-----------------|--------------------------------------------|-----------------|
//! | `ForeignOrigin` | network first, then any cached copy        | `cache_version` |
//! | `TileRequest`   | network first, then the tile generation    | `tile_cache`    |
//! | `SourceFile`    | network first, then cache, then app shell  | `cache_version` |
//! | `DataFile`      | cache first, then network, then app shell  | `cache_version` |
//!
//! The router never fails: the last resort is [`Response::offline`].

use std::sync::Arc;

use reqwest::Method;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{LookupOptions, ResourceCache};
use crate::config::Config;
use crate::error::Result;
use crate::http::{Fetcher, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Another origin that is not a tile server we cache.
    ForeignOrigin,
    /// A `/z/x/y.(png|jpg|webp)` request to an allowlisted tile server.
    TileRequest { zoom: u32 },
    /// Same-origin HTML, CSS, JS or the origin root.
    SourceFile,
    /// Any other same-origin resource (GPX, JSON, images, fonts).
    DataFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    AppShell,
    OfflinePlaceholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl RoutedResponse {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }

    fn placeholder() -> Self {
        Self::new(Response::offline(), ResponseSource::OfflinePlaceholder)
    }
}

/// The parts of [`Config`] the router needs, resolved up front.
#[derive(Debug, Clone)]
pub struct RouterPolicy {
    pub origin: Url,
    pub tile_servers: Vec<String>,
    pub max_zoom_to_cache: Option<u32>,
    pub cache_version: String,
    pub tile_cache: String,
    pub app_shell: Url,
}

impl RouterPolicy {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            origin: config.origin_url()?,
            tile_servers: config.tile_servers.clone(),
            max_zoom_to_cache: config.max_zoom_to_cache,
            cache_version: config.cache_version.clone(),
            tile_cache: config.tile_cache.clone(),
            app_shell: config.url_for(&config.app_shell)?,
        })
    }

    fn is_tile_server(&self, host: &str) -> bool {
        self.tile_servers.iter().any(|server| {
            host.eq_ignore_ascii_case(server)
                || host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", server.to_ascii_lowercase()))
        })
    }

    /// False when `zoom` is above the configured caching ceiling.
    pub fn should_cache_tile(&self, zoom: u32) -> bool {
        self.max_zoom_to_cache.map_or(true, |max| zoom <= max)
    }
}

/// Zoom level of a `/…/z/x/y.(png|jpg|webp)` path, if it is one.
pub fn tile_zoom(url: &Url) -> Option<u32> {
    let segments: Vec<&str> = url.path_segments()?.collect();
    let [.., z, x, last] = *segments.as_slice() else {
        return None;
    };
    let (y, ext) = last.rsplit_once('.')?;
    let is_image = ["png", "jpg", "webp"]
        .iter()
        .any(|e| ext.eq_ignore_ascii_case(e));
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !is_image || !all_digits(x) || !all_digits(y) || !all_digits(z) {
        return None;
    }
    z.parse().ok()
}

fn is_source_file(url: &Url) -> bool {
    let path = url.path();
    path == "/" || [".html", ".css", ".js"].iter().any(|ext| path.ends_with(ext))
}

pub struct InterceptionRouter {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<ResourceCache>,
    policy: RouterPolicy,
}

impl InterceptionRouter {
    pub fn new(fetcher: Arc<dyn Fetcher>, cache: Arc<ResourceCache>, policy: RouterPolicy) -> Self {
        Self {
            fetcher,
            cache,
            policy,
        }
    }

    pub fn policy(&self) -> &RouterPolicy {
        &self.policy
    }

    /// `None` for requests that are not intercepted (anything but GET).
    pub fn classify(&self, request: &Request) -> Option<RequestClass> {
        if request.method != Method::GET {
            return None;
        }
        let url = &request.url;
        if url.origin() != self.policy.origin.origin() {
            let allowlisted = url.host_str().is_some_and(|h| self.policy.is_tile_server(h));
            return Some(match tile_zoom(url) {
                Some(zoom) if allowlisted => RequestClass::TileRequest { zoom },
                _ => RequestClass::ForeignOrigin,
            });
        }
        Some(if is_source_file(url) {
            RequestClass::SourceFile
        } else {
            RequestClass::DataFile
        })
    }

    /// Answer `request`, or `None` when it should go straight to the network.
    pub async fn handle(&self, request: &Request) -> Option<RoutedResponse> {
        let class = self.classify(request)?;
        debug!(url = %request.url, ?class, "Intercepted request");

        let routed = match class {
            RequestClass::ForeignOrigin => {
                self.network_first(request, &self.policy.cache_version, LookupOptions::default(), false)
                    .await
            }
            RequestClass::TileRequest { zoom } if !self.policy.should_cache_tile(zoom) => {
                match self.fetcher.fetch(request).await {
                    Ok(response) => RoutedResponse::new(response, ResponseSource::Network),
                    Err(e) => {
                        debug!(url = %request.url, zoom, error = %e, "Uncached tile unavailable");
                        RoutedResponse::placeholder()
                    }
                }
            }
            RequestClass::TileRequest { .. } => {
                let tiles = LookupOptions::in_generation(&self.policy.tile_cache);
                self.network_first(request, &self.policy.tile_cache, tiles, false)
                    .await
            }
            RequestClass::SourceFile => {
                let loose = LookupOptions::default().ignoring_query();
                self.network_first(request, &self.policy.cache_version, loose, true)
                    .await
            }
            RequestClass::DataFile => self.cache_first(request).await,
        };
        Some(routed)
    }

    async fn network_first(
        &self,
        request: &Request,
        generation: &str,
        fallback: LookupOptions<'_>,
        shell: bool,
    ) -> RoutedResponse {
        match self
            .cache
            .fetch_then_store(self.fetcher.as_ref(), request, generation)
            .await
        {
            Ok(response) => RoutedResponse::new(response, ResponseSource::Network),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                if let Some(cached) = self.lookup(&request.url, fallback).await {
                    debug!(url = %request.url, "Serving cached copy (offline)");
                    return RoutedResponse::new(cached, ResponseSource::Cache);
                }
                self.offline_fallback(request, shell).await
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> RoutedResponse {
        let loose = LookupOptions::default().ignoring_query();
        if let Some(cached) = self.lookup(&request.url, loose).await {
            debug!(url = %request.url, "Cache hit");
            return RoutedResponse::new(cached, ResponseSource::Cache);
        }
        match self
            .cache
            .fetch_then_store(self.fetcher.as_ref(), request, &self.policy.cache_version)
            .await
        {
            Ok(response) => RoutedResponse::new(response, ResponseSource::Network),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Offline and no cached copy");
                self.offline_fallback(request, true).await
            }
        }
    }

    async fn offline_fallback(&self, request: &Request, shell: bool) -> RoutedResponse {
        if shell && request.accepts_html() {
            if let Some(index) = self.lookup(&self.policy.app_shell, LookupOptions::default()).await {
                return RoutedResponse::new(index, ResponseSource::AppShell);
            }
        }
        RoutedResponse::placeholder()
    }

    async fn lookup(&self, url: &Url, options: LookupOptions<'_>) -> Option<Response> {
        match self.cache.lookup(url, options).await {
            Ok(found) => found,
            Err(e) => {
                warn!(url = %url, error = %e, "Cache lookup failed");
                None
            }
        }
    }
}
