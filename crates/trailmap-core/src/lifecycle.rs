//! Install / activate / message lifecycle of the offline host.
//!
//! `OfflineHost` owns the shared resource cache and wires the router and
//! the sync engine to it. A host goes through three states:
//!
//! - `Installing`: the static assets and priority route files are pre-cached.
//! - `Installed`: waiting to take over (`SKIP_WAITING` or `activate`).
//!   `SKIP_WAITING` activates from any state but `Installing`.
//! - `Activated`: superseded cache generations have been deleted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::ResourceCache;
use crate::config::Config;
use crate::error::Result;
use crate::http::{Fetcher, HttpClient, Request};
use crate::router::{InterceptionRouter, RouterPolicy};
use crate::sync::{DeltaSyncEngine, SyncPolicy, SyncResult, SyncStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Constructed, install not run yet.
    Registered,
    Installing,
    Installed,
    Activated,
}

/// Outcome of [`OfflineHost::install`]. Failures are counted, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub precached: usize,
    pub precache_failed: usize,
    pub manifest_available: bool,
    pub routes_cached: usize,
    pub routes_failed: usize,
}

/// Messages a client can post to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleMessage {
    SkipWaiting,
    SyncGpx {
        #[serde(default)]
        types: Option<Vec<String>>,
    },
    GetSyncStatus {
        #[serde(default)]
        types: Option<Vec<String>>,
    },
}

/// Reply to a [`LifecycleMessage`]: `{"success": true, ...payload}` or
/// `{"success": false, "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub sync: Option<SyncResult>,
    #[serde(flatten)]
    pub status: Option<SyncStatus>,
}

impl LifecycleReply {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
            sync: None,
            status: None,
        }
    }

    fn synced(result: SyncResult) -> Self {
        Self {
            sync: Some(result),
            ..Self::ok()
        }
    }

    fn status(status: SyncStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::ok()
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::ok()
        }
    }
}

pub struct OfflineHost {
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<ResourceCache>,
    router: InterceptionRouter,
    sync: DeltaSyncEngine,
    state: Mutex<HostState>,
}

impl OfflineHost {
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>, cache: Arc<ResourceCache>) -> Result<Self> {
        let router = InterceptionRouter::new(
            fetcher.clone(),
            cache.clone(),
            RouterPolicy::from_config(&config)?,
        );
        let sync = DeltaSyncEngine::new(fetcher.clone(), cache.clone(), SyncPolicy::from_config(&config)?);
        Ok(Self {
            config,
            fetcher,
            cache,
            router,
            sync,
            state: Mutex::new(HostState::Registered),
        })
    }

    /// Host on the real network, caching under `config.resources_dir()`.
    pub async fn open(config: Config) -> Result<Self> {
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpClient::new(config.request_timeout())?);
        let cache = Arc::new(ResourceCache::open(config.resources_dir()?).await?);
        Self::new(config, fetcher, cache)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn router(&self) -> &InterceptionRouter {
        &self.router
    }

    pub fn state(&self) -> HostState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: HostState) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = next;
    }

    /// Fetch `path` into the current generation. True when a copy was kept.
    async fn precache_one(&self, url: url::Url) -> bool {
        let request = Request::get(url);
        match self
            .cache
            .fetch_then_store(self.fetcher.as_ref(), &request, &self.config.cache_version)
            .await
        {
            Ok(response) if response.is_cacheable() => true,
            Ok(response) => {
                warn!(url = %request.url, status = response.status(), "Not cached");
                false
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network error while pre-caching");
                false
            }
        }
    }

    /// Pre-cache the static assets, then the priority route files from the
    /// manifest.
    pub async fn install(&self) -> Result<InstallReport> {
        self.set_state(HostState::Installing);
        info!(generation = %self.config.cache_version, "Installing");

        let mut assets = Vec::with_capacity(self.config.precache.len());
        for path in &self.config.precache {
            assets.push(self.config.url_for(path)?);
        }
        let results = join_all(assets.into_iter().map(|url| self.precache_one(url))).await;
        let precached = results.iter().filter(|ok| **ok).count();
        let mut report = InstallReport {
            precached,
            precache_failed: results.len() - precached,
            ..InstallReport::default()
        };
        info!(cached = report.precached, failed = report.precache_failed, "Essential files cached");

        match self.sync.fetch_manifest().await {
            Ok((manifest, entries)) => {
                report.manifest_available = true;
                let policy = self.sync.policy();
                if let Err(e) = self
                    .cache
                    .put(&self.config.cache_version, &policy.manifest_url, &manifest)
                    .await
                {
                    warn!(error = %e, "Failed to cache manifest");
                }
                let mut routes = Vec::new();
                for entry in entries
                    .iter()
                    .filter(|e| policy.default_types.contains(&e.category))
                {
                    routes.push(policy.resource_url(&entry.path)?);
                }
                info!(routes = routes.len(), "Caching priority routes");
                let results = join_all(routes.into_iter().map(|url| self.precache_one(url))).await;
                report.routes_cached = results.iter().filter(|ok| **ok).count();
                report.routes_failed = results.len() - report.routes_cached;
            }
            Err(e) => warn!(error = %e, "Could not fetch manifest, skipping route pre-cache"),
        }

        self.set_state(HostState::Installed);
        info!(?report, "Installation complete");
        Ok(report)
    }

    /// Delete every generation but the current one and the tile generation.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let keep: HashSet<String> = [self.config.cache_version.clone(), self.config.tile_cache.clone()]
            .into_iter()
            .collect();
        let deleted = self.cache.purge_generations_except(&keep).await?;
        self.set_state(HostState::Activated);
        info!(deleted = deleted.len(), "Activated");
        Ok(deleted)
    }

    pub async fn handle_message(&self, message: LifecycleMessage) -> LifecycleReply {
        match message {
            LifecycleMessage::SkipWaiting => {
                if self.state() == HostState::Installing {
                    return LifecycleReply::failed("Installation in progress");
                }
                match self.activate().await {
                    Ok(_) => LifecycleReply::ok(),
                    Err(e) => LifecycleReply::failed(e),
                }
            }
            LifecycleMessage::SyncGpx { types } => {
                match self.sync.compute_and_apply(types.as_deref()).await {
                    Ok(result) => LifecycleReply::synced(result),
                    Err(e) => {
                        warn!(error = %e, "Delta sync failed");
                        LifecycleReply::failed(e)
                    }
                }
            }
            LifecycleMessage::GetSyncStatus { types } => {
                match self.sync.compute_status_only(types.as_deref()).await {
                    Ok(status) => LifecycleReply::status(status),
                    Err(e) => LifecycleReply::failed(e),
                }
            }
        }
    }

    /// Parse a JSON message and handle it.
    pub async fn handle_json(&self, message: &str) -> LifecycleReply {
        match serde_json::from_str::<LifecycleMessage>(message) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => LifecycleReply::failed(format!("Invalid message: {}", e)),
        }
    }
}
