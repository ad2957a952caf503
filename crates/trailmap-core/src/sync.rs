//! Delta sync of cached route files against the server manifest.
//!
//! The manifest (`/folder.json`) lists every route file with a category.
//! Sync computes two set differences between the URLs the manifest expects
//! (for the requested categories) and the URLs the cache holds, then deletes
//! the stale files and downloads the missing ones.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::ResourceCache;
use crate::config::Config;
use crate::error::{OfflineError, Result};
use crate::http::message::cache_key;
use crate::http::{Fetcher, Request, Response};
use crate::utils::file_name_from_url;

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ManifestEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub category: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncResult {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
    /// Files cached after the sync.
    pub total: usize,
}

/// What a sync would do, without doing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub to_add: usize,
    pub to_remove: usize,
    pub current_cached: usize,
    pub expected_total: usize,
    /// Decoded file names.
    pub new_files: Vec<String>,
    pub removed_files: Vec<String>,
}

/// Percent-encode a path the way browsers' `encodeURI` does: everything but
/// ASCII alphanumerics and `;,/?:@&=+$-_.!~*'()#` is escaped as UTF-8.
pub fn encode_uri(path: &str) -> String {
    const KEEP: &[u8] = b";,/?:@&=+$-_.!~*'()#";
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        if byte.is_ascii_alphanumeric() || KEEP.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub origin: Url,
    pub manifest_url: Url,
    /// Generation the synced files live in.
    pub generation: String,
    /// Only cached URLs ending with this take part in the delta.
    pub suffix: String,
    pub default_types: Vec<String>,
}

impl SyncPolicy {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            origin: config.origin_url()?,
            manifest_url: config.url_for(&config.manifest_path)?,
            generation: config.cache_version.clone(),
            suffix: config.sync_suffix.clone(),
            default_types: config.priority_types.clone(),
        })
    }

    /// Absolute URL a manifest path is loaded from.
    pub fn resource_url(&self, path: &str) -> Result<Url> {
        let relative = format!("/{}", encode_uri(path));
        self.origin
            .join(&relative)
            .map_err(|e| OfflineError::Manifest(format!("Invalid path {:?}: {}", path, e)))
    }
}

struct Delta {
    manifest: Response,
    expected: BTreeSet<String>,
    actual: BTreeSet<String>,
}

impl Delta {
    fn to_add(&self) -> Vec<String> {
        self.expected.difference(&self.actual).cloned().collect()
    }

    fn to_remove(&self) -> Vec<String> {
        self.actual.difference(&self.expected).cloned().collect()
    }
}

pub struct DeltaSyncEngine {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<ResourceCache>,
    policy: SyncPolicy,
}

impl DeltaSyncEngine {
    pub fn new(fetcher: Arc<dyn Fetcher>, cache: Arc<ResourceCache>, policy: SyncPolicy) -> Self {
        Self {
            fetcher,
            cache,
            policy,
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Fetch and parse the manifest, bypassing every cache.
    pub async fn fetch_manifest(&self) -> Result<(Response, Vec<ManifestEntry>)> {
        let url = &self.policy.manifest_url;
        let response = self
            .fetcher
            .fetch(&Request::get(url.clone()).no_store())
            .await
            .map_err(|e| OfflineError::Manifest(format!("Could not fetch {}: {}", url, e)))?;
        if !response.is_success() {
            return Err(OfflineError::Manifest(format!(
                "Could not fetch {}: HTTP {}",
                url,
                response.status()
            )));
        }
        let entries: Vec<ManifestEntry> = serde_json::from_slice(&response.body)
            .map_err(|e| OfflineError::Manifest(format!("Invalid manifest {}: {}", url, e)))?;
        Ok((response, entries))
    }

    async fn delta(&self, types: Option<&[String]>) -> Result<Delta> {
        let (manifest, entries) = self.fetch_manifest().await?;
        let types = types.unwrap_or(&self.policy.default_types);

        let mut expected = BTreeSet::new();
        for entry in entries.iter().filter(|e| types.contains(&e.category)) {
            expected.insert(cache_key(&self.policy.resource_url(&entry.path)?));
        }
        let actual: BTreeSet<String> = self
            .cache
            .keys(&self.policy.generation)
            .await
            .into_iter()
            .filter(|key| key.ends_with(&self.policy.suffix))
            .collect();

        debug!(
            manifest_entries = entries.len(),
            expected = expected.len(),
            cached = actual.len(),
            "Computed sync delta"
        );
        Ok(Delta {
            manifest,
            expected,
            actual,
        })
    }

    /// Bring the cache in line with the manifest for `types` (the priority
    /// categories when `None`).
    pub async fn compute_and_apply(&self, types: Option<&[String]>) -> Result<SyncResult> {
        info!("Starting delta sync");
        let delta = self.delta(types).await?;
        let to_add = delta.to_add();
        let to_remove = delta.to_remove();
        info!(to_add = to_add.len(), to_remove = to_remove.len(), "Delta sync");

        let generation = &self.policy.generation;
        for url in &to_remove {
            self.cache.delete(generation, url).await?;
            debug!(file = %file_name_from_url(url), "Removed");
        }

        let mut added = 0;
        let mut failed = 0;
        for url in &to_add {
            if self.add(url).await {
                added += 1;
            } else {
                failed += 1;
            }
        }

        self.cache
            .put(generation, &self.policy.manifest_url, &delta.manifest)
            .await?;

        let result = SyncResult {
            added,
            removed: to_remove.len(),
            failed,
            total: delta.actual.len() + added - to_remove.len(),
        };
        info!(?result, "Delta sync complete");
        Ok(result)
    }

    async fn add(&self, url: &str) -> bool {
        let request = match Url::parse(url) {
            Ok(url) => Request::get(url),
            Err(e) => {
                warn!(url, error = %e, "Invalid sync URL");
                return false;
            }
        };
        match self
            .cache
            .fetch_then_store(self.fetcher.as_ref(), &request, &self.policy.generation)
            .await
        {
            Ok(response) if response.is_cacheable() => {
                debug!(file = %file_name_from_url(url), "Added");
                true
            }
            Ok(response) => {
                warn!(file = %file_name_from_url(url), status = response.status(), "Sync download rejected");
                false
            }
            Err(e) => {
                warn!(file = %file_name_from_url(url), error = %e, "Sync download failed");
                false
            }
        }
    }

    /// The delta `compute_and_apply` would act on, without touching the cache.
    pub async fn compute_status_only(&self, types: Option<&[String]>) -> Result<SyncStatus> {
        let delta = self.delta(types).await?;
        let to_add = delta.to_add();
        let to_remove = delta.to_remove();
        let names = |urls: &[String]| -> Vec<String> { urls.iter().map(|u| file_name_from_url(u)).collect() };

        Ok(SyncStatus {
            to_add: to_add.len(),
            to_remove: to_remove.len(),
            current_cached: delta.actual.len(),
            expected_total: delta.expected.len(),
            new_files: names(&to_add),
            removed_files: names(&to_remove),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFetcher;
    use tempfile::TempDir;

    const MANIFEST_URL: &str = "http://localhost:8000/folder.json";

    struct Fixture {
        _dir: TempDir,
        fetcher: Arc<MockFetcher>,
        cache: Arc<ResourceCache>,
        engine: DeltaSyncEngine,
        generation: String,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let fetcher = Arc::new(MockFetcher::new());
        let cache = Arc::new(ResourceCache::open(dir.path()).await.unwrap());
        let engine = DeltaSyncEngine::new(
            fetcher.clone(),
            cache.clone(),
            SyncPolicy::from_config(&config).unwrap(),
        );
        Fixture {
            _dir: dir,
            fetcher,
            cache,
            engine,
            generation: config.cache_version,
        }
    }

    impl Fixture {
        async fn cached(&self, url: &str) {
            self.cache
                .put(&self.generation, &Url::parse(url).unwrap(), &Response::new(200, "gpx"))
                .await
                .unwrap();
        }
    }

    const MANIFEST: &str = r#"[
        {"path": "A.gpx", "type": "1-road"},
        {"path": "B.gpx", "type": "1-road"},
        {"path": "G.gpx", "type": "3-gravel"}
    ]"#;

    #[test]
    fn test_encode_uri() {
        assert_eq!(encode_uri("Lake Loop.gpx"), "Lake%20Loop.gpx");
        assert_eq!(encode_uri("routes/Café #1.gpx"), "routes/Caf%C3%A9%20#1.gpx");
        assert_eq!(encode_uri("100%.gpx"), "100%25.gpx");
        assert_eq!(encode_uri("a-b_c.d!~*'();,/?:@&=+$"), "a-b_c.d!~*'();,/?:@&=+$");
    }

    #[test]
    fn test_resource_url() {
        let policy = SyncPolicy::from_config(&Config::default()).unwrap();
        assert_eq!(
            policy.resource_url("gpx/Lake Loop.gpx").unwrap().as_str(),
            "http://localhost:8000/gpx/Lake%20Loop.gpx"
        );
    }

    #[tokio::test]
    async fn test_sync_adds_and_removes() {
        let f = fixture().await;
        f.fetcher.respond(MANIFEST_URL, 200, MANIFEST);
        f.fetcher.respond("http://localhost:8000/B.gpx", 200, "b");
        f.cached("http://localhost:8000/A.gpx").await;
        f.cached("http://localhost:8000/D.gpx").await;
        f.cached("http://localhost:8000/style.css").await;

        let result = f.engine.compute_and_apply(None).await.unwrap();

        assert_eq!(
            result,
            SyncResult {
                added: 1,
                removed: 1,
                failed: 0,
                total: 2
            }
        );
        assert_eq!(
            f.cache.keys(&f.generation).await,
            vec![
                "http://localhost:8000/A.gpx".to_string(),
                "http://localhost:8000/B.gpx".to_string(),
                MANIFEST_URL.to_string(),
                "http://localhost:8000/style.css".to_string(),
            ]
        );

        let manifest_request = &f.fetcher.requests()[0];
        assert_eq!(manifest_request.url.as_str(), MANIFEST_URL);
        assert_eq!(manifest_request.cache_mode, crate::http::CacheMode::NoStore);
    }

    #[tokio::test]
    async fn test_failed_download_is_counted() {
        let f = fixture().await;
        f.fetcher.respond(MANIFEST_URL, 200, MANIFEST);
        f.fetcher.fail("http://localhost:8000/A.gpx");
        f.fetcher.respond("http://localhost:8000/B.gpx", 500, "boom");

        let result = f.engine.compute_and_apply(None).await.unwrap();
        assert_eq!(result.added, 0);
        assert_eq!(result.failed, 2);
        assert_eq!(result.total, 0);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let f = fixture().await;
        f.fetcher.respond(MANIFEST_URL, 200, MANIFEST);
        f.fetcher.respond("http://localhost:8000/G.gpx", 200, "g");
        f.cached("http://localhost:8000/A.gpx").await;

        let types = vec!["3-gravel".to_string()];
        let result = f.engine.compute_and_apply(Some(&types)).await.unwrap();
        assert_eq!(
            result,
            SyncResult {
                added: 1,
                removed: 1,
                failed: 0,
                total: 1
            }
        );
    }

    #[tokio::test]
    async fn test_status_only_does_not_mutate() {
        let f = fixture().await;
        f.fetcher.respond(
            MANIFEST_URL,
            200,
            r#"[{"path": "Lake Loop.gpx", "type": "0-route"}]"#,
        );
        f.cached("http://localhost:8000/Old%20Trail.gpx").await;

        let status = f.engine.compute_status_only(None).await.unwrap();

        assert_eq!(status.to_add, 1);
        assert_eq!(status.to_remove, 1);
        assert_eq!(status.current_cached, 1);
        assert_eq!(status.expected_total, 1);
        assert_eq!(status.new_files, vec!["Lake Loop.gpx".to_string()]);
        assert_eq!(status.removed_files, vec!["Old Trail.gpx".to_string()]);
        assert_eq!(
            f.cache.keys(&f.generation).await,
            vec!["http://localhost:8000/Old%20Trail.gpx".to_string()]
        );
        assert_eq!(f.fetcher.request_count(), 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["toAdd"], 1);
        assert_eq!(json["newFiles"][0], "Lake Loop.gpx");
    }

    #[tokio::test]
    async fn test_manifest_failures() {
        let f = fixture().await;

        f.fetcher.respond(MANIFEST_URL, 500, "oops");
        let err = f.engine.compute_and_apply(None).await.unwrap_err();
        assert!(matches!(err, OfflineError::Manifest(_)));

        f.fetcher.respond(MANIFEST_URL, 200, "not json");
        let err = f.engine.compute_status_only(None).await.unwrap_err();
        assert!(matches!(err, OfflineError::Manifest(_)));

        f.fetcher.set_offline(true);
        let err = f.engine.compute_and_apply(None).await.unwrap_err();
        assert!(matches!(err, OfflineError::Manifest(_)));
        assert_eq!(f.cache.entry_count(&f.generation).await, 0);
    }
}
