// Versioned store of captured HTTP responses.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{OfflineError, Result};
use crate::http::message::{cache_key, cache_key_without_query};
use crate::http::{Fetcher, NetworkError, Request, Response, ResponseHead};
use crate::utils::format_age;
use crate::utils::fs::{
    ensure_dir, hashed_name, list_json_files, read_optional, remove_if_exists, write_atomic,
};

/// Metadata persisted next to each cached body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub url: String,
    pub head: ResponseHead,
    pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn age_display(&self) -> String {
        format_age(self.cached_at)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions<'a> {
    /// Match entries whose URL differs only in the query string.
    pub ignore_query_string: bool,
    /// Restrict the search to one generation; `None` searches all of them.
    pub generation: Option<&'a str>,
}

impl<'a> LookupOptions<'a> {
    pub fn in_generation(generation: &'a str) -> Self {
        Self {
            generation: Some(generation),
            ..Self::default()
        }
    }

    pub fn ignoring_query(mut self) -> Self {
        self.ignore_query_string = true;
        self
    }
}

#[derive(Debug, Clone)]
struct IndexedEntry {
    entry: CachedEntry,
    without_query: String,
}

impl IndexedEntry {
    fn new(entry: CachedEntry) -> Self {
        let without_query = Url::parse(&entry.url)
            .map(|u| cache_key_without_query(&u))
            .unwrap_or_else(|_| entry.url.clone());
        Self {
            entry,
            without_query,
        }
    }
}

type GenerationIndex = BTreeMap<String, IndexedEntry>;

/// Responses keyed by request URL, grouped into named generations.
///
/// Layout on disk:
///
/// ```text
/// <root>/<generation>/<blake3(url)>.json   # CachedEntry
/// <root>/<generation>/<blake3(url)>.body   # response body
/// ```
pub struct ResourceCache {
    root: PathBuf,
    generations: RwLock<BTreeMap<String, GenerationIndex>>,
}

impl ResourceCache {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_dir(&root).await?;

        let mut generations = BTreeMap::new();
        let mut dirs = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| OfflineError::storage(&root, e))?;
        while let Some(dir) = dirs
            .next_entry()
            .await
            .map_err(|e| OfflineError::storage(&root, e))?
        {
            let path = dir.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let is_dir = dir.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || Self::validate_generation(&name).is_err() {
                continue;
            }
            generations.insert(name, Self::load_generation(&path).await?);
        }

        info!(
            root = %root.display(),
            generations = generations.len(),
            "Resource cache opened"
        );
        Ok(Self {
            root,
            generations: RwLock::new(generations),
        })
    }

    async fn load_generation(dir: &Path) -> Result<GenerationIndex> {
        let mut index = GenerationIndex::new();
        for path in list_json_files(dir).await? {
            let Some(bytes) = read_optional(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<CachedEntry>(&bytes) {
                Ok(entry) => {
                    index.insert(entry.url.clone(), IndexedEntry::new(entry));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(index)
    }

    fn validate_generation(tag: &str) -> Result<()> {
        let valid = !tag.is_empty()
            && tag != "."
            && tag != ".."
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(OfflineError::Validation(format!("Invalid cache generation name: {:?}", tag)))
        }
    }

    fn entry_paths(&self, generation: &str, key: &str) -> (PathBuf, PathBuf) {
        let dir = self.root.join(generation);
        let name = hashed_name(key);
        (
            dir.join(format!("{}.json", name)),
            dir.join(format!("{}.body", name)),
        )
    }

    /// Store `response` for `url` in `generation`, replacing any previous entry.
    pub async fn put(&self, generation: &str, url: &Url, response: &Response) -> Result<()> {
        Self::validate_generation(generation)?;
        let key = cache_key(url);
        let entry = CachedEntry {
            url: key.clone(),
            head: response.head.clone(),
            cached_at: Utc::now(),
        };
        let meta = serde_json::to_vec(&entry)?;
        let (meta_path, body_path) = self.entry_paths(generation, &key);

        let mut generations = self.generations.write().await;
        ensure_dir(&self.root.join(generation)).await?;
        write_atomic(&body_path, &response.body).await?;
        write_atomic(&meta_path, &meta).await?;
        generations
            .entry(generation.to_string())
            .or_default()
            .insert(key, IndexedEntry::new(entry));
        Ok(())
    }

    /// Fetch `request`; keep a copy under `generation` when the status is in
    /// [200, 400). The response is returned either way. Network errors
    /// propagate; a failure to store is logged and does not fail the fetch.
    pub async fn fetch_then_store(
        &self,
        fetcher: &dyn Fetcher,
        request: &Request,
        generation: &str,
    ) -> std::result::Result<Response, NetworkError> {
        let response = fetcher.fetch(request).await?;
        if response.is_cacheable() {
            if let Err(e) = self.put(generation, &request.url, &response).await {
                warn!(url = %request.url, generation, error = %e, "Failed to cache response");
            }
        } else {
            debug!(url = %request.url, status = response.status(), "Response not cacheable");
        }
        Ok(response)
    }

    /// Generation and entry that answer `url` under `options`.
    fn find<'g>(
        generations: &'g BTreeMap<String, GenerationIndex>,
        url: &Url,
        options: LookupOptions<'_>,
    ) -> Option<(&'g str, &'g CachedEntry)> {
        let key = cache_key(url);
        let without_query = cache_key_without_query(url);
        for (name, index) in generations {
            if options.generation.is_some_and(|g| g != name.as_str()) {
                continue;
            }
            let hit = index.get(&key).or_else(|| {
                options
                    .ignore_query_string
                    .then(|| index.values().find(|e| e.without_query == without_query))
                    .flatten()
            });
            if let Some(hit) = hit {
                return Some((name.as_str(), &hit.entry));
            }
        }
        None
    }

    /// Find a cached response for `url`.
    pub async fn lookup(&self, url: &Url, options: LookupOptions<'_>) -> Result<Option<Response>> {
        let generations = self.generations.read().await;
        let Some((generation, entry)) = Self::find(&generations, url, options) else {
            return Ok(None);
        };
        // Read under the guard so a concurrent put can't swap the body.
        let (_, body_path) = self.entry_paths(generation, &entry.url);
        match read_optional(&body_path).await? {
            Some(body) => Ok(Some(Response {
                head: entry.head.clone(),
                body: Bytes::from(body),
            })),
            None => {
                warn!(url = %entry.url, generation = %generation, "Cached body missing on disk");
                Ok(None)
            }
        }
    }

    /// Metadata of the entry `lookup` would serve, without reading the body.
    pub async fn lookup_entry(&self, url: &Url, options: LookupOptions<'_>) -> Option<CachedEntry> {
        let generations = self.generations.read().await;
        Self::find(&generations, url, options).map(|(_, entry)| entry.clone())
    }

    /// Remove the entry stored under `url` (a cache key) from `generation`.
    pub async fn delete(&self, generation: &str, url: &str) -> Result<bool> {
        let mut generations = self.generations.write().await;
        let Some(index) = generations.get_mut(generation) else {
            return Ok(false);
        };
        let existed = index.remove(url).is_some();
        let (meta_path, body_path) = self.entry_paths(generation, url);
        remove_if_exists(&meta_path).await?;
        remove_if_exists(&body_path).await?;
        Ok(existed)
    }

    /// Cached URLs of `generation`, sorted.
    pub async fn keys(&self, generation: &str) -> Vec<String> {
        let generations = self.generations.read().await;
        generations
            .get(generation)
            .map(|index| index.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn entry_count(&self, generation: &str) -> usize {
        let generations = self.generations.read().await;
        generations.get(generation).map(|i| i.len()).unwrap_or(0)
    }

    pub async fn generations(&self) -> Vec<String> {
        self.generations.read().await.keys().cloned().collect()
    }

    pub async fn delete_generation(&self, generation: &str) -> Result<bool> {
        Self::validate_generation(generation)?;
        let mut generations = self.generations.write().await;
        let existed = generations.remove(generation).is_some();
        let dir = self.root.join(generation);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OfflineError::storage(&dir, e)),
        }
        Ok(existed)
    }

    /// Delete every generation not named in `keep`. Returns the deleted names.
    pub async fn purge_generations_except(&self, keep: &HashSet<String>) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .generations()
            .await
            .into_iter()
            .filter(|g| !keep.contains(g))
            .collect();
        for generation in &stale {
            info!(generation = %generation, "Deleting old cache generation");
            self.delete_generation(generation).await?;
        }
        Ok(stale)
    }
}

// ============================================================================
// Tests
// ============================================================================
