//! Persistent key-value store for downloaded tiles.
//!
//! Each record is two files in the store directory, named by the BLAKE3
//! hash of the tile key:
//!
//! ```text
//! <dir>/<hash>.json   # TileDescriptor (key, url, urlTemplate, x, y, z, createdAt)
//! <dir>/<hash>.blob   # raw image bytes
//! ```
//!
//! The descriptors are indexed in memory when the store is opened. Writers
//! hold the index lock while touching the files of a key, so operations on
//! the same key are linearized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::codec::TileDescriptor;
use crate::error::{OfflineError, Result};
use crate::utils::fs::{
    ensure_dir, hashed_name, list_json_files, read_optional, remove_if_exists, write_atomic,
};

/// A stored tile: metadata plus image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub descriptor: TileDescriptor,
    pub blob: Bytes,
}

impl TileRecord {
    pub fn new(descriptor: TileDescriptor, blob: impl Into<Bytes>) -> Self {
        Self {
            descriptor,
            blob: blob.into(),
        }
    }
}

pub struct TileStore {
    dir: PathBuf,
    index: RwLock<HashMap<String, TileDescriptor>>,
}

impl TileStore {
    /// Open (or create) the store in `dir` and index the records on disk.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir).await?;

        let mut index = HashMap::new();
        for path in list_json_files(&dir).await? {
            match Self::load_descriptor(&path).await {
                Ok(Some(descriptor)) => {
                    index.insert(descriptor.key.clone(), descriptor);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable tile record"),
            }
        }
        info!(dir = %dir.display(), tiles = index.len(), "Tile store opened");

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    async fn load_descriptor(path: &Path) -> Result<Option<TileDescriptor>> {
        let Some(bytes) = read_optional(path).await? else {
            return Ok(None);
        };
        let descriptor: TileDescriptor = serde_json::from_slice(&bytes)?;
        // A record whose file name doesn't match its key was written by
        // something else; leave it alone.
        let expected = hashed_name(&descriptor.key);
        if path.file_stem().and_then(|s| s.to_str()) != Some(expected.as_str()) {
            return Ok(None);
        }
        Ok(Some(descriptor))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hashed_name(key)))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.blob", hashed_name(key)))
    }

    fn validate(descriptor: &TileDescriptor) -> Result<()> {
        let required = [
            ("urlTemplate", &descriptor.url_template),
            ("key", &descriptor.key),
            ("url", &descriptor.url),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(OfflineError::missing(field));
            }
        }
        Ok(())
    }

    /// Insert or replace the record stored under `record.descriptor.key`.
    pub async fn put(&self, record: &TileRecord) -> Result<()> {
        Self::validate(&record.descriptor)?;
        let key = &record.descriptor.key;
        let meta = serde_json::to_vec(&record.descriptor)?;

        let mut index = self.index.write().await;
        write_atomic(&self.blob_path(key), &record.blob).await?;
        write_atomic(&self.meta_path(key), &meta).await?;
        index.insert(key.clone(), record.descriptor.clone());
        debug!(key = %key, bytes = record.blob.len(), "Tile saved");
        Ok(())
    }

    /// Image bytes for `key`, if stored.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get_record(key).await?.map(|record| record.blob))
    }

    pub async fn get_record(&self, key: &str) -> Result<Option<TileRecord>> {
        let index = self.index.read().await;
        let Some(descriptor) = index.get(key) else {
            return Ok(None);
        };
        match read_optional(&self.blob_path(key)).await? {
            Some(blob) => Ok(Some(TileRecord::new(descriptor.clone(), blob))),
            None => {
                warn!(key = %key, "Tile blob missing on disk");
                Ok(None)
            }
        }
    }

    /// Remove one tile. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut index = self.index.write().await;
        let existed = index.remove(key).is_some();
        remove_if_exists(&self.meta_path(key)).await?;
        remove_if_exists(&self.blob_path(key)).await?;
        Ok(existed)
    }

    /// Remove every tile.
    pub async fn clear(&self) -> Result<()> {
        let mut index = self.index.write().await;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OfflineError::storage(&self.dir, e)),
        }
        ensure_dir(&self.dir).await?;
        let removed = index.len();
        index.clear();
        info!(removed, "Tile store cleared");
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.index.read().await.len()
    }

    /// Metadata of every tile saved from `url_template`, ordered by z, y, x.
    pub async fn find_info_by_template(&self, url_template: &str) -> Vec<TileDescriptor> {
        let index = self.index.read().await;
        let mut tiles: Vec<TileDescriptor> = index
            .values()
            .filter(|d| d.url_template == url_template)
            .cloned()
            .collect();
        tiles.sort_by_key(|d| (d.z, d.y, d.x));
        tiles
    }

    /// Every tile saved from `url_template`, blobs included, ordered by z, y, x.
    pub async fn find_by_template(&self, url_template: &str) -> Result<Vec<TileRecord>> {
        let mut records = Vec::new();
        for descriptor in self.find_info_by_template(url_template).await {
            if let Some(record) = self.get_record(&descriptor.key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::codec::{TileCoord, TileLayer};
    use tempfile::TempDir;

    const TEMPLATE: &str = "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png";

    fn record(x: i64, y: i64, z: u32, blob: &'static [u8]) -> TileRecord {
        let descriptor = TileLayer::new(TEMPLATE)
            .tile_descriptor(TileCoord::new(x, y, z))
            .unwrap();
        TileRecord::new(descriptor, Bytes::from_static(blob))
    }

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = TileStore::open(dir.path()).await.unwrap();
        let rec = record(1, 2, 3, b"png-bytes");

        store.put(&rec).await.unwrap();
        assert_eq!(store.get(&rec.descriptor.key).await.unwrap(), Some(rec.blob.clone()));
        assert_eq!(store.count().await, 1);

        assert!(store.delete(&rec.descriptor.key).await.unwrap());
        assert_eq!(store.get(&rec.descriptor.key).await.unwrap(), None);
        assert!(!store.delete(&rec.descriptor.key).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_overwrites_same_key() {
        let dir = TempDir::new().unwrap();
        let store = TileStore::open(dir.path()).await.unwrap();

        store.put(&record(1, 2, 3, b"old")).await.unwrap();
        store.put(&record(1, 2, 3, b"new")).await.unwrap();

        assert_eq!(store.count().await, 1);
        let key = record(1, 2, 3, b"").descriptor.key;
        assert_eq!(store.get(&key).await.unwrap(), Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_put_rejects_missing_fields() {
        let dir = TempDir::new().unwrap();
        let store = TileStore::open(dir.path()).await.unwrap();

        let mut rec = record(1, 2, 3, b"x");
        rec.descriptor.url.clear();
        let err = store.put(&rec).await.unwrap_err();
        assert!(matches!(err, OfflineError::Validation(ref msg) if msg == "Missing url prop"));

        let mut rec = record(1, 2, 3, b"x");
        rec.descriptor.url_template.clear();
        assert!(matches!(store.put(&rec).await, Err(OfflineError::Validation(_))));
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = TileStore::open(dir.path()).await.unwrap();
        store.put(&record(1, 1, 1, b"a")).await.unwrap();
        store.put(&record(2, 1, 1, b"b")).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.count().await, 0);
        store.clear().await.unwrap();
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_reopen_restores_index() {
        let dir = TempDir::new().unwrap();
        let rec = record(5, 6, 7, b"persisted");
        {
            let store = TileStore::open(dir.path()).await.unwrap();
            store.put(&rec).await.unwrap();
        }
        let store = TileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.count().await, 1);
        assert_eq!(store.get(&rec.descriptor.key).await.unwrap(), Some(rec.blob));
    }

    #[tokio::test]
    async fn test_find_by_template_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let store = TileStore::open(dir.path()).await.unwrap();
        store.put(&record(2, 0, 5, b"c")).await.unwrap();
        store.put(&record(1, 0, 5, b"b")).await.unwrap();
        store.put(&record(9, 9, 4, b"a")).await.unwrap();

        let other = TileLayer::new("https://tiles.example/{z}/{x}/{y}.png")
            .tile_descriptor(TileCoord::new(0, 0, 1))
            .unwrap();
        store.put(&TileRecord::new(other, Bytes::from_static(b"z"))).await.unwrap();

        let found = store.find_by_template(TEMPLATE).await.unwrap();
        let coords: Vec<(u32, i64, i64)> = found
            .iter()
            .map(|r| (r.descriptor.z, r.descriptor.y, r.descriptor.x))
            .collect();
        assert_eq!(coords, vec![(4, 9, 9), (5, 0, 1), (5, 0, 2)]);
        assert_eq!(found[0].blob, Bytes::from_static(b"a"));
    }
}
