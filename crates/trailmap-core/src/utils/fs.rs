//! Filesystem helpers shared by the tile store and the resource cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;

use crate::error::{OfflineError, Result};

/// Distinguishes temp files of concurrent writers targeting the same path.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File stem for a storage key: hex BLAKE3 digest, safe on every filesystem.
pub fn hashed_name(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Write `content` to `path` through a temp file and a rename, so readers
/// see either the old or the new file, never a partial one.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = path.with_extension(format!("{}.{}.tmp", std::process::id(), n));

    fs::write(&temp_path, content)
        .await
        .map_err(|e| OfflineError::storage(&temp_path, e))?;

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(OfflineError::storage(path, e));
    }

    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OfflineError::storage(path, e)),
    }
}

/// Remove a file, ignoring "not found".
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OfflineError::storage(path, e)),
    }
}

pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| OfflineError::storage(path, e))
}

/// Paths of all `*.json` metadata files directly inside `dir`.
pub async fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| OfflineError::storage(dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| OfflineError::storage(dir, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
