//! Progress notifications for tile downloads.
//!
//! Notifications are fire-and-forget: they go out on a broadcast channel and
//! a send with no subscribers is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the notification channel. Slow subscribers lag and skip
/// notifications instead of blocking the download workers.
const CHANNEL_CAPACITY: usize = 256;

/// Counters of the batch currently being saved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub storage_size: usize,
    pub length_to_be_saved: usize,
    pub length_saved: usize,
    pub length_loaded: usize,
    pub length_failed: usize,
    /// Tiles not yet picked up by a worker.
    pub pending_queue: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    SaveStart(DownloadProgress),
    TileLoaded(DownloadProgress),
    TileSaved(DownloadProgress),
    LoadEnd(DownloadProgress),
    SaveEnd(DownloadProgress),
    #[serde(rename_all = "camelCase")]
    StorageSize { storage_size: usize },
    TilesRemoved,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            trace!("Notification dropped - no subscribers");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
