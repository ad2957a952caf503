//! Bulk tile downloads ("save this view") with bounded concurrency.
//!
//! A batch is a list of tile descriptors. `min(limit, n)` workers share one
//! queue; each worker pops a tile, fetches it, saves it and pops the next one
//! until the queue is empty. Progress counters are published through the
//! [`Notifier`] after every step.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{OfflineError, Result};
use crate::http::{Fetcher, NetworkError, Request};
use crate::notify::{DownloadProgress, Notification, Notifier};
use crate::tiles::{LatLngBounds, TileCoord, TileDescriptor, TileLayer, TileRecord, TileStore};

// ============================================================================
// Constants
// ============================================================================

/// Lowest zoom "save what you see" accepts, so nobody downloads the world.
pub const MIN_SAVE_ZOOM: u32 = 5;

/// Default number of concurrent tile downloads.
pub const DEFAULT_PARALLEL: usize = 50;

/// Default highest zoom for "save what you see".
pub const DEFAULT_MAX_ZOOM: u32 = 19;

/// Decides whether a batch (or a removal) may proceed, given the counters it
/// is about to start with.
pub type ConfirmGate = Arc<dyn Fn(&DownloadProgress) -> bool + Send + Sync>;

/// Which zoom levels of a region to save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoomSelection {
    Levels(Vec<u32>),
    /// Everything from the current zoom up to the configured maximum.
    SaveWhatYouSee { current_zoom: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The confirmation gate said no; nothing was touched.
    Declined,
    Completed(DownloadProgress),
}

#[derive(Clone)]
pub struct DownloadOptions {
    pub parallel: usize,
    /// Fetch every tile even if the store already has it.
    pub always_download: bool,
    pub max_zoom: u32,
    pub confirm: Option<ConfirmGate>,
    pub confirm_removal: Option<ConfirmGate>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL,
            always_download: true,
            max_zoom: DEFAULT_MAX_ZOOM,
            confirm: None,
            confirm_removal: None,
        }
    }
}

impl DownloadOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parallel: config.parallel,
            always_download: config.always_download,
            max_zoom: config.max_zoom,
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("parallel", &self.parallel)
            .field("always_download", &self.always_download)
            .field("max_zoom", &self.max_zoom)
            .field("confirm", &self.confirm.is_some())
            .field("confirm_removal", &self.confirm_removal.is_some())
            .finish()
    }
}

pub struct BulkDownloadCoordinator {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<TileStore>,
    notifier: Notifier,
    options: DownloadOptions,
    status: Mutex<DownloadProgress>,
    saving: AtomicBool,
}

impl BulkDownloadCoordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<TileStore>,
        notifier: Notifier,
        options: DownloadOptions,
    ) -> Self {
        Self {
            fetcher,
            store,
            notifier,
            options,
            status: Mutex::new(DownloadProgress::default()),
            saving: AtomicBool::new(false),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Snapshot of the current (or last) batch counters.
    pub fn status(&self) -> DownloadProgress {
        self.update(|_| {})
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    /// Apply `f` to the counters and return the result. The lock is never
    /// held across an await.
    fn update(&self, f: impl FnOnce(&mut DownloadProgress)) -> DownloadProgress {
        let mut status = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut status);
        *status
    }

    /// Tiles covering `bounds` at every zoom of `selection`.
    pub fn plan_region(
        &self,
        layer: &TileLayer,
        bounds: &LatLngBounds,
        selection: &ZoomSelection,
    ) -> Result<Vec<TileDescriptor>> {
        let levels: Vec<u32> = match selection {
            ZoomSelection::Levels(levels) => levels.clone(),
            ZoomSelection::SaveWhatYouSee { current_zoom } => {
                if *current_zoom < MIN_SAVE_ZOOM {
                    return Err(OfflineError::Validation(format!(
                        "It's not possible to save with zoom below level {}.",
                        MIN_SAVE_ZOOM
                    )));
                }
                (*current_zoom..=self.options.max_zoom).collect()
            }
        };

        let mut tiles = Vec::new();
        for zoom in levels {
            tiles.extend(layer.expand_region_to_tiles(&bounds.to_pixel_bounds(zoom), zoom)?);
        }
        Ok(tiles)
    }

    /// Download and store `tiles` with at most `concurrency_limit` fetches in
    /// flight. Individual tile failures are logged and counted; they never
    /// abort the batch.
    pub async fn start_batch(&self, tiles: Vec<TileDescriptor>, concurrency_limit: usize) -> BatchOutcome {
        let total = tiles.len();
        let preview = DownloadProgress {
            storage_size: self.status().storage_size,
            length_to_be_saved: total,
            pending_queue: total,
            ..DownloadProgress::default()
        };
        if let Some(confirm) = &self.options.confirm {
            if !confirm(&preview) {
                info!(tiles = total, "Tile save declined");
                return BatchOutcome::Declined;
            }
        }

        let start = self.update(|status| *status = preview);
        self.saving.store(true, Ordering::SeqCst);
        self.notifier.emit(Notification::SaveStart(start));

        let workers = concurrency_limit.max(1).min(total);
        info!(tiles = total, workers, "Saving tiles");

        let queue = Mutex::new(VecDeque::from(tiles));
        join_all((0..workers).map(|_| self.worker(&queue))).await;

        self.saving.store(false, Ordering::SeqCst);
        let done = self.status();
        self.notifier.emit(Notification::LoadEnd(done));
        self.notifier.emit(Notification::SaveEnd(done));
        self.storage_size().await;

        let done = self.status();
        info!(
            saved = done.length_saved,
            failed = done.length_failed,
            stored = done.storage_size,
            "Tile save complete"
        );
        BatchOutcome::Completed(done)
    }

    async fn worker(&self, queue: &Mutex<VecDeque<TileDescriptor>>) {
        loop {
            let next = {
                let mut queue = match queue.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let tile = queue.pop_front();
                let remaining = queue.len();
                tile.map(|tile| (tile, remaining))
            };
            let Some((tile, remaining)) = next else {
                return;
            };
            self.update(|status| status.pending_queue = remaining);
            self.process(tile).await;
        }
    }

    async fn process(&self, tile: TileDescriptor) {
        let blob = match self.load(&tile).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(url = %tile.url, error = %e, "Tile download failed");
                self.update(|status| status.length_failed += 1);
                return;
            }
        };

        let loaded = self.update(|status| status.length_loaded += 1);
        self.notifier.emit(Notification::TileLoaded(loaded));

        match self.store.put(&TileRecord::new(tile, blob)).await {
            Ok(()) => {
                let saved = self.update(|status| status.length_saved += 1);
                self.notifier.emit(Notification::TileSaved(saved));
            }
            Err(e) => {
                warn!(error = %e, "Tile save failed");
                self.update(|status| status.length_failed += 1);
            }
        }
    }

    async fn load(&self, tile: &TileDescriptor) -> Result<Bytes> {
        if !self.options.always_download {
            if let Some(blob) = self.store.get(&tile.key).await? {
                debug!(key = %tile.key, "Tile already stored");
                return Ok(blob);
            }
        }
        self.download(&tile.url).await
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        let url = url::Url::parse(url)
            .map_err(|e| NetworkError::InvalidRequest(format!("{}: {}", url, e)))?;
        let response = self.fetcher.fetch(&Request::get(url)).await?;
        if !response.is_success() {
            return Err(NetworkError::from_status(response.status(), &response.text()).into());
        }
        Ok(response.body)
    }

    /// Remove every stored tile. Returns false when the removal gate declines.
    pub async fn clear_all(&self) -> Result<bool> {
        if let Some(confirm) = &self.options.confirm_removal {
            if !confirm(&self.status()) {
                info!("Tile removal declined");
                return Ok(false);
            }
        }
        self.store.clear().await?;
        let status = self.update(|status| status.storage_size = 0);
        self.notifier.emit(Notification::TilesRemoved);
        self.notifier.emit(Notification::StorageSize {
            storage_size: status.storage_size,
        });
        Ok(true)
    }

    /// Count the stored tiles and publish the number.
    pub async fn storage_size(&self) -> usize {
        let storage_size = self.store.count().await;
        self.update(|status| status.storage_size = storage_size);
        self.notifier.emit(Notification::StorageSize { storage_size });
        storage_size
    }

    /// Stored image for a tile of `layer`, for display. Always `None` while
    /// a batch is running, so the caller falls back to the network.
    pub async fn stored_tile(&self, layer: &TileLayer, coord: TileCoord) -> Result<Option<Bytes>> {
        if self.is_saving() {
            debug!("Stored tiles unavailable while saving");
            return Ok(None);
        }
        let key = layer.storage_key(coord)?;
        self.store.get(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFetcher;
    use std::time::Duration;
    use tempfile::TempDir;

    const TEMPLATE: &str = "https://{s}.tiles.example/{z}/{x}/{y}.png";

    struct Fixture {
        _dir: TempDir,
        fetcher: Arc<MockFetcher>,
        store: Arc<TileStore>,
        coordinator: BulkDownloadCoordinator,
    }

    async fn fixture(options: DownloadOptions) -> Fixture {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockFetcher::new());
        let store = Arc::new(TileStore::open(dir.path()).await.unwrap());
        let coordinator =
            BulkDownloadCoordinator::new(fetcher.clone(), store.clone(), Notifier::new(), options);
        Fixture {
            _dir: dir,
            fetcher,
            store,
            coordinator,
        }
    }

    fn tiles(layer: &TileLayer, fetcher: &MockFetcher, count: i64) -> Vec<TileDescriptor> {
        (0..count)
            .map(|x| {
                let tile = layer.tile_descriptor(TileCoord::new(x, 0, 10)).unwrap();
                fetcher.respond(&tile.url, 200, "png");
                tile
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_saves_every_tile_within_concurrency_limit() {
        let f = fixture(DownloadOptions::default()).await;
        f.fetcher.set_delay(Duration::from_millis(5));
        let layer = TileLayer::new(TEMPLATE);
        let batch = tiles(&layer, &f.fetcher, 20);

        let outcome = f.coordinator.start_batch(batch, 4).await;

        let BatchOutcome::Completed(status) = outcome else {
            panic!("batch was declined");
        };
        assert_eq!(status.length_to_be_saved, 20);
        assert_eq!(status.length_loaded, 20);
        assert_eq!(status.length_saved, 20);
        assert_eq!(status.length_failed, 0);
        assert_eq!(status.pending_queue, 0);
        assert_eq!(status.storage_size, 20);
        assert_eq!(f.store.count().await, 20);
        assert_eq!(f.fetcher.request_count(), 20);
        assert!(f.fetcher.max_in_flight() <= 4);
        assert!(f.fetcher.max_in_flight() >= 2);
        assert!(!f.coordinator.is_saving());
    }

    #[tokio::test]
    async fn test_failed_tile_does_not_stop_batch() {
        let f = fixture(DownloadOptions::default()).await;
        let layer = TileLayer::new(TEMPLATE);
        let batch = tiles(&layer, &f.fetcher, 5);
        f.fetcher.fail(&batch[1].url);
        f.fetcher.respond(&batch[3].url, 404, "missing");

        let BatchOutcome::Completed(status) = f.coordinator.start_batch(batch, 2).await else {
            panic!("batch was declined");
        };
        assert_eq!(status.length_saved, 3);
        assert_eq!(status.length_failed, 2);
        assert_eq!(f.store.count().await, 3);
    }

    #[tokio::test]
    async fn test_declined_batch_changes_nothing() {
        let options = DownloadOptions {
            confirm: Some(Arc::new(|progress: &DownloadProgress| progress.length_to_be_saved < 3)),
            ..DownloadOptions::default()
        };
        let f = fixture(options).await;
        let mut rx = f.coordinator.notifier().subscribe();
        let layer = TileLayer::new(TEMPLATE);
        let batch = tiles(&layer, &f.fetcher, 5);

        assert_eq!(f.coordinator.start_batch(batch, 2).await, BatchOutcome::Declined);
        assert_eq!(f.fetcher.request_count(), 0);
        assert_eq!(f.store.count().await, 0);
        assert_eq!(f.coordinator.status(), DownloadProgress::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notification_sequence() {
        let f = fixture(DownloadOptions::default()).await;
        let mut rx = f.coordinator.notifier().subscribe();
        let layer = TileLayer::new(TEMPLATE);
        let batch = tiles(&layer, &f.fetcher, 1);

        f.coordinator.start_batch(batch, 8).await;

        let mut kinds = Vec::new();
        while let Ok(n) = rx.try_recv() {
            kinds.push(match n {
                Notification::SaveStart(_) => "saveStart",
                Notification::TileLoaded(_) => "tileLoaded",
                Notification::TileSaved(_) => "tileSaved",
                Notification::LoadEnd(_) => "loadEnd",
                Notification::SaveEnd(_) => "saveEnd",
                Notification::StorageSize { .. } => "storageSize",
                Notification::TilesRemoved => "tilesRemoved",
            });
        }
        assert_eq!(
            kinds,
            vec!["saveStart", "tileLoaded", "tileSaved", "loadEnd", "saveEnd", "storageSize"]
        );
    }

    #[tokio::test]
    async fn test_stored_tiles_are_reused_when_not_always_downloading() {
        let options = DownloadOptions {
            always_download: false,
            ..DownloadOptions::default()
        };
        let f = fixture(options).await;
        let layer = TileLayer::new(TEMPLATE);
        let batch = tiles(&layer, &f.fetcher, 3);
        f.store
            .put(&TileRecord::new(batch[0].clone(), Bytes::from_static(b"stored")))
            .await
            .unwrap();

        f.coordinator.start_batch(batch.clone(), 2).await;

        assert_eq!(f.fetcher.request_count(), 2);
        assert_eq!(
            f.store.get(&batch[0].key).await.unwrap(),
            Some(Bytes::from_static(b"stored"))
        );
    }

    #[tokio::test]
    async fn test_clear_all_respects_removal_gate() {
        let options = DownloadOptions {
            confirm_removal: Some(Arc::new(|_: &DownloadProgress| false)),
            ..DownloadOptions::default()
        };
        let f = fixture(options).await;
        let layer = TileLayer::new(TEMPLATE);
        f.coordinator.start_batch(tiles(&layer, &f.fetcher, 2), 2).await;

        assert!(!f.coordinator.clear_all().await.unwrap());
        assert_eq!(f.store.count().await, 2);
    }

    #[tokio::test]
    async fn test_clear_all_notifies() {
        let f = fixture(DownloadOptions::default()).await;
        let layer = TileLayer::new(TEMPLATE);
        f.coordinator.start_batch(tiles(&layer, &f.fetcher, 2), 2).await;
        let mut rx = f.coordinator.notifier().subscribe();

        assert!(f.coordinator.clear_all().await.unwrap());
        assert_eq!(f.store.count().await, 0);
        assert_eq!(rx.try_recv().unwrap(), Notification::TilesRemoved);
        assert_eq!(rx.try_recv().unwrap(), Notification::StorageSize { storage_size: 0 });
    }

    #[tokio::test]
    async fn test_plan_region() {
        let f = fixture(DownloadOptions {
            max_zoom: 7,
            ..DownloadOptions::default()
        })
        .await;
        let layer = TileLayer::new(TEMPLATE);
        let bounds = LatLngBounds::parse("45.50,-122.70,45.52,-122.68").unwrap();

        let one = f
            .coordinator
            .plan_region(&layer, &bounds, &ZoomSelection::Levels(vec![6]))
            .unwrap();
        assert!(!one.is_empty());
        assert!(one.iter().all(|t| t.z == 6));

        let all = f
            .coordinator
            .plan_region(&layer, &bounds, &ZoomSelection::SaveWhatYouSee { current_zoom: 5 })
            .unwrap();
        let mut zooms: Vec<u32> = all.iter().map(|t| t.z).collect();
        zooms.dedup();
        assert_eq!(zooms, vec![5, 6, 7]);

        let refused =
            f.coordinator
                .plan_region(&layer, &bounds, &ZoomSelection::SaveWhatYouSee { current_zoom: 4 });
        assert!(matches!(refused, Err(OfflineError::Validation(_))));

        let too_deep = f
            .coordinator
            .plan_region(&layer, &bounds, &ZoomSelection::Levels(vec![40]));
        assert!(matches!(too_deep, Err(OfflineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_stored_tile_lookup() {
        let f = fixture(DownloadOptions::default()).await;
        let layer = TileLayer::new(TEMPLATE);
        f.coordinator.start_batch(tiles(&layer, &f.fetcher, 1), 1).await;

        let blob = f
            .coordinator
            .stored_tile(&layer, TileCoord::new(0, 0, 10))
            .await
            .unwrap();
        assert_eq!(blob, Some(Bytes::from_static(b"png")));
        let missing = f
            .coordinator
            .stored_tile(&layer, TileCoord::new(9, 9, 10))
            .await
            .unwrap();
        assert_eq!(missing, None);
    }
}
