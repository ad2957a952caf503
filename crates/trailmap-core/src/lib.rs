//! trailmap core - offline map tiles and resources for a web map.
//!
//! This crate keeps a map application usable without connectivity: it
//! captures application resources and tiles as they are requested, saves
//! whole map regions on demand, and keeps the cached route files in line
//! with the server's manifest.
//!
//! The main entry points:
//!
//! - [`OfflineHost`]: install / activate / message lifecycle, owning the
//!   [`InterceptionRouter`] and the [`DeltaSyncEngine`].
//! - [`BulkDownloadCoordinator`]: "save this view" tile downloads into the
//!   [`TileStore`].
//! - [`Config`]: defaults and the on-disk configuration file.

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod notify;
pub mod router;
pub mod sync;
pub mod tiles;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use cache::{CachedEntry, LookupOptions, ResourceCache};
pub use config::Config;
pub use download::{BatchOutcome, BulkDownloadCoordinator, ConfirmGate, DownloadOptions, ZoomSelection};
pub use error::{OfflineError, Result};
pub use http::{Fetcher, HttpClient, NetworkError, Request, Response};
pub use lifecycle::{HostState, InstallReport, LifecycleMessage, LifecycleReply, OfflineHost};
pub use notify::{DownloadProgress, Notification, Notifier};
pub use router::{InterceptionRouter, RequestClass, ResponseSource, RoutedResponse, RouterPolicy};
pub use sync::{encode_uri, DeltaSyncEngine, ManifestEntry, SyncPolicy, SyncResult, SyncStatus};
pub use tiles::{LatLngBounds, TileCoord, TileDescriptor, TileLayer, TileRecord, TileStore};
