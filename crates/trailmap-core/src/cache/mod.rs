//! Local caching of application resources for offline use.
//!
//! This module provides the `ResourceCache`, a persistent store of captured
//! HTTP responses keyed by request URL. Entries are grouped into
//! generations (one per deployed application version plus a dedicated one
//! for map tiles), and superseded generations are deleted on activation.

pub mod resource;

pub use resource::{CachedEntry, LookupOptions, ResourceCache};
