//! Map tiles: key derivation, geographic helpers and the persistent tile store.

pub mod codec;
pub mod geo;
pub mod store;

pub use codec::{derive_key, resolve, subdomain_for, TileCoord, TileDescriptor, TileLayer, DEFAULT_TILE_SIZE, MAX_TILE_ZOOM};
pub use geo::{coverage_geojson, project, unproject, LatLng, LatLngBounds, PixelBounds, Point};
pub use store::{TileRecord, TileStore};
