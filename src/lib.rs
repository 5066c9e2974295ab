//! Host-backed tiled-surface binding.
//!
//! Bridges an external tiled-surface painting engine to tile storage owned
//! by a host environment: the engine's per-tile begin/end callbacks are
//! translated into the host's fetch/commit capabilities, fetched buffer
//! objects stay retained for exactly the span of one request, and the
//! bulk-processing entry point suspends the host's single-writer lock while
//! the engine's workers run.

pub mod config;
pub mod errors;
pub mod ffi;
pub mod host;
pub mod mem;
pub mod proxy;
pub mod request;
pub mod surface;

pub use config::SurfaceConfig;
pub use errors::HostError;
pub use host::{HostGuard, HostLock, TileBuffer, TileStore};
pub use mem::{MemoryTile, MemoryTileStore};
pub use proxy::ProxySurface;
pub use request::TileRequest;
pub use surface::{
    generic_process_tiles, Surface, TiledSurface, TILE_CHANNELS, TILE_SAMPLES, TILE_SIZE,
};
