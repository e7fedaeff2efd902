//! Persistent tile cache.
//!
//! # Components
//!
//! - [`PersistentTileCache`]: disk-backed store with LRU size eviction and TTL expiry
//! - [`CacheConfig`]: limits, TTL and background task intervals
//! - [`CacheRecord`]: per-tile metadata kept in the JSON index
//!
//! Identities that differ only in spelling (provider case, date separators)
//! share one entry; see [`TileIdentity`](crate::tile::TileIdentity).

mod config;
mod disk;
mod index;

pub use config::{
    CacheConfig, DEFAULT_CACHE_MAX_BYTES, DEFAULT_CACHE_TTL, DEFAULT_EVICTION_TARGET,
    DEFAULT_PERSIST_DELAY, DEFAULT_SWEEP_INTERVAL,
};
pub use disk::{CacheStats, EvictionReport, PersistentTileCache};
pub use index::{index_path, CacheRecord, INDEX_FILE_NAME};
