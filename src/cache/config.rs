//! Configuration for the persistent tile cache.

use std::path::PathBuf;
use std::time::Duration;

/// Default cache size limit: 1 GiB
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 1024 * 1024 * 1024;

/// Default entry lifetime: 30 days
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default interval between TTL sweeps: 5 minutes
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Fraction of the size limit the cache shrinks to once it overflows.
/// Leaves headroom so every write past the limit does not trigger a pass.
pub const DEFAULT_EVICTION_TARGET: f64 = 0.9;

/// Delay between a persist request and the index write, so bursts of hits
/// produce one write.
pub const DEFAULT_PERSIST_DELAY: Duration = Duration::from_millis(500);

/// Settings for [`PersistentTileCache`](super::PersistentTileCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory holding tile files and the index.
    pub directory: PathBuf,

    /// Size limit in bytes. Exceeding it schedules an eviction pass.
    pub max_size_bytes: u64,

    /// Maximum entry age. `Duration::ZERO` disables expiry.
    pub ttl: Duration,

    /// Interval between background TTL sweeps.
    pub sweep_interval: Duration,

    /// Fraction of `max_size_bytes` an eviction pass shrinks to.
    pub eviction_target: f64,

    /// Debounce delay for background index writes.
    pub persist_delay: Duration,
}

impl CacheConfig {
    /// Configuration with defaults rooted at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_size_bytes: DEFAULT_CACHE_MAX_BYTES,
            ttl: DEFAULT_CACHE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            eviction_target: DEFAULT_EVICTION_TARGET,
            persist_delay: DEFAULT_PERSIST_DELAY,
        }
    }

    pub fn with_max_size_bytes(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn with_eviction_target(mut self, eviction_target: f64) -> Self {
        self.eviction_target = eviction_target.clamp(0.0, 1.0);
        self
    }

    pub fn with_persist_delay(mut self, persist_delay: Duration) -> Self {
        self.persist_delay = persist_delay;
        self
    }

    /// Size an eviction pass shrinks the cache to.
    pub fn eviction_target_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.eviction_target) as u64
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new("tile_cache")
    }
}
