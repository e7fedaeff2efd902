//! Persistent, size- and age-bounded tile cache.
//!
//! Tiles are stored as individual files under the cache root:
//!
//! ```text
//! {root}/{provider}/{z}/{x}/{y}.{ext}
//! {root}/{provider}/{z}/{x}/{y}_{date}.{ext}
//! {root}/cache_index.json
//! ```
//!
//! # Concurrency
//!
//! One `RwLock` guards the record map. Total size and entry count live in
//! atomics that are only changed while the write lock is held, so they always
//! equal the sum over the records when observed under the lock, and
//! [`stats`](PersistentTileCache::stats) can read them without locking.
//!
//! Tile bytes are written to a unique temporary file before the lock is
//! taken. Only the rename that publishes the file happens under the write
//! lock, together with the record update, so concurrent writers of one tile
//! always leave the file on disk and its record describing the same payload.
//!
//! # Background tasks
//!
//! Two tasks are spawned by [`open`](PersistentTileCache::open):
//!
//! - **Maintenance**: sweeps expired entries on an interval and runs a size
//!   eviction pass whenever a write pushes the cache over its limit. The
//!   eviction signal is a `Notify`, so any number of writes between two passes
//!   coalesce into one pending pass.
//! - **Persister**: rewrites the index after changes, debounced the same way.
//!
//! Both stop on [`shutdown`](PersistentTileCache::shutdown) or when the cache
//! is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::io::{commit_temp, write_temp};
use crate::tile::{sniff_extension, TileIdentity};

use super::config::CacheConfig;
use super::index::{self, now_millis, CacheRecord, INDEX_FILE_NAME};

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
}

/// Result of one eviction or expiry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub entries_removed: usize,
    pub bytes_freed: u64,
}

/// Signals shared with the background tasks.
#[derive(Default)]
struct Signals {
    evict: Notify,
    persist: Notify,
}

// =============================================================================
// PersistentTileCache
// =============================================================================

/// Disk-backed tile cache with LRU size eviction, TTL expiry and a
/// crash-safe JSON index.
///
/// # Example
///
/// ```ignore
/// use tile_mosaic::cache::{CacheConfig, PersistentTileCache};
///
/// let cache = PersistentTileCache::open(CacheConfig::new("/var/cache/tiles")).await?;
/// cache.set(&identity, bytes).await?;
/// assert!(cache.get(&identity).await.is_some());
/// cache.shutdown().await?;
/// ```
pub struct PersistentTileCache {
    config: CacheConfig,
    records: RwLock<HashMap<String, CacheRecord>>,
    size_bytes: AtomicU64,
    entry_count: AtomicU64,
    signals: Arc<Signals>,
    /// Serializes index writes so an older snapshot never replaces a newer one.
    persist_lock: Mutex<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistentTileCache {
    /// Open (or create) the cache rooted at `config.directory`.
    ///
    /// Loads the index, rebuilding it from the directory tree when it is
    /// missing or corrupt, and starts the background tasks.
    pub async fn open(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        tokio::fs::create_dir_all(&config.directory)
            .await
            .map_err(|e| CacheError::io(&config.directory, e))?;

        let root = config.directory.clone();
        let loaded = tokio::task::spawn_blocking(move || index::load_or_rebuild(&root))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?;

        let size: u64 = loaded.records.values().map(|r| r.size).sum();
        let count = loaded.records.len() as u64;

        let cache = Arc::new(Self {
            config,
            records: RwLock::new(loaded.records),
            size_bytes: AtomicU64::new(size),
            entry_count: AtomicU64::new(count),
            signals: Arc::new(Signals::default()),
            persist_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        info!(
            dir = %cache.config.directory.display(),
            entries = count,
            size_bytes = size,
            max_bytes = cache.config.max_size_bytes,
            rebuilt = loaded.rebuilt,
            dropped = loaded.dropped,
            "Tile cache opened"
        );

        if loaded.rebuilt || loaded.dropped > 0 {
            cache.flush().await?;
        }

        cache.start_tasks().await;

        if size > cache.config.max_size_bytes {
            cache.signals.evict.notify_one();
        }

        Ok(cache)
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Root directory of the cache.
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    fn absolute(&self, relative: &Path) -> PathBuf {
        self.config.directory.join(relative)
    }

    fn is_expired(&self, record: &CacheRecord, now: u64) -> bool {
        let ttl = self.config.ttl.as_millis() as u64;
        ttl > 0 && now.saturating_sub(record.created_at) > ttl
    }

    // -------------------------------------------------------------------------
    // Lookup and store
    // -------------------------------------------------------------------------

    /// Look up a tile.
    ///
    /// Expired entries and entries whose file cannot be read are removed and
    /// reported as misses. A hit refreshes the entry's access time.
    pub async fn get(&self, identity: &TileIdentity) -> Option<Bytes> {
        let key = identity.key();
        let record = self.records.read().await.get(&key).cloned()?;

        if self.is_expired(&record, now_millis()) {
            debug!(key = %key, "Cache entry expired");
            self.remove_if_same(&key, record.created_at).await;
            return None;
        }

        let data = match tokio::fs::read(self.absolute(&record.path)).await {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache file unreadable, dropping entry");
                self.remove_if_same(&key, record.created_at).await;
                return None;
            }
        };

        {
            let mut records = self.records.write().await;
            if let Some(current) = records.get_mut(&key) {
                if current.created_at == record.created_at {
                    current.last_access = now_millis();
                }
            }
        }
        self.signals.persist.notify_one();

        Some(Bytes::from(data))
    }

    /// Store a tile, replacing any previous entry for the same identity.
    pub async fn set(&self, identity: &TileIdentity, data: Bytes) -> Result<(), CacheError> {
        let relative = identity.relative_path(sniff_extension(&data));
        let path = self.absolute(&relative);

        let tmp = write_temp(&path, &data)
            .await
            .map_err(|e| CacheError::io(&path, e))?;

        let now = now_millis();
        let record = CacheRecord {
            identity: identity.clone(),
            size: data.len() as u64,
            created_at: now,
            last_access: now,
            path: relative.clone(),
        };

        {
            let mut records = self.records.write().await;
            commit_temp(&tmp, &path)
                .await
                .map_err(|e| CacheError::io(&path, e))?;

            match records.insert(identity.key(), record) {
                Some(old) => {
                    self.size_bytes.fetch_sub(old.size, Ordering::SeqCst);
                    if old.path != relative {
                        remove_file_best_effort(&self.absolute(&old.path)).await;
                    }
                }
                None => {
                    self.entry_count.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.size_bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
        }

        debug!(key = %identity, bytes = data.len(), "Tile cached");

        self.signals.persist.notify_one();
        if self.size_bytes.load(Ordering::SeqCst) > self.config.max_size_bytes {
            self.signals.evict.notify_one();
        }

        Ok(())
    }

    /// Remove one tile. Returns whether an entry existed.
    pub async fn remove(&self, identity: &TileIdentity) -> bool {
        let removed = {
            let mut records = self.records.write().await;
            let removed = records.remove(&identity.key());
            if let Some(ref record) = removed {
                self.forget(record);
            }
            removed
        };

        match removed {
            Some(record) => {
                remove_file_best_effort(&self.absolute(&record.path)).await;
                self.signals.persist.notify_one();
                true
            }
            None => false,
        }
    }

    /// Remove `key` only if it is still the entry created at `created_at`.
    ///
    /// Guards against deleting a tile that was re-stored between the caller's
    /// read and this removal.
    async fn remove_if_same(&self, key: &str, created_at: u64) -> bool {
        let removed = {
            let mut records = self.records.write().await;
            match records.get(key) {
                Some(current) if current.created_at == created_at => {
                    let record = records.remove(key);
                    if let Some(ref record) = record {
                        self.forget(record);
                    }
                    record
                }
                _ => None,
            }
        };

        match removed {
            Some(record) => {
                remove_file_best_effort(&self.absolute(&record.path)).await;
                self.signals.persist.notify_one();
                true
            }
            None => false,
        }
    }

    /// Subtract a removed record from the counters. Call with the write lock held.
    fn forget(&self, record: &CacheRecord) {
        self.size_bytes.fetch_sub(record.size, Ordering::SeqCst);
        self.entry_count.fetch_sub(1, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Stats and bulk operations
    // -------------------------------------------------------------------------

    /// Current statistics, read without locking.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entry_count.load(Ordering::SeqCst),
            size_bytes: self.size_bytes.load(Ordering::SeqCst),
            max_size_bytes: self.config.max_size_bytes,
        }
    }

    /// Remove every tile and persist an empty index.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let removed = {
            let mut records = self.records.write().await;
            let count = records.len();
            records.clear();
            self.size_bytes.store(0, Ordering::SeqCst);
            self.entry_count.store(0, Ordering::SeqCst);
            count
        };

        let root = self.config.directory.clone();
        tokio::task::spawn_blocking(move || clear_tree(&root))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))??;

        self.flush().await?;

        info!(entries = removed, "Tile cache cleared");
        Ok(())
    }

    /// Write the index to disk now.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<CacheRecord> = self.records.read().await.values().cloned().collect();
        let root = self.config.directory.clone();

        tokio::task::spawn_blocking(move || index::save_index(&root, snapshot))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
    }

    /// Evict least recently used entries until the cache is at or below
    /// `max_size_bytes * eviction_target`.
    ///
    /// Does nothing while the cache is within its limit. Ties on access time
    /// are broken by key so the order is deterministic.
    pub async fn run_eviction(&self) -> EvictionReport {
        if self.size_bytes.load(Ordering::SeqCst) <= self.config.max_size_bytes {
            return EvictionReport::default();
        }
        let target = self.config.eviction_target_bytes();

        let victims = {
            let mut records = self.records.write().await;

            let mut order: Vec<(u64, String)> = records
                .iter()
                .map(|(key, r)| (r.last_access, key.clone()))
                .collect();
            order.sort();

            let mut victims = Vec::new();
            for (_, key) in order {
                if self.size_bytes.load(Ordering::SeqCst) <= target {
                    break;
                }
                if let Some(record) = records.remove(&key) {
                    self.forget(&record);
                    victims.push(record);
                }
            }
            victims
        };

        let report = self.delete_victims(victims).await;
        if report.entries_removed > 0 {
            info!(
                entries_removed = report.entries_removed,
                bytes_freed = report.bytes_freed,
                size_bytes = self.size_bytes.load(Ordering::SeqCst),
                target = target,
                "Tile cache eviction complete"
            );
        }
        report
    }

    /// Remove every entry older than the TTL.
    pub async fn sweep_expired(&self) -> EvictionReport {
        if self.config.ttl.is_zero() {
            return EvictionReport::default();
        }
        let now = now_millis();

        let victims = {
            let mut records = self.records.write().await;
            let expired: Vec<String> = records
                .iter()
                .filter(|(_, r)| self.is_expired(r, now))
                .map(|(k, _)| k.clone())
                .collect();

            let mut victims = Vec::with_capacity(expired.len());
            for key in expired {
                if let Some(record) = records.remove(&key) {
                    self.forget(&record);
                    victims.push(record);
                }
            }
            victims
        };

        let report = self.delete_victims(victims).await;
        if report.entries_removed > 0 {
            info!(
                entries_removed = report.entries_removed,
                bytes_freed = report.bytes_freed,
                "Expired tiles swept"
            );
        }
        report
    }

    async fn delete_victims(&self, victims: Vec<CacheRecord>) -> EvictionReport {
        let mut report = EvictionReport::default();
        for record in victims {
            remove_file_best_effort(&self.absolute(&record.path)).await;
            report.entries_removed += 1;
            report.bytes_freed += record.size;
        }
        if report.entries_removed > 0 {
            self.signals.persist.notify_one();
        }
        report
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    async fn start_tasks(self: &Arc<Self>) {
        let maintenance = tokio::spawn(run_maintenance(
            Arc::downgrade(self),
            Arc::clone(&self.signals),
            self.shutdown.clone(),
            self.config.sweep_interval,
        ));
        let persister = tokio::spawn(run_persister(
            Arc::downgrade(self),
            Arc::clone(&self.signals),
            self.shutdown.clone(),
            self.config.persist_delay,
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(maintenance);
        tasks.push(persister);
    }

    /// Stop the background tasks and write the index.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.flush().await?;
        info!(dir = %self.config.directory.display(), "Tile cache shut down");
        Ok(())
    }
}

impl Drop for PersistentTileCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Background tasks
// =============================================================================

async fn run_maintenance(
    cache: Weak<PersistentTileCache>,
    signals: Arc<Signals>,
    shutdown: CancellationToken,
    sweep_interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(cache) = cache.upgrade() else { break };
                cache.sweep_expired().await;
                cache.run_eviction().await;
            }
            _ = signals.evict.notified() => {
                let Some(cache) = cache.upgrade() else { break };
                cache.run_eviction().await;
            }
        }
    }

    debug!("Cache maintenance task stopped");
}

async fn run_persister(
    cache: Weak<PersistentTileCache>,
    signals: Arc<Signals>,
    shutdown: CancellationToken,
    delay: std::time::Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = signals.persist.notified() => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(cache) = cache.upgrade() else { break };
        if let Err(e) = cache.flush().await {
            warn!(error = %e, "Failed to persist cache index");
        }
    }

    debug!("Cache persister task stopped");
}

// =============================================================================
// Filesystem helpers
// =============================================================================

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to delete cache file");
        }
    }
}

/// Delete everything under `root` except the index.
fn clear_tree(root: &Path) -> Result<(), CacheError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CacheError::io(root, e)),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_name().is_some_and(|n| n == INDEX_FILE_NAME) {
            continue;
        }
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "Failed to delete during clear");
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
