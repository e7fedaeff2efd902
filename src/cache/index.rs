//! On-disk metadata index.
//!
//! The index (`cache_index.json` in the cache root) lists every cached tile
//! with its size, timestamps and relative path. It is rewritten atomically
//! (`cache_index.json.tmp`, then rename) so a crash leaves either the old or
//! the new index, never a torn one.
//!
//! When the index is missing or unreadable, it is rebuilt by walking the
//! `{provider}/{z}/{x}/{y}[_{date}].{ext}` tree, taking each file's size and
//! modification time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::io::{is_temp_path, write_atomic_blocking};
use crate::tile::TileIdentity;

/// File name of the index inside the cache root.
pub const INDEX_FILE_NAME: &str = "cache_index.json";

const INDEX_VERSION: u32 = 1;

/// Metadata for one cached tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub identity: TileIdentity,

    /// File size in bytes
    pub size: u64,

    /// Unix millis when the tile was stored
    pub created_at: u64,

    /// Unix millis of the last hit
    pub last_access: u64,

    /// Path relative to the cache root
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    records: Vec<CacheRecord>,
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    system_time_millis(SystemTime::now())
}

fn system_time_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Path of the index for a cache rooted at `root`.
pub fn index_path(root: &Path) -> PathBuf {
    root.join(INDEX_FILE_NAME)
}

/// Outcome of loading the index at startup.
#[derive(Debug)]
pub struct LoadedIndex {
    pub records: HashMap<String, CacheRecord>,

    /// The records came from a directory scan, not the index file
    pub rebuilt: bool,

    /// Index records dropped because their file is gone
    pub dropped: usize,
}

/// Load the index under `root`, rebuilding it from the tree when needed.
///
/// Blocking; run inside `spawn_blocking`.
pub fn load_or_rebuild(root: &Path) -> LoadedIndex {
    let path = index_path(root);

    let parsed = match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cache index unreadable, rebuilding from disk");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cache index could not be read, rebuilding from disk");
            None
        }
    };

    match parsed {
        Some(index) => {
            let (records, dropped) = verify_records(root, index.records);
            LoadedIndex {
                records,
                rebuilt: false,
                dropped,
            }
        }
        None => LoadedIndex {
            records: scan_directory(root),
            rebuilt: true,
            dropped: 0,
        },
    }
}

/// Keep only records whose backing file exists, refreshing their sizes.
fn verify_records(root: &Path, records: Vec<CacheRecord>) -> (HashMap<String, CacheRecord>, usize) {
    let mut kept = HashMap::with_capacity(records.len());
    let mut dropped = 0;

    for mut record in records {
        match std::fs::metadata(root.join(&record.path)) {
            Ok(meta) if meta.is_file() => {
                record.size = meta.len();
                kept.insert(record.identity.key(), record);
            }
            _ => {
                debug!(key = %record.identity, "Dropping index record without file");
                dropped += 1;
            }
        }
    }

    (kept, dropped)
}

/// Rebuild records from the `{provider}/{z}/{x}/{file}` tree under `root`.
///
/// Files that do not follow the layout are ignored. When one tile exists with
/// several extensions, the newest file wins and the others are deleted.
pub fn scan_directory(root: &Path) -> HashMap<String, CacheRecord> {
    let mut records: HashMap<String, CacheRecord> = HashMap::new();

    for provider in subdirectories(root) {
        for z in subdirectories(&provider) {
            for x in subdirectories(&z) {
                let Ok(entries) = std::fs::read_dir(&x) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let file = entry.path();
                    let Ok(meta) = entry.metadata() else {
                        continue;
                    };
                    if !meta.is_file() {
                        continue;
                    }
                    if let Some(record) = record_for_file(root, &file, &meta) {
                        insert_newest(root, &mut records, record);
                    }
                }
            }
        }
    }

    debug!(
        root = %root.display(),
        entries = records.len(),
        "Cache index rebuilt from directory scan"
    );

    records
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn record_for_file(root: &Path, file: &Path, meta: &std::fs::Metadata) -> Option<CacheRecord> {
    let relative = file.strip_prefix(root).ok()?.to_path_buf();
    let mut parts = relative.iter().map(|p| p.to_str());
    let provider = parts.next()??;
    let z = parts.next()??;
    let x = parts.next()??;
    let name = parts.next()??;

    // Leftovers of interrupted writes
    if is_temp_path(file) {
        return None;
    }

    let identity = TileIdentity::from_path_parts(provider, z, x, name)?;
    let mtime = meta.modified().map(system_time_millis).unwrap_or(0);

    Some(CacheRecord {
        identity,
        size: meta.len(),
        created_at: mtime,
        last_access: mtime,
        path: relative,
    })
}

fn insert_newest(root: &Path, records: &mut HashMap<String, CacheRecord>, record: CacheRecord) {
    let key = record.identity.key();
    match records.get(&key) {
        Some(existing) if existing.created_at >= record.created_at => {
            let _ = std::fs::remove_file(root.join(&record.path));
        }
        Some(existing) => {
            let _ = std::fs::remove_file(root.join(&existing.path));
            records.insert(key, record);
        }
        None => {
            records.insert(key, record);
        }
    }
}

/// Atomically write `records` as the index under `root`.
///
/// Records are sorted by key so the file is stable across writes.
/// Blocking; run inside `spawn_blocking`.
pub fn save_index(root: &Path, mut records: Vec<CacheRecord>) -> Result<(), CacheError> {
    records.sort_by(|a, b| a.identity.cmp(&b.identity));
    let index = IndexFile {
        version: INDEX_VERSION,
        records,
    };
    let json = serde_json::to_vec_pretty(&index).map_err(|e| CacheError::Index(e.to_string()))?;

    let path = index_path(root);
    write_atomic_blocking(&path, &json).map_err(|e| CacheError::io(path, e))
}
