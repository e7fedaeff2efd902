//! Filesystem helpers shared by the cache, the downloader and the encoder.
//!
//! Every file this crate produces goes through [`write_atomic`] or
//! [`AtomicFile`]: bytes land in a temporary sibling first and are renamed
//! over the destination only once fully written, so a crash or a failed write
//! never leaves a truncated file under the final name.

mod atomic;

pub use atomic::{
    commit_temp, is_temp_path, temp_path_for, write_atomic, write_atomic_blocking, write_temp,
    AtomicFile, TEMP_SUFFIX,
};
