//! Caller-supplied progress, log and event sinks.
//!
//! Every sink is optional. A missing log sink falls back to `tracing`;
//! missing progress and event sinks are no-ops.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Event emitted when a download succeeds with some failed tiles.
pub const EVENT_DOWNLOAD_PARTIAL: &str = "download_partial";

/// Event emitted when a download finishes with every tile.
pub const EVENT_DOWNLOAD_COMPLETE: &str = "download_complete";

/// Event emitted when a download is rejected for too many failures.
pub const EVENT_DOWNLOAD_FAILED: &str = "download_failed";

/// Progress snapshot emitted after each processed tile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub downloaded: usize,
    pub total: usize,
    pub percent: f64,
    pub status: String,
}

impl Progress {
    pub fn new(downloaded: usize, total: usize, status: impl Into<String>) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            downloaded as f64 * 100.0 / total as f64
        };
        Self {
            downloaded,
            total,
            percent,
            status: status.into(),
        }
    }
}

/// Properties attached to an event.
pub type EventProperties = BTreeMap<String, String>;

type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;
type LogFn = Arc<dyn Fn(&str) + Send + Sync>;
type EventFn = Arc<dyn Fn(&str, &EventProperties) + Send + Sync>;

/// Optional sinks for download progress, log lines and named events.
///
/// # Example
///
/// ```ignore
/// let callbacks = DownloadCallbacks::new()
///     .on_progress(|p| println!("{:.0}% {}", p.percent, p.status))
///     .on_event(|name, props| println!("{name}: {props:?}"));
/// ```
#[derive(Clone, Default)]
pub struct DownloadCallbacks {
    progress: Option<ProgressFn>,
    log: Option<LogFn>,
    event: Option<EventFn>,
}

impl DownloadCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn on_log(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log = Some(Arc::new(f));
        self
    }

    pub fn on_event(mut self, f: impl Fn(&str, &EventProperties) + Send + Sync + 'static) -> Self {
        self.event = Some(Arc::new(f));
        self
    }

    pub(crate) fn progress(&self, progress: &Progress) {
        if let Some(ref f) = self.progress {
            f(progress);
        }
    }

    pub(crate) fn log(&self, message: &str) {
        match self.log {
            Some(ref f) => f(message),
            None => tracing::info!("{}", message),
        }
    }

    pub(crate) fn event(&self, name: &str, properties: &EventProperties) {
        if let Some(ref f) = self.event {
            f(name, properties);
        }
    }
}

impl fmt::Debug for DownloadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCallbacks")
            .field("progress", &self.progress.is_some())
            .field("log", &self.log.is_some())
            .field("event", &self.event.is_some())
            .finish()
    }
}
