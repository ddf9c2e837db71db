//! Recording directory watcher.
//!
//! Watches one directory (non-recursive) and forwards every candidate path
//! it sees into a bounded channel. Stability and deduplication are the
//! dispatcher's job; the watcher only filters by name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WatchSettings;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Invalid ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a path came to our attention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    /// Found by the startup scan
    Scanned,
    /// Created, modified or renamed; treated uniformly as "re-evaluate"
    Changed,
}

/// A path to re-evaluate
#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
    pub observed_at: DateTime<Utc>,
}

impl FsEvent {
    pub fn new(path: PathBuf, kind: FsEventKind) -> Self {
        Self {
            path,
            kind,
            observed_at: Utc::now(),
        }
    }
}

/// Decides which paths under the root are recordings
#[derive(Debug, Clone)]
pub struct RecordingFilter {
    root: PathBuf,
    extensions: Vec<String>,
    ignore: Vec<Pattern>,
}

impl RecordingFilter {
    pub fn new(root: PathBuf, extensions: &[String], ignore: &[String]) -> Result<Self, WatcherError> {
        let ignore = ignore
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| WatcherError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            root,
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directly under the root, eligible extension, not ignored
    pub fn is_candidate(&self, path: &Path) -> bool {
        if path.parent() != Some(self.root.as_path()) {
            return false;
        }

        let extension_ok = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if !extension_ok {
            return false;
        }

        let options = MatchOptions {
            require_literal_separator: true,
            ..Default::default()
        };
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        !self
            .ignore
            .iter()
            .any(|p| p.matches_path_with(relative, options))
    }
}

/// Keeps the notify watcher alive; dropping it stops watching
pub struct WatchHandle {
    _debouncer: Debouncer<RecommendedWatcher>,
}

/// Watches the configured root for recordings
pub struct Watcher {
    filter: RecordingFilter,
    debounce: Duration,
}

impl Watcher {
    pub fn new(settings: &WatchSettings) -> Result<Self, WatcherError> {
        if !settings.root.is_dir() {
            return Err(WatcherError::DirectoryNotFound(settings.root.clone()));
        }
        let root = settings.root.canonicalize()?;

        // Coalesces notify bursts; the settle window does the real waiting
        let debounce = (settings.settle_window / 4).clamp(Duration::from_millis(50), Duration::from_millis(500));

        Ok(Self {
            filter: RecordingFilter::new(root, &settings.extensions, &settings.ignore)?,
            debounce,
        })
    }

    pub fn filter(&self) -> &RecordingFilter {
        &self.filter
    }

    /// Emit every existing candidate file; returns how many were sent
    pub async fn scan(&self, tx: &mpsc::Sender<FsEvent>) -> Result<usize, WatcherError> {
        let mut entries = tokio::fs::read_dir(self.filter.root()).await?;
        let mut sent = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.filter.is_candidate(&path) {
                continue;
            }
            // Empty files are picked up by the live watcher once written
            match entry.metadata().await {
                Ok(metadata) if metadata.is_file() && metadata.len() > 0 => {}
                _ => continue,
            }

            if tx.send(FsEvent::new(path, FsEventKind::Scanned)).await.is_err() {
                break;
            }
            sent += 1;
        }

        info!(root = %self.filter.root().display(), files = sent, "Startup scan complete");
        Ok(sent)
    }

    /// Start live watching. Events are pushed with `blocking_send`, so a full
    /// channel stalls the notify thread rather than losing events.
    pub fn watch(&self, tx: mpsc::Sender<FsEvent>) -> Result<WatchHandle, WatcherError> {
        let filter = self.filter.clone();

        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        if !filter.is_candidate(&event.path) {
                            continue;
                        }
                        debug!(path = %event.path.display(), "File event");
                        if tx
                            .blocking_send(FsEvent::new(event.path, FsEventKind::Changed))
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Watcher error: {:?}", e),
            }
        })?;

        debouncer
            .watcher()
            .watch(self.filter.root(), RecursiveMode::NonRecursive)?;

        info!(root = %self.filter.root().display(), "Watching for recordings");
        Ok(WatchHandle {
            _debouncer: debouncer,
        })
    }
}
