//! Turns raw file events into work items.
//!
//! A path becomes a work item once it is stable: size and modification time
//! unchanged across two observations at least one settle window apart.
//! Empty files stay pending until they have content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::recording::modified_ms;
use crate::domain::Fingerprint;

use super::queue::{EnqueueResult, WorkItem, WorkQueue};
use super::watcher::FsEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    size: u64,
    modified_ms: i64,
    since: Instant,
}

/// Per-path settle tracking, driven by explicit clock values
#[derive(Debug)]
pub struct SettleTracker {
    window: Duration,
    pending: HashMap<PathBuf, Observation>,
}

impl SettleTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record an event for `path` at `now`
    pub fn observe(&mut self, path: &Path, now: Instant) {
        let Some((size, modified)) = stat(path) else {
            self.pending.remove(path);
            return;
        };

        match self.pending.get_mut(path) {
            Some(obs) if obs.size == size && obs.modified_ms == modified => {}
            Some(obs) => {
                *obs = Observation {
                    size,
                    modified_ms: modified,
                    since: now,
                };
            }
            None => {
                self.pending.insert(
                    path.to_path_buf(),
                    Observation {
                        size,
                        modified_ms: modified,
                        since: now,
                    },
                );
            }
        }
    }

    /// Paths that have been quiet for a full window as of `now`
    pub fn take_stable(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut stable = Vec::new();
        let mut gone = Vec::new();

        for (path, obs) in self.pending.iter_mut() {
            if now.saturating_duration_since(obs.since) < self.window {
                continue;
            }
            match stat(path) {
                None => gone.push(path.clone()),
                Some((size, modified)) if size == obs.size && modified == obs.modified_ms => {
                    if size > 0 {
                        stable.push(path.clone());
                    } else {
                        // Still empty; look again after another window
                        obs.since = now;
                    }
                }
                Some((size, modified)) => {
                    *obs = Observation {
                        size,
                        modified_ms: modified,
                        since: now,
                    };
                }
            }
        }

        for path in gone.iter().chain(stable.iter()) {
            self.pending.remove(path);
        }
        stable
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending paths that have content; empty files are not counted
    pub fn settling(&self) -> usize {
        self.pending.values().filter(|obs| obs.size > 0).count()
    }
}

fn stat(path: &Path) -> Option<(u64, i64)> {
    let metadata = std::fs::metadata(path).ok()?;
    metadata
        .is_file()
        .then(|| (metadata.len(), modified_ms(&metadata)))
}

/// Dispatch statistics
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub events: usize,
    pub queued: usize,
    pub coalesced: usize,
    pub errors: usize,
}

/// Debounces events and feeds stable recordings into the work queue
pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    tracker: SettleTracker,
    tick: Duration,
    report: DispatchReport,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue>, settle_window: Duration) -> Self {
        let tick = (settle_window / 4).clamp(Duration::from_millis(20), Duration::from_millis(500));
        Self {
            queue,
            tracker: SettleTracker::new(settle_window),
            tick,
            report: DispatchReport::default(),
        }
    }

    /// Enqueue every path that is stable as of `now`
    pub async fn flush(&mut self, now: Instant) {
        for path in self.tracker.take_stable(now) {
            let fingerprint = match Fingerprint::compute(&path).await {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to fingerprint");
                    self.report.errors += 1;
                    continue;
                }
            };

            let item = WorkItem::new(path, fingerprint);
            debug!(identity = %item.identity, path = %item.path.display(), fingerprint = %item.fingerprint, "Stable");
            match self.queue.enqueue(item).await {
                EnqueueResult::Queued => self.report.queued += 1,
                EnqueueResult::Coalesced | EnqueueResult::Rerun => self.report.coalesced += 1,
                EnqueueResult::Closed => break,
            }
        }
    }

    pub fn observe(&mut self, event: &FsEvent, now: Instant) {
        self.report.events += 1;
        self.tracker.observe(&event.path, now);
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn report(&self) -> &DispatchReport {
        &self.report
    }

    /// Consume events until shutdown or until the queue closes. When the
    /// event source closes, keeps going until every pending path with
    /// content has settled, then returns. Files still empty at that point
    /// are left behind.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<FsEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DispatchReport {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut source_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if source_open => match event {
                    Some(event) => self.observe(&event, Instant::now()),
                    None => source_open = false,
                },
                _ = ticker.tick() => {
                    self.flush(Instant::now()).await;
                    if self.queue.is_closed() {
                        break;
                    }
                    if !source_open && self.tracker.settling() == 0 {
                        if !self.tracker.is_empty() {
                            debug!(empty = self.tracker.len(), "Leaving empty files behind");
                        }
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            events = self.report.events,
            queued = self.report.queued,
            coalesced = self.report.coalesced,
            "Dispatcher stopped"
        );
        self.report
    }
}
