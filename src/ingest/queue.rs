//! Bounded, coalescing work queue.
//!
//! Holds at most one entry per recording identity. A new event for an
//! identity that is already queued (or delayed for a retry) only replaces
//! the pending fingerprint; one that is in flight marks the entry for a
//! re-run once the current pass finishes. Enqueueing a new identity waits
//! for capacity instead of dropping the event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::domain::{Fingerprint, ProcessingRecord, Recording, RecordingId};

/// A dispatch-queue entry: one recording and its current fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub identity: RecordingId,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub discovered_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(path: PathBuf, fingerprint: Fingerprint) -> Self {
        Self {
            identity: RecordingId::from_path(&path),
            path,
            fingerprint,
            discovered_at: Utc::now(),
        }
    }

    /// Resume work for a record left unfinished by an earlier run
    pub fn from_record(record: &ProcessingRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            path: record.source_path.clone(),
            fingerprint: record.fingerprint.clone(),
            discovered_at: record.discovered_at,
        }
    }

    pub fn recording(&self) -> Recording {
        Recording {
            id: self.identity.clone(),
            path: self.path.clone(),
            fingerprint: self.fingerprint.clone(),
            discovered_at: self.discovered_at,
        }
    }
}

/// Result of enqueueing an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// New entry scheduled
    Queued,
    /// Identity already pending; fingerprint updated in place
    Coalesced,
    /// Identity in flight; it will run again when the current pass ends
    Rerun,
    /// Queue closed for shutdown
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Queued,
    InFlight,
    Delayed,
}

#[derive(Debug)]
struct Entry {
    item: WorkItem,
    state: EntryState,
    rerun: bool,
}

type Entries = Arc<Mutex<HashMap<RecordingId, Entry>>>;

/// Deduplicating work queue shared by the dispatcher and the workers
pub struct WorkQueue {
    tx: mpsc::Sender<RecordingId>,
    rx: tokio::sync::Mutex<mpsc::Receiver<RecordingId>>,
    entries: Entries,
    closed: watch::Sender<bool>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            entries: Arc::new(Mutex::new(HashMap::new())),
            closed: watch::Sender::new(false),
        }
    }

    fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<RecordingId, Entry>> {
        // A panic while holding the lock leaves the map consistent
        entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or coalesce an item; waits while the queue is full, until closed
    pub async fn enqueue(&self, item: WorkItem) -> EnqueueResult {
        if self.is_closed() {
            return EnqueueResult::Closed;
        }

        let identity = item.identity.clone();
        {
            let mut entries = Self::lock(&self.entries);
            if let Some(entry) = entries.get_mut(&identity) {
                entry.item = item;
                return match entry.state {
                    EntryState::InFlight => {
                        entry.rerun = true;
                        debug!(%identity, "In flight; re-run scheduled");
                        EnqueueResult::Rerun
                    }
                    EntryState::Queued | EntryState::Delayed => {
                        debug!(%identity, "Already pending; fingerprint updated");
                        EnqueueResult::Coalesced
                    }
                };
            }
            entries.insert(
                identity.clone(),
                Entry {
                    item,
                    state: EntryState::Queued,
                    rerun: false,
                },
            );
        }

        let mut closed = self.closed.subscribe();
        let sent = tokio::select! {
            sent = self.tx.send(identity.clone()) => sent.is_ok(),
            _ = wait_closed(&mut closed) => false,
        };
        if !sent {
            Self::lock(&self.entries).remove(&identity);
            debug!(%identity, "Queue closed; not queued");
            return EnqueueResult::Closed;
        }
        debug!(%identity, "Queued");
        EnqueueResult::Queued
    }

    /// Next item to process; `None` once the queue is closed and drained
    pub async fn dequeue(&self) -> Option<WorkItem> {
        let mut rx = self.rx.lock().await;
        loop {
            let identity = rx.recv().await?;
            let mut entries = Self::lock(&self.entries);
            match entries.get_mut(&identity) {
                Some(entry) if entry.state == EntryState::Queued => {
                    entry.state = EntryState::InFlight;
                    return Some(entry.item.clone());
                }
                _ => {
                    // Stale notification
                    continue;
                }
            }
        }
    }

    /// Finish a pass over an item; re-schedules it if events arrived meanwhile
    pub fn complete(&self, identity: &RecordingId) {
        let mut entries = Self::lock(&self.entries);
        let rerun = match entries.get_mut(identity) {
            Some(entry) if entry.rerun => {
                entry.rerun = false;
                entry.state = EntryState::Queued;
                true
            }
            _ => false,
        };
        if !rerun {
            entries.remove(identity);
        }
        drop(entries);

        if rerun {
            debug!(%identity, "Re-running with updated fingerprint");
            self.resend(identity.clone(), Duration::ZERO);
        }
    }

    /// Put an item back after `delay` without holding a worker
    pub fn retry_later(&self, identity: &RecordingId, delay: Duration) {
        let known = match Self::lock(&self.entries).get_mut(identity) {
            Some(entry) => {
                entry.state = EntryState::Delayed;
                entry.rerun = false;
                true
            }
            None => false,
        };
        if known {
            self.resend(identity.clone(), delay);
        }
    }

    /// Send from a separate task so workers never block on a full queue
    fn resend(&self, identity: RecordingId, delay: Duration) {
        let tx = self.tx.clone();
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(entry) = Self::lock(&entries).get_mut(&identity) {
                entry.state = EntryState::Queued;
            }
            if tx.send(identity.clone()).await.is_err() {
                warn!(%identity, "Queue closed before retry");
            }
        });
    }

    /// Stop accepting new items. Wakes any enqueue waiting for capacity.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Identities queued, delayed or in flight
    pub fn len(&self) -> usize {
        Self::lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `identity` is queued, delayed or in flight
    pub fn contains(&self, identity: &RecordingId) -> bool {
        Self::lock(&self.entries).contains_key(identity)
    }

    /// Items currently in flight
    pub fn in_flight(&self) -> usize {
        Self::lock(&self.entries)
            .values()
            .filter(|e| e.state == EntryState::InFlight)
            .count()
    }

    /// Wait until nothing is queued, delayed or in flight
    pub async fn wait_idle(&self, poll: Duration) {
        while !self.is_empty() {
            tokio::time::sleep(poll).await;
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, hash: &str) -> WorkItem {
        WorkItem::new(
            PathBuf::from(path),
            Fingerprint {
                content_hash: hash.to_string(),
                size: 1,
                modified_ms: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_enqueue_coalesces_pending_identity() {
        let queue = WorkQueue::new(4);

        assert_eq!(queue.enqueue(item("/r/a.m4a", "one")).await, EnqueueResult::Queued);
        assert_eq!(queue.enqueue(item("/r/a.m4a", "two")).await, EnqueueResult::Coalesced);
        assert_eq!(queue.len(), 1);

        let next = queue.dequeue().await.unwrap();
        assert_eq!(next.fingerprint.content_hash, "two");
        assert_eq!(queue.in_flight(), 1);

        queue.complete(&next.identity);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_event_during_flight_reruns() {
        let queue = WorkQueue::new(4);
        queue.enqueue(item("/r/a.m4a", "one")).await;
        let first = queue.dequeue().await.unwrap();

        assert_eq!(queue.enqueue(item("/r/a.m4a", "two")).await, EnqueueResult::Rerun);
        queue.complete(&first.identity);

        let again = queue.dequeue().await.unwrap();
        assert_eq!(again.identity, first.identity);
        assert_eq!(again.fingerprint.content_hash, "two");
    }

    #[tokio::test]
    async fn test_retry_later_redelivers() {
        let queue = WorkQueue::new(4);
        queue.enqueue(item("/r/a.m4a", "one")).await;
        let first = queue.dequeue().await.unwrap();

        queue.retry_later(&first.identity, Duration::from_millis(20));
        let again = tokio::time::timeout(Duration::from_secs(2), queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.identity, first.identity);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.enqueue(item("/r/a.m4a", "a")).await;

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(item("/r/b.m4a", "b")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        queue.dequeue().await.unwrap();
        assert_eq!(blocked.await.unwrap(), EnqueueResult::Queued);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = WorkQueue::new(1);
        queue.close();
        assert_eq!(queue.enqueue(item("/r/a.m4a", "a")).await, EnqueueResult::Closed);
    }

    #[tokio::test]
    async fn test_close_releases_enqueue_waiting_for_capacity() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.enqueue(item("/r/a.m4a", "a")).await;

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(item("/r/b.m4a", "b")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .expect("enqueue returns after close")
            .unwrap();
        assert_eq!(result, EnqueueResult::Closed);
        // Only the entry that made it into the channel remains
        assert_eq!(queue.len(), 1);
    }
}
