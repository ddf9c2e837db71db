//! Recording ingestion.
//!
//! ```text
//! watch root ──notify──▶ Watcher ──FsEvent (bounded)──▶ Dispatcher
//!                                                        │ settle window
//!                                                        ▼
//!                                  WorkQueue (bounded, coalescing) ──▶ workers
//! ```
//!
//! 1. **Watcher**: filters paths under the root and forwards events
//! 2. **Dispatcher**: waits for files to settle, fingerprints them
//! 3. **Queue**: one entry per identity, backpressure when full

pub mod dispatcher;
pub mod queue;
pub mod watcher;

// Re-export key types
pub use dispatcher::{DispatchReport, Dispatcher, SettleTracker};
pub use queue::{EnqueueResult, WorkItem, WorkQueue};
pub use watcher::{FsEvent, FsEventKind, RecordingFilter, WatchHandle, Watcher, WatcherError};
