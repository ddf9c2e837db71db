//! voxpipe - Idempotent voice-recording pipeline
//!
//! Watches a directory for audio recordings and takes each one through a
//! fixed sequence of stages: transcription, insight extraction, persistence.
//!
//! # Architecture
//!
//! The system is built around a durable per-recording registry:
//! - Every recording has one ProcessingRecord (SQLite) with its stage
//! - Stage transitions are compare-and-swap; the registry is the lock
//! - A changed content fingerprint resets a recording to `Discovered`
//! - Interrupted work resumes from the last settled stage on restart
//!
//! # Modules
//!
//! - `adapters`: Transcription and insight providers (whisper, fabric, HTTP)
//! - `core`: Registry, retry policy, coordinator, worker pool
//! - `domain`: Data structures (Recording, Stage, ProcessingRecord, Insights)
//! - `ingest`: Watcher, settle-window dispatcher, coalescing queue
//! - `stages`: Transcriber, insight extractor, persister
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Watch the inbox and process recordings as they arrive
//! voxpipe watch
//!
//! # Process whatever is there now, then exit
//! voxpipe run
//!
//! # Inspect and re-drive
//! voxpipe status "Monday at 14-30.m4a"
//! voxpipe redrive --all-failed
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod stages;

// Re-export main types at crate root for convenience
pub use crate::core::{Coordinator, Outcome, Registry, WorkerPool};
pub use domain::{Fingerprint, ProcessingRecord, Recording, RecordingId, Stage, Step};
pub use ingest::{Dispatcher, WorkItem, WorkQueue, Watcher};
