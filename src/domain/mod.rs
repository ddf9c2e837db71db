//! Domain types for the voxpipe pipeline.
//!
//! This module contains the core data structures:
//! - Recording: identity and content fingerprint of a source file
//! - Stage: the fixed processing sequence
//! - ProcessingRecord: durable per-recording state
//! - Artifacts, transcripts and insights produced by stages
//! - StageEvent: audit trail of registry mutations

pub mod artifact;
pub mod events;
pub mod insights;
pub mod record;
pub mod recording;
pub mod stage;

// Re-export commonly used types
pub use artifact::ArtifactRef;
pub use events::{EventType, StageEvent};
pub use insights::{ActionItem, Insights, Transcript, INSIGHTS_SCHEMA_VERSION};
pub use record::{ProcessingRecord, StageCounts};
pub use recording::{Fingerprint, Recording, RecordingId};
pub use stage::{Stage, Step};
