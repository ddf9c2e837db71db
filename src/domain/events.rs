//! Audit trail entries for registry mutations.
//!
//! Every registry mutation appends one event in the same transaction as the
//! state change, so the trail never disagrees with the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::recording::RecordingId;
use super::stage::Stage;

/// A single entry in a recording's audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// Row id (monotonic)
    pub id: i64,

    pub identity: RecordingId,

    /// Fingerprint generation at the time of the event
    pub generation: u32,

    pub event_type: EventType,

    /// Stage before the mutation (`None` on creation)
    pub from_stage: Option<Stage>,

    /// Stage after the mutation
    pub to_stage: Stage,

    /// Human-readable summary
    pub detail: String,

    /// Error message if a failure was recorded
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// Types of registry mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Record created on first discovery
    Created,

    /// Stage moved forward
    Advanced,

    /// Orphaned in-progress stage taken over by a new session
    Reclaimed,

    /// Advancing lock dropped without a stage change
    Released,

    /// Transient failure counted against the retry budget
    FailureRecorded,

    /// Record moved to `Failed`
    Failed,

    /// Fingerprint changed; stage reset to `Discovered`
    Reset,

    /// Failed record re-driven by an operator
    Redriven,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Advanced => "advanced",
            EventType::Reclaimed => "reclaimed",
            EventType::Released => "released",
            EventType::FailureRecorded => "failure_recorded",
            EventType::Failed => "failed",
            EventType::Reset => "reset",
            EventType::Redriven => "redriven",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            EventType::Created,
            EventType::Advanced,
            EventType::Reclaimed,
            EventType::Released,
            EventType::FailureRecorded,
            EventType::Failed,
            EventType::Reset,
            EventType::Redriven,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}
