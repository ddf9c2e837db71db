//! Per-recording processing state, owned by the registry.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::recording::{Fingerprint, RecordingId};
use super::stage::{Stage, Step};

/// Durable processing state of one recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Immutable identity
    pub identity: RecordingId,

    /// Source location at discovery
    pub source_path: PathBuf,

    /// Current stage
    pub stage: Stage,

    /// Attempts made at the current stage
    pub attempts: u32,

    /// Last failure description
    pub last_error: Option<String>,

    /// Fingerprint of the current generation
    pub fingerprint: Fingerprint,

    /// Fingerprint the last `Completed` run was produced from
    pub fingerprint_at_last_success: Option<Fingerprint>,

    /// Bumped on every fingerprint reset
    pub generation: u32,

    /// In-progress stage that failed (set while `stage == Failed`)
    pub failed_stage: Option<Stage>,

    /// Process session holding the advancing lock, if any
    pub claimed_by: Option<Uuid>,

    /// Current-generation artifacts by step
    pub artifacts: HashMap<Step, ArtifactRef>,

    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    /// Artifact of a step in the current generation
    pub fn artifact(&self, step: Step) -> Option<&ArtifactRef> {
        self.artifacts.get(&step)
    }

    /// Whether the record's generation was produced from `fingerprint`
    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprint.same_content(fingerprint)
    }

    pub fn is_completed(&self) -> bool {
        self.stage == Stage::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }
}

/// Record counts per stage
#[derive(Debug, Clone, Default)]
pub struct StageCounts {
    pub counts: HashMap<Stage, usize>,
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> usize {
        self.counts.get(&stage).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Records neither completed nor failed
    pub fn in_flight(&self) -> usize {
        self.total() - self.get(Stage::Completed) - self.get(Stage::Failed)
    }
}
