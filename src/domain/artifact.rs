//! Artifacts produced by stage executors.
//!
//! An artifact is a reference to a stage's output on disk. Artifacts are
//! write-once per step per fingerprint generation; a new generation
//! supersedes earlier ones without deleting them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::Step;

/// Reference to a stage output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Step that produced this artifact
    pub step: Step,

    /// Where the output lives
    pub location: PathBuf,

    /// Fingerprint generation the artifact belongs to
    pub generation: u32,

    /// When the artifact was recorded
    pub created_at: DateTime<Utc>,

    /// Replaced by a newer fingerprint generation
    #[serde(default)]
    pub superseded: bool,
}

impl ArtifactRef {
    pub fn new(step: Step, location: PathBuf, generation: u32) -> Self {
        Self {
            step,
            location,
            generation,
            created_at: Utc::now(),
            superseded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_creation() {
        let artifact = ArtifactRef::new(Step::Transcribe, PathBuf::from("/a/transcript.json"), 2);

        assert_eq!(artifact.step, Step::Transcribe);
        assert_eq!(artifact.generation, 2);
        assert!(!artifact.superseded);
    }
}
