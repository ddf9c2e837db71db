//! Processing stages and the fixed order a recording moves through them.
//!
//! ```text
//! Discovered → Transcribing → Transcribed → ExtractingInsights
//!            → InsightsExtracted → Persisting → Completed
//! ```
//!
//! `Failed` is reachable from any in-progress stage; any stage can be reset
//! to `Discovered` when the recording's fingerprint changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stage of a recording in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Seen on disk, nothing done yet
    Discovered,

    /// Transcription claimed by a worker
    Transcribing,

    /// Transcript artifact recorded
    Transcribed,

    /// Insight extraction claimed by a worker
    ExtractingInsights,

    /// Insights artifact recorded
    InsightsExtracted,

    /// Persistence claimed by a worker
    Persisting,

    /// All stages done for the current fingerprint
    Completed,

    /// Retry budget exhausted or permanent error
    Failed,
}

impl Stage {
    /// Forward sequence (excludes `Failed`)
    pub const SEQUENCE: [Stage; 7] = [
        Stage::Discovered,
        Stage::Transcribing,
        Stage::Transcribed,
        Stage::ExtractingInsights,
        Stage::InsightsExtracted,
        Stage::Persisting,
        Stage::Completed,
    ];

    /// Stable string form used in the registry
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Transcribing => "transcribing",
            Stage::Transcribed => "transcribed",
            Stage::ExtractingInsights => "extracting_insights",
            Stage::InsightsExtracted => "insights_extracted",
            Stage::Persisting => "persisting",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Next stage along the forward sequence
    pub fn next(&self) -> Option<Stage> {
        let idx = Self::SEQUENCE.iter().position(|s| s == self)?;
        Self::SEQUENCE.get(idx + 1).copied()
    }

    /// Whether `to` is the single legal forward step from `self`
    pub fn can_advance_to(&self, to: Stage) -> bool {
        self.next() == Some(to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// A worker holds (or held) the advancing lock in this stage
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Stage::Transcribing | Stage::ExtractingInsights | Stage::Persisting
        )
    }

    /// Step that has to run to leave this stage, if any
    pub fn pending_step(&self) -> Option<Step> {
        match self {
            Stage::Discovered | Stage::Transcribing => Some(Step::Transcribe),
            Stage::Transcribed | Stage::ExtractingInsights => Some(Step::ExtractInsights),
            Stage::InsightsExtracted | Stage::Persisting => Some(Step::Persist),
            Stage::Completed | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SEQUENCE
            .iter()
            .chain(std::iter::once(&Stage::Failed))
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// One unit of work between two settled stages.
///
/// Each step has a stage executor, a retry policy and an artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Transcribe,
    ExtractInsights,
    Persist,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Transcribe, Step::ExtractInsights, Step::Persist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Transcribe => "transcribe",
            Step::ExtractInsights => "extract_insights",
            Step::Persist => "persist",
        }
    }

    /// Settled stage the step starts from
    pub fn from_stage(&self) -> Stage {
        match self {
            Step::Transcribe => Stage::Discovered,
            Step::ExtractInsights => Stage::Transcribed,
            Step::Persist => Stage::InsightsExtracted,
        }
    }

    /// In-progress stage held while the executor runs
    pub fn running_stage(&self) -> Stage {
        match self {
            Step::Transcribe => Stage::Transcribing,
            Step::ExtractInsights => Stage::ExtractingInsights,
            Step::Persist => Stage::Persisting,
        }
    }

    /// Settled stage reached on success
    pub fn done_stage(&self) -> Stage {
        match self {
            Step::Transcribe => Stage::Transcribed,
            Step::ExtractInsights => Stage::InsightsExtracted,
            Step::Persist => Stage::Completed,
        }
    }

    /// Step owning an in-progress stage
    pub fn for_running_stage(stage: Stage) -> Option<Step> {
        Self::ALL.into_iter().find(|s| s.running_stage() == stage)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_sequence() {
        assert_eq!(Stage::Discovered.next(), Some(Stage::Transcribing));
        assert_eq!(Stage::Persisting.next(), Some(Stage::Completed));
        assert_eq!(Stage::Completed.next(), None);
        assert_eq!(Stage::Failed.next(), None);

        assert!(Stage::Transcribed.can_advance_to(Stage::ExtractingInsights));
        assert!(!Stage::Transcribed.can_advance_to(Stage::Completed));
        assert!(!Stage::Transcribed.can_advance_to(Stage::Discovered));
    }

    #[test]
    fn test_stage_string_roundtrip() {
        for stage in Stage::SEQUENCE.iter().chain([Stage::Failed].iter()) {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), *stage);
        }
        assert!("nope".parse::<Stage>().is_err());
    }

    #[test]
    fn test_steps_cover_sequence() {
        for step in Step::ALL {
            assert!(step.from_stage().can_advance_to(step.running_stage()));
            assert!(step.running_stage().can_advance_to(step.done_stage()));
            assert_eq!(Step::for_running_stage(step.running_stage()), Some(step));
            assert_eq!(step.from_stage().pending_step(), Some(step));
            assert_eq!(step.running_stage().pending_step(), Some(step));
        }
        assert_eq!(Stage::Completed.pending_step(), None);
    }
}
