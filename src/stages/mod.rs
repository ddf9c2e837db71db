//! Stage executors.
//!
//! Three fixed units, one per step, all honouring the same contract: run
//! once against a recording's context, produce one artifact or fail with a
//! classified `StageError`:
//! - Transcriber: recording → `transcript.json`
//! - InsightExtractor: transcript → `insights.json`
//! - Persister: all artifacts → library document

pub mod error;
pub mod insights;
pub mod naming;
pub mod persister;
pub mod transcriber;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::adapters::{InsightProvider, TranscriptionProvider};
use crate::domain::{ArtifactRef, Fingerprint, ProcessingRecord, RecordingId, Step};

pub use error::StageError;
pub use insights::{InsightExtractor, INSIGHTS_PROMPT};
pub use persister::Persister;
pub use transcriber::Transcriber;

/// Everything an executor may read about the recording it runs for
#[derive(Debug, Clone)]
pub struct StageContext {
    pub identity: RecordingId,
    pub source_path: PathBuf,
    pub fingerprint: Fingerprint,
    pub generation: u32,
    /// Artifacts recorded so far in this generation
    pub artifacts: HashMap<Step, ArtifactRef>,
    /// Directory for this generation's stage outputs
    pub work_dir: PathBuf,
}

impl StageContext {
    pub fn from_record(record: &ProcessingRecord, artifacts_root: &Path) -> Self {
        Self {
            identity: record.identity.clone(),
            source_path: record.source_path.clone(),
            fingerprint: record.fingerprint.clone(),
            generation: record.generation,
            artifacts: record.artifacts.clone(),
            work_dir: artifacts_root
                .join(record.identity.as_str())
                .join(format!("g{}", record.generation)),
        }
    }

    /// Location of an earlier step's output
    pub fn input(&self, step: Step) -> Result<&Path, StageError> {
        self.artifacts
            .get(&step)
            .map(|a| a.location.as_path())
            .ok_or_else(|| StageError::permanent(format!("no {} artifact recorded", step)))
    }
}

/// Output of a successful stage run
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub location: PathBuf,
}

/// Uniform executor contract
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn step(&self) -> Step;

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError>;
}

/// The fixed set of executors, selected by step
pub struct Stages {
    pub transcriber: Transcriber,
    pub extractor: InsightExtractor,
    pub persister: Persister,
}

impl Stages {
    pub fn new(
        transcription: Arc<dyn TranscriptionProvider>,
        insights: Arc<dyn InsightProvider>,
        prompt: Option<String>,
        library: PathBuf,
    ) -> Self {
        Self {
            transcriber: Transcriber::new(transcription),
            extractor: InsightExtractor::new(insights, prompt),
            persister: Persister::new(library),
        }
    }

    pub async fn run(&self, step: Step, ctx: &StageContext) -> Result<StageOutput, StageError> {
        match step {
            Step::Transcribe => self.transcriber.run(ctx).await,
            Step::ExtractInsights => self.extractor.run(ctx).await,
            Step::Persist => self.persister.run(ctx).await,
        }
    }
}

// ============================================================================
// Artifact I/O
// ============================================================================

/// Read a JSON artifact; unreadable or malformed content is permanent
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StageError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StageError::from_io(&format!("Failed to read {}", path.display()), &e))?;
    serde_json::from_str(&content)
        .map_err(|e| StageError::permanent(format!("Malformed {}: {}", path.display(), e)))
}

/// Create-or-replace `path` atomically (temp file in the same dir + rename)
pub(crate) async fn write_atomic(path: PathBuf, contents: Vec<u8>) -> Result<(), StageError> {
    tokio::task::spawn_blocking(move || write_atomic_sync(&path, &contents))
        .await
        .map_err(|e| StageError::transient(format!("Write task failed: {}", e)))?
}

fn write_atomic_sync(path: &Path, contents: &[u8]) -> Result<(), StageError> {
    let context = format!("Failed to write {}", path.display());
    let dir = path
        .parent()
        .ok_or_else(|| StageError::permanent(format!("{} has no parent directory", path.display())))?;

    std::fs::create_dir_all(dir).map_err(|e| StageError::from_io(&context, &e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StageError::from_io(&context, &e))?;
    tmp.write_all(contents)
        .map_err(|e| StageError::from_io(&context, &e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StageError::from_io(&context, &e))?;
    tmp.persist(path)
        .map_err(|e| StageError::from_io(&context, &e.error))?;
    Ok(())
}
