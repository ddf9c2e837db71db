use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::adapters::TranscriptionProvider;
use crate::domain::Step;

use super::{write_atomic, StageContext, StageError, StageExecutor, StageOutput};

/// Recording → `transcript.json`
pub struct Transcriber {
    provider: Arc<dyn TranscriptionProvider>,
}

impl Transcriber {
    pub fn new(provider: Arc<dyn TranscriptionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageExecutor for Transcriber {
    fn step(&self) -> Step {
        Step::Transcribe
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        tokio::fs::metadata(&ctx.source_path)
            .await
            .map_err(|e| StageError::from_io("Recording unavailable", &e))?;

        let transcript = self.provider.transcribe(&ctx.source_path).await?;

        let location = ctx.work_dir.join("transcript.json");
        let body = serde_json::to_vec_pretty(&transcript)
            .map_err(|e| StageError::permanent(format!("Failed to encode transcript: {}", e)))?;
        write_atomic(location.clone(), body).await?;

        info!(
            identity = %ctx.identity,
            provider = self.provider.name(),
            chars = transcript.text.len(),
            duration_secs = transcript.duration_seconds,
            "Transcribed"
        );
        Ok(StageOutput { location })
    }
}
