use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::adapters::InsightProvider;
use crate::domain::{Insights, Step, Transcript};

use super::{read_json, write_atomic, StageContext, StageError, StageExecutor, StageOutput};

/// Built-in extraction prompt; describes insights schema v1
pub const INSIGHTS_PROMPT: &str = r#"You analyse transcripts of voice recordings.
Respond with a single JSON object and nothing else, using exactly these keys:
{
  "summary": "two to four sentences describing what was said",
  "topics": ["short topic", "..."],
  "action_items": [{"description": "what to do", "owner": "who, if stated", "due": "when, if stated"}]
}
Use empty arrays when there are no topics or action items. Omit owner and due when they are not stated."#;

/// Transcript → `insights.json`
pub struct InsightExtractor {
    provider: Arc<dyn InsightProvider>,
    prompt: String,
}

impl InsightExtractor {
    pub fn new(provider: Arc<dyn InsightProvider>, prompt: Option<String>) -> Self {
        Self {
            provider,
            prompt: prompt.unwrap_or_else(|| INSIGHTS_PROMPT.to_string()),
        }
    }
}

#[async_trait]
impl StageExecutor for InsightExtractor {
    fn step(&self) -> Step {
        Step::ExtractInsights
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let transcript: Transcript = read_json(ctx.input(Step::Transcribe)?).await?;
        if transcript.text.trim().is_empty() {
            return Err(StageError::permanent("Transcript is empty"));
        }

        let raw = self.provider.generate(&self.prompt, &transcript.text).await?;
        let insights = Insights::parse(&raw, self.provider.name()).map_err(StageError::Permanent)?;

        let location = ctx.work_dir.join("insights.json");
        let body = serde_json::to_vec_pretty(&insights)
            .map_err(|e| StageError::permanent(format!("Failed to encode insights: {}", e)))?;
        write_atomic(location.clone(), body).await?;

        info!(
            identity = %ctx.identity,
            provider = self.provider.name(),
            topics = insights.topics.len(),
            action_items = insights.action_items.len(),
            "Insights extracted"
        );
        Ok(StageOutput { location })
    }
}
