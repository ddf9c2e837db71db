use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{Local, TimeZone, Utc};
use tracing::info;

use crate::domain::{Insights, Step, Transcript};

use super::naming::document_name;
use super::{read_json, write_atomic, StageContext, StageError, StageExecutor, StageOutput};

/// All artifacts → `<library>/<name>.md` + `<name>.insights.json`
pub struct Persister {
    library: PathBuf,
}

impl Persister {
    pub fn new(library: PathBuf) -> Self {
        Self { library }
    }
}

#[async_trait]
impl StageExecutor for Persister {
    fn step(&self) -> Step {
        Step::Persist
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let transcript: Transcript = read_json(ctx.input(Step::Transcribe)?).await?;
        let insights: Insights = read_json(ctx.input(Step::ExtractInsights)?).await?;

        let modified = Local
            .timestamp_millis_opt(ctx.fingerprint.modified_ms)
            .single()
            .unwrap_or_else(|| Utc::now().with_timezone(&Local))
            .naive_local();
        let name = document_name(&ctx.source_path, modified, &ctx.identity);

        let sidecar = self.library.join(format!("{}.insights.json", name));
        let body = serde_json::to_vec_pretty(&insights)
            .map_err(|e| StageError::permanent(format!("Failed to encode insights: {}", e)))?;
        write_atomic(sidecar, body).await?;

        let location = self.library.join(format!("{}.md", name));
        write_atomic(location.clone(), render(ctx, &transcript, &insights).into_bytes()).await?;

        info!(identity = %ctx.identity, path = %location.display(), "Persisted");
        Ok(StageOutput { location })
    }
}

/// Markdown document with YAML front matter
fn render(ctx: &StageContext, transcript: &Transcript, insights: &Insights) -> String {
    let mut doc = format!(
        "---\nidentity: {}\nsource: {}\nfingerprint: {}\ngeneration: {}\nlanguage: {}\nduration_seconds: {:.1}\ninsights_schema: {}\ngenerated_at: {}\n---\n\n",
        ctx.identity,
        serde_json::Value::String(ctx.source_path.display().to_string()),
        ctx.fingerprint.content_hash,
        ctx.generation,
        transcript.language,
        transcript.duration_seconds,
        insights.schema_version,
        insights.generated_at.to_rfc3339(),
    );

    doc.push_str(&format!("## Summary\n\n{}\n\n", insights.summary));

    if !insights.topics.is_empty() {
        doc.push_str("## Topics\n\n");
        for topic in &insights.topics {
            doc.push_str(&format!("- {}\n", topic));
        }
        doc.push('\n');
    }

    if !insights.action_items.is_empty() {
        doc.push_str("## Action items\n\n");
        for item in &insights.action_items {
            doc.push_str(&format!("- [ ] {}", item.description));
            if let Some(owner) = &item.owner {
                doc.push_str(&format!(" (owner: {})", owner));
            }
            if let Some(due) = &item.due {
                doc.push_str(&format!(" (due: {})", due));
            }
            doc.push('\n');
        }
        doc.push('\n');
    }

    doc.push_str(&format!("## Transcript\n\n{}\n", transcript.text));
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionItem, ArtifactRef, Fingerprint, RecordingId, INSIGHTS_SCHEMA_VERSION};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn context(temp: &TempDir, with_insights: bool) -> StageContext {
        let work_dir = temp.path().join("artifacts");
        std::fs::create_dir_all(&work_dir).unwrap();

        let transcript = Transcript {
            text: "We agreed to ship on Friday.".to_string(),
            language: "en".to_string(),
            duration_seconds: 12.0,
            provider: "stub".to_string(),
        };
        let insights = Insights {
            schema_version: INSIGHTS_SCHEMA_VERSION,
            summary: "Release planning.".to_string(),
            topics: vec!["release".to_string()],
            action_items: vec![ActionItem {
                description: "Ship it".to_string(),
                owner: Some("Sam".to_string()),
                due: None,
            }],
            provider: "stub".to_string(),
            generated_at: Utc::now(),
        };

        let transcript_path = work_dir.join("transcript.json");
        let insights_path = work_dir.join("insights.json");
        std::fs::write(&transcript_path, serde_json::to_vec(&transcript).unwrap()).unwrap();
        std::fs::write(&insights_path, serde_json::to_vec(&insights).unwrap()).unwrap();

        let mut artifacts = HashMap::new();
        artifacts.insert(Step::Transcribe, ArtifactRef::new(Step::Transcribe, transcript_path, 0));
        if with_insights {
            artifacts.insert(
                Step::ExtractInsights,
                ArtifactRef::new(Step::ExtractInsights, insights_path, 0),
            );
        }

        StageContext {
            identity: RecordingId::new("abcdef123456"),
            source_path: PathBuf::from("/in/standup.m4a"),
            fingerprint: Fingerprint {
                content_hash: "0123456789abcdef".to_string(),
                size: 10,
                modified_ms: 1_710_000_000_000,
            },
            generation: 0,
            artifacts,
            work_dir,
        }
    }

    #[tokio::test]
    async fn test_persist_writes_document_and_sidecar() {
        let temp = TempDir::new().unwrap();
        let library = temp.path().join("library");
        let persister = Persister::new(library.clone());

        let output = persister.run(&context(&temp, true)).await.unwrap();

        assert_eq!(output.location, library.join("standup-abcdef.md"));
        let doc = std::fs::read_to_string(&output.location).unwrap();
        assert!(doc.starts_with("---\nidentity: abcdef123456\n"));
        assert!(doc.contains("## Summary\n\nRelease planning."));
        assert!(doc.contains("- [ ] Ship it (owner: Sam)"));
        assert!(doc.contains("We agreed to ship on Friday."));
        assert!(library.join("standup-abcdef.insights.json").exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_permanent() {
        let temp = TempDir::new().unwrap();
        let persister = Persister::new(temp.path().join("library"));

        let err = persister.run(&context(&temp, false)).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
