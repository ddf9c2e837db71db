//! Stage output documents: transcripts and versioned insights.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current insights schema version
pub const INSIGHTS_SCHEMA_VERSION: u32 = 1;

/// Transcript produced by a transcription provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub duration_seconds: f64,

    /// Provider that produced the transcript
    #[serde(default)]
    pub provider: String,
}

/// Structured insights derived from a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub schema_version: u32,
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    pub provider: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<String>,
}

/// Shape the model is asked to return
#[derive(Debug, Deserialize)]
struct RawInsights {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    action_items: Vec<RawActionItem>,
}

/// Models return action items either as strings or as objects
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawActionItem {
    Text(String),
    Item(ActionItem),
}

impl Insights {
    /// Parse provider output into the versioned schema.
    ///
    /// Accepts a bare JSON object or one wrapped in a fenced code block.
    pub fn parse(raw: &str, provider: &str) -> Result<Self, String> {
        let body = strip_code_fence(raw);
        let parsed: RawInsights = serde_json::from_str(body)
            .map_err(|e| format!("provider output is not the insights JSON object: {}", e))?;

        if parsed.summary.trim().is_empty() {
            return Err("provider output has no summary".to_string());
        }

        let action_items = parsed
            .action_items
            .into_iter()
            .map(|item| match item {
                RawActionItem::Text(description) => ActionItem {
                    description,
                    owner: None,
                    due: None,
                },
                RawActionItem::Item(item) => item,
            })
            .filter(|item| !item.description.trim().is_empty())
            .collect();

        Ok(Self {
            schema_version: INSIGHTS_SCHEMA_VERSION,
            summary: parsed.summary.trim().to_string(),
            topics: parsed
                .topics
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            action_items,
            provider: provider.to_string(),
            generated_at: Utc::now(),
        })
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
