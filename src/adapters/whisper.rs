//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary and reads its JSON output from a
//! temp dir.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::domain::Transcript;
use crate::stages::StageError;

use super::TranscriptionProvider;

/// stderr fragments whisper/ffmpeg print for undecodable input
const UNDECODABLE_MARKERS: [&str; 4] = [
    "Failed to load audio",
    "Invalid data found",
    "could not find codec",
    "does not contain any stream",
];

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    end: f64,
}

/// Local whisper CLI
pub struct WhisperProvider {
    binary: PathBuf,
    model: String,
    language: Option<String>,
}

impl WhisperProvider {
    pub fn new(binary: impl Into<PathBuf>, model: impl Into<String>, language: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            language,
        }
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperProvider {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, audio: &Path) -> Result<Transcript, StageError> {
        let temp_dir = tempfile::tempdir()
            .map_err(|e| StageError::from_io("Failed to create temp dir", &e))?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg(audio)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json");
        if let Some(language) = &self.language {
            cmd.arg("--language").arg(language);
        }

        debug!(binary = %self.binary.display(), audio = %audio.display(), "Running whisper");
        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StageError::permanent(format!(
                    "whisper binary not found at {}",
                    self.binary.display()
                )),
                _ => StageError::transient(format!("Failed to run whisper: {}", e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let msg = format!("Whisper failed: {}", stderr.trim());
            return Err(if UNDECODABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
                StageError::Permanent(msg)
            } else {
                StageError::Transient(msg)
            });
        }

        let stem = audio.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));
        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| StageError::permanent(format!("Failed to read whisper output: {}", e)))?;

        parse_output(&json_content, self.language.as_deref())
    }
}

fn parse_output(json: &str, language: Option<&str>) -> Result<Transcript, StageError> {
    let whisper: WhisperOutput = serde_json::from_str(json)
        .map_err(|e| StageError::permanent(format!("Failed to parse whisper JSON: {}", e)))?;

    let duration = whisper.segments.last().map(|s| s.end).unwrap_or(0.0);
    let language = if whisper.language.is_empty() {
        language.unwrap_or("en").to_string()
    } else {
        whisper.language
    };

    Ok(Transcript {
        text: whisper.text.trim().to_string(),
        language,
        duration_seconds: duration,
        provider: "whisper".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whisper_output() {
        let json = r#"{"text": " hello there ", "language": "de", "segments": [{"end": 1.5}, {"end": 4.25}]}"#;
        let transcript = parse_output(json, None).unwrap();

        assert_eq!(transcript.text, "hello there");
        assert_eq!(transcript.language, "de");
        assert_eq!(transcript.duration_seconds, 4.25);
    }

    #[test]
    fn test_parse_whisper_defaults_language() {
        let transcript = parse_output(r#"{"text": "hi"}"#, Some("fr")).unwrap();
        assert_eq!(transcript.language, "fr");
        assert_eq!(transcript.duration_seconds, 0.0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_permanent() {
        let provider = WhisperProvider::new("/nonexistent/whisper-binary", "base", None);
        let err = provider
            .transcribe(Path::new("/tmp/none.m4a"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
