//! OpenAI-compatible HTTP backends.
//!
//! Endpoints:
//! - POST {base_url}/audio/transcriptions (multipart upload)
//! - POST {base_url}/chat/completions (JSON)
//!
//! Auth: Bearer token

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::domain::Transcript;
use crate::stages::StageError;

use super::{InsightProvider, TranscriptionProvider};

/// Shared HTTP client settings
#[derive(Clone)]
struct ApiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ApiClient {
    fn new(base_url: &str, api_key: String, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, StageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Map an HTTP error status to the two error kinds
pub fn classify_status(status: StatusCode, body: &str) -> StageError {
    let msg = format!("API error ({}): {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        StageError::Transient(msg)
    } else {
        StageError::Permanent(msg)
    }
}

/// Map a transport failure to the two error kinds
fn classify_transport(err: reqwest::Error) -> StageError {
    if err.is_decode() || err.is_builder() {
        StageError::permanent(format!("Invalid API response: {}", err))
    } else {
        StageError::transient(format!("API request failed: {}", err))
    }
}

// ============================================================================
// Transcription
// ============================================================================

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

/// Transcription through an OpenAI-compatible audio endpoint
pub struct HttpTranscriptionProvider {
    api: ApiClient,
    model: String,
    language: Option<String>,
}

impl HttpTranscriptionProvider {
    pub fn new(
        base_url: &str,
        api_key: String,
        model: impl Into<String>,
        language: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            api: ApiClient::new(base_url, api_key, request_timeout)?,
            model: model.into(),
            language,
        })
    }
}

#[async_trait]
impl TranscriptionProvider for HttpTranscriptionProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn transcribe(&self, audio: &Path) -> Result<Transcript, StageError> {
        let file_name = audio
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let file_bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| StageError::from_io("Failed to read audio file", &e))?;

        let file_part = Part::bytes(file_bytes)
            .file_name(file_name)
            .mime_str(mime_for(audio))
            .map_err(classify_transport)?;

        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", file_part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        debug!(audio = %audio.display(), model = %self.model, "Uploading for transcription");
        let response = self
            .api
            .client
            .post(self.api.url("audio/transcriptions"))
            .bearer_auth(&self.api.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport)?;

        let result: TranscriptionResponse = self
            .api
            .check(response)
            .await?
            .json()
            .await
            .map_err(classify_transport)?;

        Ok(Transcript {
            text: result.text.trim().to_string(),
            language: result
                .language
                .or_else(|| self.language.clone())
                .unwrap_or_else(|| "en".to_string()),
            duration_seconds: result.duration.unwrap_or(0.0),
            provider: format!("http:{}", self.model),
        })
    }
}

fn mime_for(audio: &Path) -> &'static str {
    let ext = audio
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "audio/mp4",
    }
}

// ============================================================================
// Chat completions
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Insight generation through an OpenAI-compatible chat endpoint
pub struct HttpInsightProvider {
    api: ApiClient,
    model: String,
}

impl HttpInsightProvider {
    pub fn new(
        base_url: &str,
        api_key: String,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            api: ApiClient::new(base_url, api_key, request_timeout)?,
            model: model.into(),
        })
    }
}

#[async_trait]
impl InsightProvider for HttpInsightProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, prompt: &str, transcript: &str) -> Result<String, StageError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt },
                { "role": "user", "content": transcript },
            ],
            "response_format": { "type": "json_object" },
        });

        debug!(model = %self.model, chars = transcript.len(), "Requesting insights");
        let response = self
            .api
            .client
            .post(self.api.url("chat/completions"))
            .bearer_auth(&self.api.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let result: ChatResponse = self
            .api
            .check(response)
            .await?
            .json()
            .await
            .map_err(classify_transport)?;

        extract_content(result)
    }
}

fn extract_content(response: ChatResponse) -> Result<String, StageError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| StageError::permanent("Chat response has no choices"))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(StageError::permanent(format!("Provider refused: {}", refusal)));
    }
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(StageError::permanent("Provider content filter triggered"));
    }

    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => Err(StageError::permanent("Chat response is empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: serde_json::Value) -> ChatResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "").is_transient());
    }

    #[test]
    fn test_extract_content() {
        let ok = response(json!({
            "choices": [{"message": {"content": "{\"summary\": \"x\"}"}, "finish_reason": "stop"}]
        }));
        assert_eq!(extract_content(ok).unwrap(), "{\"summary\": \"x\"}");
    }

    #[test]
    fn test_refusals_are_permanent() {
        let refused = response(json!({
            "choices": [{"message": {"content": null, "refusal": "I can't"}}]
        }));
        let filtered = response(json!({
            "choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]
        }));

        assert!(!extract_content(refused).unwrap_err().is_transient());
        assert!(!extract_content(filtered).unwrap_err().is_transient());
        assert!(!extract_content(response(json!({"choices": []}))).unwrap_err().is_transient());
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for(Path::new("a.MP3")), "audio/mpeg");
        assert_eq!(mime_for(Path::new("a.m4a")), "audio/mp4");
    }
}
