//! Provider interfaces for external systems.
//!
//! Providers are opaque capabilities the stage executors call: one turns
//! audio into a transcript, one turns a transcript into model output. Each
//! reports failures as a classified `StageError`, so backends can be swapped
//! (local/cloud) without touching pipeline logic.

pub mod fabric;
pub mod openai;
pub mod whisper;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{
    ConfigError, InsightProviderKind, InsightsConfig, TranscriptionConfig,
    TranscriptionProviderKind,
};
use crate::domain::Transcript;
use crate::stages::StageError;

pub use fabric::FabricProvider;
pub use openai::{HttpInsightProvider, HttpTranscriptionProvider};
pub use whisper::WhisperProvider;

/// Audio → text
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    async fn transcribe(&self, audio: &Path) -> Result<Transcript, StageError>;
}

/// Prompt + transcript → raw model output
#[async_trait]
pub trait InsightProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, transcript: &str) -> Result<String, StageError>;
}

fn api_key(env_var: &str, section: &str) -> Result<String, ConfigError> {
    std::env::var(env_var).map_err(|_| {
        ConfigError::Invalid(format!("{} provider 'http' needs ${} to be set", section, env_var))
    })
}

/// Build the configured transcription provider
pub fn transcription_provider(
    config: &TranscriptionConfig,
    request_timeout: std::time::Duration,
) -> Result<Arc<dyn TranscriptionProvider>, ConfigError> {
    match config.provider {
        TranscriptionProviderKind::Whisper => Ok(Arc::new(WhisperProvider::new(
            &config.binary,
            config.model.clone().unwrap_or_else(|| "base".to_string()),
            config.language.clone(),
        ))),
        TranscriptionProviderKind::Http => {
            let provider = HttpTranscriptionProvider::new(
                &config.base_url,
                api_key(&config.api_key_env, "transcription")?,
                config.model.clone().unwrap_or_else(|| "whisper-1".to_string()),
                config.language.clone(),
                request_timeout,
            )
            .map_err(|e| ConfigError::Invalid(format!("transcription http client: {}", e)))?;
            Ok(Arc::new(provider))
        }
    }
}

/// Build the configured insight provider
pub fn insight_provider(
    config: &InsightsConfig,
    request_timeout: std::time::Duration,
) -> Result<Arc<dyn InsightProvider>, ConfigError> {
    match config.provider {
        InsightProviderKind::Fabric => Ok(Arc::new(
            FabricProvider::with_binary_path(&config.binary)
                .with_pattern(config.pattern.clone())
                .with_model(config.model.clone()),
        )),
        InsightProviderKind::Http => {
            let provider = HttpInsightProvider::new(
                &config.base_url,
                api_key(&config.api_key_env, "insights")?,
                config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
                request_timeout,
            )
            .map_err(|e| ConfigError::Invalid(format!("insights http client: {}", e)))?;
            Ok(Arc::new(provider))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_providers() {
        let transcriber =
            transcription_provider(&TranscriptionConfig::default(), Duration::from_secs(1)).unwrap();
        let insights = insight_provider(&InsightsConfig::default(), Duration::from_secs(1)).unwrap();

        assert_eq!(transcriber.name(), "whisper");
        assert_eq!(insights.name(), "fabric");
    }

    #[test]
    fn test_http_provider_needs_key() {
        let config = InsightsConfig {
            provider: InsightProviderKind::Http,
            api_key_env: "VOXPIPE_TEST_UNSET_KEY_8731".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            insight_provider(&config, Duration::from_secs(1)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
