//! Fabric insight backend.
//!
//! Spawns the `fabric` CLI, pipes the prompt and transcript to stdin and
//! collects the model's answer from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::stages::StageError;

use super::InsightProvider;

/// Fabric adapter using subprocess mode
pub struct FabricProvider {
    /// Path to the fabric binary (default: "fabric")
    binary_path: String,
    pattern: Option<String>,
    model: Option<String>,
}

impl Default for FabricProvider {
    fn default() -> Self {
        Self::with_binary_path("fabric")
    }
}

impl FabricProvider {
    /// Create a Fabric adapter with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            pattern: None,
            model: None,
        }
    }

    /// Run input through a fabric pattern instead of the raw prompt
    pub fn with_pattern(mut self, pattern: Option<String>) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(pattern) = &self.pattern {
            args.push("-p".to_string());
            args.push(pattern.clone());
        }
        if let Some(model) = &self.model {
            args.push("-m".to_string());
            args.push(model.clone());
        }
        args
    }
}

#[async_trait]
impl InsightProvider for FabricProvider {
    fn name(&self) -> &str {
        "fabric"
    }

    async fn generate(&self, prompt: &str, transcript: &str) -> Result<String, StageError> {
        debug!(binary = %self.binary_path, pattern = ?self.pattern, "Running fabric");

        let mut child = Command::new(&self.binary_path)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StageError::permanent(format!(
                    "fabric binary '{}' not found",
                    self.binary_path
                )),
                _ => StageError::transient(format!("Failed to spawn fabric: {}", e)),
            })?;

        // Write input to stdin; dropping it signals EOF
        if let Some(mut stdin) = child.stdin.take() {
            let input = format!("{}\n\nTRANSCRIPT:\n{}", prompt, transcript);
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| StageError::transient(format!("Failed to write to fabric stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::transient(format!("Failed to wait for fabric: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(StageError::transient(format!(
                "fabric failed with exit code {}: {}",
                exit_code,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| StageError::permanent("fabric output is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_args() {
        let provider = FabricProvider::with_binary_path("/custom/path/fabric")
            .with_pattern(Some("extract_wisdom".to_string()))
            .with_model(Some("gpt-4o".to_string()));

        assert_eq!(provider.name(), "fabric");
        assert_eq!(provider.binary_path, "/custom/path/fabric");
        assert_eq!(provider.args(), vec!["-p", "extract_wisdom", "-m", "gpt-4o"]);
        assert!(FabricProvider::default().args().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_permanent() {
        let provider = FabricProvider::with_binary_path("/nonexistent/fabric");
        let err = provider.generate("prompt", "text").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
