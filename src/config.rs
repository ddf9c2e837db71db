//! Configuration for voxpipe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VOXPIPE_HOME, VOXPIPE_LIBRARY, VOXPIPE_WATCH)
//! 2. Config file, discovered in this order:
//!    `--config <path>`, `VOXPIPE_CONFIG`, `.voxpipe/config.yaml` in the
//!    current directory or a parent, `~/.config/voxpipe/config.yaml`
//! 3. Defaults (~/.voxpipe)
//!
//! Relative paths in the config file are resolved against the file's
//! directory; `~/` is expanded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::core::policy::{RetryPolicy, StagePolicies};
use crate::domain::Step;

/// Configuration errors; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// File schema
// ============================================================================

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub insights: InsightsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Directory to watch (non-recursive)
    pub path: Option<String>,

    /// Eligible extensions, without the dot, case-insensitive
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Glob patterns of paths to ignore
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,

    /// Quiet period before a file counts as fully written
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,

    /// Emit existing files before live watching starts
    #[serde(default = "default_true")]
    pub scan_on_startup: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            path: None,
            extensions: default_extensions(),
            ignore: default_ignore(),
            settle_window_ms: default_settle_window_ms(),
            scan_on_startup: true,
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["m4a", "mp3", "wav", "ogg", "flac", "webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_ignore() -> Vec<String> {
    vec!["**/.*".to_string()]
}
fn default_settle_window_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (registry, artifacts)
    pub home: Option<String>,
    /// Where persisted documents are written
    pub library: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_transcribe_policy")]
    pub transcribe: RetryPolicy,
    #[serde(default = "default_extract_policy")]
    pub extract_insights: RetryPolicy,
    #[serde(default = "default_persist_policy")]
    pub persist: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            transcribe: default_transcribe_policy(),
            extract_insights: default_extract_policy(),
            persist: default_persist_policy(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    64
}
fn default_transcribe_policy() -> RetryPolicy {
    StagePolicies::default().get(Step::Transcribe)
}
fn default_extract_policy() -> RetryPolicy {
    StagePolicies::default().get(Step::ExtractInsights)
}
fn default_persist_policy() -> RetryPolicy {
    StagePolicies::default().get(Step::Persist)
}

impl PipelineConfig {
    pub fn policies(&self) -> StagePolicies {
        StagePolicies::default()
            .with(Step::Transcribe, self.transcribe.clone())
            .with(Step::ExtractInsights, self.extract_insights.clone())
            .with(Step::Persist, self.persist.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionProviderKind {
    #[default]
    Whisper,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default)]
    pub provider: TranscriptionProviderKind,
    /// whisper binary
    #[serde(default = "default_whisper_binary")]
    pub binary: String,
    /// Model name; provider-specific default when unset
    pub model: Option<String>,
    pub language: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key (http provider)
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: TranscriptionProviderKind::Whisper,
            binary: default_whisper_binary(),
            model: None,
            language: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightProviderKind {
    #[default]
    Fabric,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InsightsConfig {
    #[serde(default)]
    pub provider: InsightProviderKind,
    #[serde(default = "default_fabric_binary")]
    pub binary: String,
    /// fabric pattern; the built-in prompt is piped in when unset
    pub pattern: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Replaces the built-in extraction prompt
    pub prompt: Option<String>,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            provider: InsightProviderKind::Fabric,
            binary: default_fabric_binary(),
            pattern: None,
            model: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            prompt: None,
        }
    }
}

fn default_whisper_binary() -> String {
    "whisper".to_string()
}
fn default_fabric_binary() -> String {
    "fabric".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

// ============================================================================
// Resolved settings
// ============================================================================

/// Watcher settings with resolved paths
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub root: PathBuf,
    /// Lowercased, without dots
    pub extensions: Vec<String>,
    pub ignore: Vec<String>,
    pub settle_window: Duration,
    pub scan_on_startup: bool,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Registry, artifacts and the instance lock
    pub home: PathBuf,
    /// Persisted documents
    pub library: PathBuf,
    pub watch: WatchSettings,
    pub workers: usize,
    pub queue_capacity: usize,
    pub policies: StagePolicies,
    pub transcription: TranscriptionConfig,
    pub insights: InsightsConfig,
}

/// Values taken from the process environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub config: Option<PathBuf>,
    pub home: Option<PathBuf>,
    pub library: Option<PathBuf>,
    pub watch: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var_os(name).map(PathBuf::from);
        Self {
            config: var("VOXPIPE_CONFIG"),
            home: var("VOXPIPE_HOME"),
            library: var("VOXPIPE_LIBRARY"),
            watch: var("VOXPIPE_WATCH"),
        }
    }
}

impl Settings {
    /// Load configuration from all sources and validate it
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env = EnvOverrides::from_env();
        let config_path = match explicit.map(Path::to_path_buf).or_else(|| env.config.clone()) {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path)),
            Some(path) => Some(path),
            None => find_config_file(),
        };

        let file = match &config_path {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        debug!(config = ?config_path, "Configuration source");

        let settings = Self::resolve(file, config_path, &env)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolve a parsed file plus overrides into absolute settings
    pub fn resolve(
        file: ConfigFile,
        config_path: Option<PathBuf>,
        env: &EnvOverrides,
    ) -> Result<Self, ConfigError> {
        let user_home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("cannot determine home directory".to_string()))?;
        let base_dir = config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let home = env
            .home
            .clone()
            .or_else(|| file.paths.home.as_deref().map(|p| resolve_path(&base_dir, p)))
            .unwrap_or_else(|| user_home.join(".voxpipe"));

        let library = env
            .library
            .clone()
            .or_else(|| file.paths.library.as_deref().map(|p| resolve_path(&base_dir, p)))
            .unwrap_or_else(|| home.join("library"));

        let root = env
            .watch
            .clone()
            .or_else(|| file.watch.path.as_deref().map(|p| resolve_path(&base_dir, p)))
            .unwrap_or_else(|| home.join("inbox"));

        let watch = WatchSettings {
            root,
            extensions: file
                .watch
                .extensions
                .iter()
                .map(|e| e.trim().to_lowercase())
                .collect(),
            ignore: file.watch.ignore.clone(),
            settle_window: Duration::from_millis(file.watch.settle_window_ms),
            scan_on_startup: file.watch.scan_on_startup,
        };

        Ok(Self {
            config_file: config_path,
            home,
            library,
            watch,
            workers: file.pipeline.workers,
            queue_capacity: file.pipeline.queue_capacity,
            policies: file.pipeline.policies(),
            transcription: file.transcription,
            insights: file.insights,
        })
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.workers == 0 {
            return invalid("pipeline.workers must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity must be at least 1".to_string());
        }

        for step in Step::ALL {
            let policy = self.policies.get(step);
            if policy.max_attempts == 0 {
                return invalid(format!("pipeline.{}.max_attempts must be at least 1", step));
            }
            if policy.timeout_seconds == 0 {
                return invalid(format!("pipeline.{}.timeout_seconds must be at least 1", step));
            }
            if policy.backoff_base_ms > policy.backoff_max_ms {
                return invalid(format!(
                    "pipeline.{}.backoff_base_ms exceeds backoff_max_ms",
                    step
                ));
            }
        }

        if self.watch.extensions.is_empty() {
            return invalid("watch.extensions must not be empty".to_string());
        }
        for ext in &self.watch.extensions {
            if ext.is_empty() || ext.contains('.') {
                return invalid(format!(
                    "watch.extensions entry '{}' must be a bare extension like \"m4a\"",
                    ext
                ));
            }
        }
        for pattern in &self.watch.ignore {
            if let Err(e) = glob::Pattern::new(pattern) {
                return invalid(format!("watch.ignore pattern '{}': {}", pattern, e));
            }
        }

        if self.transcription.provider == TranscriptionProviderKind::Http
            && std::env::var_os(&self.transcription.api_key_env).is_none()
        {
            return invalid(format!(
                "transcription provider 'http' needs ${} to be set",
                self.transcription.api_key_env
            ));
        }
        if self.insights.provider == InsightProviderKind::Http
            && std::env::var_os(&self.insights.api_key_env).is_none()
        {
            return invalid(format!(
                "insights provider 'http' needs ${} to be set",
                self.insights.api_key_env
            ));
        }

        Ok(())
    }

    /// Registry database ($VOXPIPE_HOME/registry.sqlite3)
    pub fn registry_path(&self) -> PathBuf {
        self.home.join("registry.sqlite3")
    }

    /// Stage outputs ($VOXPIPE_HOME/artifacts)
    pub fn artifacts_dir(&self) -> PathBuf {
        self.home.join("artifacts")
    }

    /// Single-instance lock ($VOXPIPE_HOME/voxpipe.lock)
    pub fn lock_path(&self) -> PathBuf {
        self.home.join("voxpipe.lock")
    }
}

/// Find config file by searching current directory and parents, then the
/// user config directory
fn find_config_file() -> Option<PathBuf> {
    if let Ok(mut current) = std::env::current_dir() {
        loop {
            let config_path = current.join(".voxpipe").join("config.yaml");
            if config_path.exists() {
                return Some(config_path);
            }

            if !current.pop() {
                break;
            }
        }
    }

    let user_config = dirs::home_dir()?
        .join(".config")
        .join("voxpipe")
        .join("config.yaml");
    user_config.exists().then_some(user_config)
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
