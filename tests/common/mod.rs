//! Shared fixtures: scripted providers and an isolated pipeline home.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use voxpipe::adapters::{InsightProvider, TranscriptionProvider};
use voxpipe::core::{Coordinator, Registry, RetryPolicy, StagePolicies};
use voxpipe::domain::{Fingerprint, Transcript};
use voxpipe::ingest::WorkItem;
use voxpipe::stages::{StageError, Stages};

/// What a stub provider does on each call
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Transient,
    Permanent,
    /// Transient for the first `n` calls, then succeed
    TransientTimes(usize),
    /// Never returns within any test timeout
    Hang,
}

#[derive(Debug)]
struct Script {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    delay: Duration,
}

impl Script {
    fn new(behavior: Behavior, delay: Duration) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    /// Count the call and decide its result
    async fn next(&self, what: &str) -> Result<(), StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Transient => Err(StageError::transient(format!("{} unavailable", what))),
            Behavior::Permanent => Err(StageError::permanent(format!("{} rejected input", what))),
            Behavior::TransientTimes(n) if call < n => {
                Err(StageError::transient(format!("{} unavailable", what)))
            }
            Behavior::TransientTimes(_) => Ok(()),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

pub struct StubTranscriber {
    script: Script,
}

impl StubTranscriber {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Self::with_delay(behavior, Duration::ZERO)
    }

    pub fn with_delay(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Script::new(behavior, delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn set(&self, behavior: Behavior) {
        *self.script.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl TranscriptionProvider for StubTranscriber {
    fn name(&self) -> &str {
        "stub"
    }

    async fn transcribe(&self, audio: &Path) -> Result<Transcript, StageError> {
        self.script.next("transcriber").await?;
        let content = tokio::fs::read_to_string(audio).await.unwrap_or_default();
        Ok(Transcript {
            text: format!("Transcript of: {}", content),
            language: "en".to_string(),
            duration_seconds: 12.5,
            provider: "stub".to_string(),
        })
    }
}

pub struct StubInsights {
    script: Script,
}

impl StubInsights {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            script: Script::new(behavior, Duration::ZERO),
        })
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn set(&self, behavior: Behavior) {
        *self.script.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl InsightProvider for StubInsights {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(&self, _prompt: &str, transcript: &str) -> Result<String, StageError> {
        self.script.next("insights").await?;
        Ok(serde_json::json!({
            "summary": format!("Summary of {} characters", transcript.len()),
            "topics": ["planning"],
            "action_items": [
                "Send the notes",
                { "description": "Book the room", "owner": "Sam" }
            ]
        })
        .to_string())
    }
}

/// Fast retries, short timeouts
pub fn fast_policies(max_attempts: u32) -> StagePolicies {
    StagePolicies::uniform(RetryPolicy {
        max_attempts,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        timeout_seconds: 5,
    })
}

/// An isolated home: inbox, library, artifacts, registry
pub struct Harness {
    pub temp: TempDir,
    pub inbox: PathBuf,
    pub library: PathBuf,
    pub artifacts: PathBuf,
    pub registry: Registry,
    pub policies: StagePolicies,
    pub transcriber: Arc<StubTranscriber>,
    pub insights: Arc<StubInsights>,
}

impl Harness {
    pub fn new(policies: StagePolicies) -> Self {
        Self::with_transcriber(policies, StubTranscriber::new(Behavior::Succeed))
    }

    pub fn with_transcriber(policies: StagePolicies, transcriber: Arc<StubTranscriber>) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let inbox = root.join("inbox");
        let library = root.join("library");
        let artifacts = root.join("artifacts");
        for dir in [&inbox, &library, &artifacts] {
            std::fs::create_dir_all(dir).unwrap();
        }
        let registry = Registry::open(&root.join("registry.sqlite3"), policies.clone()).unwrap();

        Self {
            temp,
            inbox,
            library,
            artifacts,
            registry,
            policies,
            transcriber,
            insights: StubInsights::new(Behavior::Succeed),
        }
    }

    pub fn stages(&self) -> Stages {
        let transcriber: Arc<dyn TranscriptionProvider> = self.transcriber.clone();
        let insights: Arc<dyn InsightProvider> = self.insights.clone();
        Stages::new(transcriber, insights, None, self.library.clone())
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.registry.clone(), self.stages(), self.artifacts.clone())
    }

    /// Simulate a process restart: same database, new session
    pub fn reopen_registry(&mut self) {
        let path = self.registry.path().to_path_buf();
        self.registry = Registry::open(&path, self.policies.clone()).unwrap();
    }

    /// Write a recording into the inbox and build its work item
    pub async fn recording(&self, name: &str, content: &str) -> WorkItem {
        let path = self.inbox.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        self.item(&path).await
    }

    pub async fn item(&self, path: &Path) -> WorkItem {
        let fingerprint = Fingerprint::compute(path).await.unwrap();
        WorkItem::new(path.to_path_buf(), fingerprint)
    }

    /// Persisted markdown documents in the library
    pub fn documents(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.library)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".md"))
            .collect();
        names.sort();
        names
    }
}
