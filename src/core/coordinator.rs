//! Per-recording state machine.
//!
//! Drives one work item through the remaining stages, consulting the
//! registry before and after each executor call:
//!
//! 1. Load or create the record; a changed fingerprint resets it.
//! 2. `Completed` with a matching fingerprint and `Failed` are skipped.
//! 3. Claim the step's in-progress stage (CAS), run the executor under the
//!    step's timeout, then advance, count a failure or fail outright.
//!
//! Per-recording problems end up in the registry; only storage failures
//! escape as `PipelineError`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::domain::Stage;
use crate::ingest::WorkItem;
use crate::stages::{StageContext, StageError, Stages};

use super::registry::{Registry, RegistryError};

/// Unrecoverable pipeline failure
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened to a work item
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Reached `Completed` in this pass
    Completed,
    /// Nothing to do (duplicate event for a completed or failed record)
    Skipped { stage: Stage },
    /// Moved to `Failed`
    Failed { stage: Stage, error: String },
    /// Transient failure under budget; try again after `delay`
    Requeue { delay: Duration },
    /// Another worker holds or already progressed this identity
    Conflict,
    /// Shutdown requested; claim released
    Interrupted,
}

/// Pipeline coordinator
pub struct Coordinator {
    registry: Registry,
    stages: Stages,
    artifacts_root: PathBuf,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Coordinator {
    pub fn new(registry: Registry, stages: Stages, artifacts_root: PathBuf) -> Self {
        Self {
            registry,
            stages,
            artifacts_root,
            shutdown: None,
        }
    }

    /// Abandon running executors when `shutdown` flips to true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Run the transition algorithm for one work item
    #[instrument(skip(self, item), fields(identity = %item.identity))]
    pub async fn process(&self, item: &WorkItem) -> Result<Outcome, PipelineError> {
        let id = &item.identity;

        let recording = item.recording();
        let mut record = self
            .registry
            .call(move |r| match r.find(&recording.id)? {
                Some(record) => Ok(record),
                None => match r.create(&recording) {
                    // Created concurrently from a different fingerprint
                    Err(RegistryError::AlreadyExists(_)) => r.get(&recording.id),
                    created => created,
                },
            })
            .await?;

        if !record.matches(&item.fingerprint) {
            let (key, fingerprint) = (id.clone(), item.fingerprint.clone());
            record = match self
                .registry
                .call(move |r| r.reset_for_new_fingerprint(&key, &fingerprint))
                .await
            {
                Ok(record) => record,
                Err(e) => return benign(e),
            };
        }

        let mut progressed = false;
        loop {
            let Some(step) = record.stage.pending_step() else {
                return Ok(if progressed && record.is_completed() {
                    info!(path = %item.path.display(), "Recording completed");
                    Outcome::Completed
                } else {
                    debug!(stage = %record.stage, "Nothing to do");
                    Outcome::Skipped {
                        stage: record.stage,
                    }
                });
            };

            if self.shutting_down() {
                return Ok(Outcome::Interrupted);
            }

            let running = step.running_stage();
            let (key, current) = (id.clone(), record.stage);
            let claimed = self
                .registry
                .call(move |r| {
                    if current.is_in_progress() {
                        r.reclaim(&key, current)
                    } else {
                        r.advance(&key, current, running, None)
                    }
                })
                .await;
            let claimed = match claimed {
                Ok(record) => record,
                Err(e) => return benign(e),
            };

            let policy = self.registry.policies().get(step);
            let ctx = StageContext::from_record(&claimed, &self.artifacts_root);
            let started = Instant::now();
            debug!(%step, attempt = claimed.attempts + 1, "Stage started");

            let result = tokio::select! {
                result = tokio::time::timeout(policy.timeout(), self.stages.run(step, &ctx)) => {
                    result.unwrap_or_else(|_| {
                        Err(StageError::transient(format!(
                            "{} timed out after {}s",
                            step, policy.timeout_seconds
                        )))
                    })
                }
                _ = wait_for_shutdown(self.shutdown.clone()) => {
                    info!(%step, "Shutdown requested; releasing claim");
                    let key = id.clone();
                    if let Err(e) = self.registry.call(move |r| r.release(&key, running)).await {
                        if !e.is_conflict() {
                            return Err(e.into());
                        }
                    }
                    return Ok(Outcome::Interrupted);
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    let (key, location) = (id.clone(), output.location);
                    let done = step.done_stage();
                    record = match self
                        .registry
                        .call(move |r| r.advance(&key, running, done, Some(location.as_path())))
                        .await
                    {
                        Ok(record) => record,
                        Err(e) => return benign(e),
                    };
                    progressed = true;
                    debug!(%step, duration_ms, "Stage completed");
                }
                Err(StageError::Transient(error)) => {
                    let (key, message) = (id.clone(), error.clone());
                    let updated = match self
                        .registry
                        .call(move |r| r.record_failure(&key, running, &message))
                        .await
                    {
                        Ok(record) => record,
                        Err(e) => return benign(e),
                    };
                    if updated.is_failed() {
                        return Ok(Outcome::Failed {
                            stage: running,
                            error,
                        });
                    }
                    let delay = policy.delay_for_attempt(updated.attempts);
                    warn!(
                        %step,
                        attempt = updated.attempts,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Transient failure; will retry"
                    );
                    return Ok(Outcome::Requeue { delay });
                }
                Err(StageError::Permanent(error)) => {
                    let (key, message) = (id.clone(), error.clone());
                    if let Err(e) = self
                        .registry
                        .call(move |r| r.fail(&key, running, &message))
                        .await
                    {
                        return benign(e);
                    }
                    warn!(%step, %error, "Permanent failure");
                    return Ok(Outcome::Failed {
                        stage: running,
                        error,
                    });
                }
            }
        }
    }
}

/// Races on a record are dropped silently; anything else is fatal
fn benign(e: RegistryError) -> Result<Outcome, PipelineError> {
    match e {
        RegistryError::Conflict { .. } | RegistryError::NotFound(_) => {
            debug!(error = %e, "Lost race; dropping item");
            Ok(Outcome::Conflict)
        }
        other => Err(other.into()),
    }
}

async fn wait_for_shutdown(shutdown: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can ask us to stop any more
            return std::future::pending().await;
        }
    }
}
