//! Durable per-recording state store backed by SQLite.
//!
//! The registry is the pipeline's only source of truth across restarts.
//! Every mutation is a compare-and-swap on the record's current stage and is
//! committed together with an audit event, so a crash can never leave the
//! record and its trail disagreeing.
//!
//! The advancing lock is the `claimed_by` column: entering an in-progress
//! stage stores this process's session id. Another worker of the same
//! session observes the claim and backs off with `Conflict`; after a
//! restart the new session may take over claims left by the old one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    ArtifactRef, EventType, Fingerprint, ProcessingRecord, Recording, RecordingId, Stage,
    StageCounts, StageEvent, Step,
};

use super::policy::StagePolicies;

/// Errors that can occur with the registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Recording not found: {0}")]
    NotFound(RecordingId),

    #[error("Recording {0} already exists with a different fingerprint")]
    AlreadyExists(RecordingId),

    /// Stage did not match, or the advancing lock is held by a live worker
    #[error("Conflict on {identity}: expected {expected}, found {actual}")]
    Conflict {
        identity: RecordingId,
        expected: Stage,
        actual: Stage,
    },

    #[error("Invalid stage transition: {from} → {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Artifact for {step} already recorded on {identity}")]
    ArtifactExists { identity: RecordingId, step: Step },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt registry row for {identity}: {reason}")]
    Corrupt { identity: String, reason: String },

    #[error("Registry lock poisoned")]
    LockPoisoned,
}

impl RegistryError {
    /// Benign race: another worker already progressed this identity
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// SQLite-backed recording registry
#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    policies: StagePolicies,
    session: Uuid,
    path: PathBuf,
}

impl Registry {
    /// Open (or create) the registry database at `path`
    pub fn open(path: &Path, policies: StagePolicies) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
            policies,
            session: Uuid::new_v4(),
            path: path.to_path_buf(),
        };
        registry.ensure_schema()?;

        info!(path = %path.display(), session = %registry.session, "Registry opened");
        Ok(registry)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS recordings (
              identity TEXT PRIMARY KEY,
              source_path TEXT NOT NULL,
              stage TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              last_error TEXT NULL,
              fingerprint TEXT NOT NULL,
              success_fingerprint TEXT NULL,
              generation INTEGER NOT NULL DEFAULT 0,
              failed_stage TEXT NULL,
              claimed_by TEXT NULL,
              discovered_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS artifacts (
              identity TEXT NOT NULL,
              generation INTEGER NOT NULL,
              step TEXT NOT NULL,
              location TEXT NOT NULL,
              created_at TEXT NOT NULL,
              superseded INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY (identity, generation, step)
            );
            CREATE TABLE IF NOT EXISTS stage_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              identity TEXT NOT NULL,
              generation INTEGER NOT NULL,
              event_type TEXT NOT NULL,
              from_stage TEXT NULL,
              to_stage TEXT NOT NULL,
              detail TEXT NOT NULL,
              error TEXT NULL,
              at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recordings_stage ON recordings(stage);
            CREATE INDEX IF NOT EXISTS idx_stage_events_identity ON stage_events(identity, id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Session id of this process; stored in `claimed_by` while a stage runs
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Retry policies the registry enforces in `record_failure`
    pub fn policies(&self) -> &StagePolicies {
        &self.policies
    }

    /// Run registry work on the blocking pool. Every commit fsyncs, so
    /// async callers go through here instead of calling methods directly.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Registry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| {
                RegistryError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("registry task failed: {}", e),
                ))
            })?
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Get a record, failing with `NotFound`
    pub fn get(&self, identity: &RecordingId) -> Result<ProcessingRecord> {
        self.find(identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))
    }

    /// Get a record if it exists
    pub fn find(&self, identity: &RecordingId) -> Result<Option<ProcessingRecord>> {
        let conn = self.lock()?;
        read_record(&conn, identity)
    }

    /// Find the record for a source path
    pub fn find_by_path(&self, path: &Path) -> Result<Option<ProcessingRecord>> {
        self.find(&RecordingId::from_path(path))
    }

    /// All records, optionally filtered by stage, most recently updated first
    pub fn list(&self, stage: Option<Stage>) -> Result<Vec<ProcessingRecord>> {
        let conn = self.lock()?;
        let ids: Vec<String> = match stage {
            Some(stage) => {
                let mut stmt = conn.prepare(
                    "SELECT identity FROM recordings WHERE stage = ?1 ORDER BY updated_at DESC",
                )?;
                let rows = stmt.query_map(params![stage.as_str()], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT identity FROM recordings ORDER BY updated_at DESC")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = read_record(&conn, &RecordingId::new(id))? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Records that still have work to do (neither completed nor failed)
    pub fn resumable(&self) -> Result<Vec<ProcessingRecord>> {
        Ok(self
            .list(None)?
            .into_iter()
            .filter(|r| !r.stage.is_terminal())
            .collect())
    }

    /// Record counts per stage
    pub fn summary(&self) -> Result<StageCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT stage, COUNT(*) FROM recordings GROUP BY stage")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;

        let mut summary = StageCounts::default();
        for row in rows {
            let (stage, count) = row?;
            let stage = parse_stage(&stage, "summary")?;
            summary.counts.insert(stage, count as usize);
        }
        Ok(summary)
    }

    /// Audit trail for one recording, oldest first
    pub fn events(&self, identity: &RecordingId) -> Result<Vec<StageEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, generation, event_type, from_stage, to_stage, detail, error, at
             FROM stage_events WHERE identity = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![identity.as_str()], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, u32>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, generation, event_type, from, to, detail, error, at) = row?;
            let event_type = EventType::parse(&event_type).ok_or_else(|| RegistryError::Corrupt {
                identity: identity.to_string(),
                reason: format!("unknown event type '{}'", event_type),
            })?;
            events.push(StageEvent {
                id,
                identity: identity.clone(),
                generation,
                event_type,
                from_stage: from.map(|s| parse_stage(&s, identity.as_str())).transpose()?,
                to_stage: parse_stage(&to, identity.as_str())?,
                detail,
                error,
                timestamp: parse_time(&at, identity.as_str())?,
            });
        }
        Ok(events)
    }

    /// Artifacts from earlier fingerprint generations
    pub fn superseded_artifacts(&self, identity: &RecordingId) -> Result<Vec<ArtifactRef>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT step, location, generation, created_at, superseded
             FROM artifacts WHERE identity = ?1 AND superseded = 1
             ORDER BY generation, step",
        )?;
        let rows = stmt.query_map(params![identity.as_str()], artifact_columns)?;

        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(parse_artifact(row?, identity.as_str())?);
        }
        Ok(artifacts)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create the record for a newly discovered recording.
    ///
    /// Idempotent for an unchanged fingerprint (returns the existing record);
    /// fails with `AlreadyExists` when a record with a different fingerprint
    /// exists, which must go through `reset_for_new_fingerprint` instead.
    pub fn create(&self, recording: &Recording) -> Result<ProcessingRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now().to_rfc3339();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO recordings
               (identity, source_path, stage, attempts, fingerprint, generation, discovered_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, 0, ?5, ?6)",
            params![
                recording.id.as_str(),
                recording.path.to_string_lossy(),
                Stage::Discovered.as_str(),
                serde_json::to_string(&recording.fingerprint)?,
                recording.discovered_at.to_rfc3339(),
                now,
            ],
        )?;

        if inserted == 1 {
            append_event(
                &tx,
                &recording.id,
                0,
                EventType::Created,
                None,
                Stage::Discovered,
                &format!("Discovered {} ({})", recording.file_name(), recording.fingerprint),
                None,
            )?;
            debug!(identity = %recording.id, path = %recording.path.display(), "Record created");
        }

        let record = read_record(&tx, &recording.id)?
            .ok_or_else(|| RegistryError::NotFound(recording.id.clone()))?;
        tx.commit()?;

        if !record.matches(&recording.fingerprint) {
            return Err(RegistryError::AlreadyExists(recording.id.clone()));
        }
        Ok(record)
    }

    /// Compare-and-swap the stage one step forward.
    ///
    /// Entering an in-progress stage takes the advancing lock for this
    /// session; entering a settled stage releases it. `artifact` is recorded
    /// write-once for the step owning `expected`.
    pub fn advance(
        &self,
        identity: &RecordingId,
        expected: Stage,
        next: Stage,
        artifact: Option<&Path>,
    ) -> Result<ProcessingRecord> {
        if !expected.can_advance_to(next) {
            return Err(RegistryError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;

        let claimed = if next.is_in_progress() {
            Some(self.session.to_string())
        } else {
            None
        };
        let updated = tx.execute(
            "UPDATE recordings
             SET stage = ?3, attempts = 0, last_error = NULL, failed_stage = NULL,
                 claimed_by = ?4,
                 success_fingerprint = CASE WHEN ?3 = 'completed' THEN fingerprint ELSE success_fingerprint END,
                 updated_at = ?5
             WHERE identity = ?1 AND stage = ?2 AND (claimed_by IS NULL OR claimed_by = ?6)",
            params![
                identity.as_str(),
                expected.as_str(),
                next.as_str(),
                claimed,
                Utc::now().to_rfc3339(),
                self.session.to_string(),
            ],
        )?;

        if updated == 0 {
            return Err(RegistryError::Conflict {
                identity: identity.clone(),
                expected,
                actual: current.stage,
            });
        }

        if let Some(location) = artifact {
            let step = Step::for_running_stage(expected).ok_or(RegistryError::InvalidTransition {
                from: expected,
                to: next,
            })?;
            let inserted = tx.execute(
                "INSERT INTO artifacts (identity, generation, step, location, created_at, superseded)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    identity.as_str(),
                    current.generation,
                    step.as_str(),
                    location.to_string_lossy(),
                    Utc::now().to_rfc3339(),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(RegistryError::ArtifactExists {
                        identity: identity.clone(),
                        step,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        append_event(
            &tx,
            identity,
            current.generation,
            EventType::Advanced,
            Some(expected),
            next,
            &format!("{} → {}", expected, next),
            None,
        )?;

        let record = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;
        tx.commit()?;

        debug!(%identity, from = %expected, to = %next, "Stage advanced");
        Ok(record)
    }

    /// Take over an in-progress stage whose claim is not held by this session
    /// (left behind by a crashed process, or released after a failure).
    pub fn reclaim(&self, identity: &RecordingId, stage: Stage) -> Result<ProcessingRecord> {
        if !stage.is_in_progress() {
            return Err(RegistryError::InvalidTransition {
                from: stage,
                to: stage,
            });
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;

        let session = self.session.to_string();
        let updated = tx.execute(
            "UPDATE recordings SET claimed_by = ?3, updated_at = ?4
             WHERE identity = ?1 AND stage = ?2 AND (claimed_by IS NULL OR claimed_by != ?3)",
            params![identity.as_str(), stage.as_str(), session, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(RegistryError::Conflict {
                identity: identity.clone(),
                expected: stage,
                actual: current.stage,
            });
        }

        let detail = match current.claimed_by {
            Some(previous) => format!("Claim taken over from session {}", previous),
            None => "Claim taken".to_string(),
        };
        append_event(
            &tx,
            identity,
            current.generation,
            EventType::Reclaimed,
            Some(stage),
            stage,
            &detail,
            None,
        )?;

        let record = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;
        tx.commit()?;
        Ok(record)
    }

    /// Drop this session's claim without changing the stage (shutdown)
    pub fn release(&self, identity: &RecordingId, stage: Stage) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;

        let updated = tx.execute(
            "UPDATE recordings SET claimed_by = NULL, updated_at = ?4
             WHERE identity = ?1 AND stage = ?2 AND claimed_by = ?3",
            params![
                identity.as_str(),
                stage.as_str(),
                self.session.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(RegistryError::Conflict {
                identity: identity.clone(),
                expected: stage,
                actual: current.stage,
            });
        }

        append_event(
            &tx,
            identity,
            current.generation,
            EventType::Released,
            Some(stage),
            stage,
            "Claim released",
            None,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Count a failed attempt at an in-progress stage.
    ///
    /// Releases the advancing lock. When the attempt count reaches the
    /// step's budget the record moves to `Failed`.
    pub fn record_failure(
        &self,
        identity: &RecordingId,
        expected: Stage,
        error: &str,
    ) -> Result<ProcessingRecord> {
        let step = Step::for_running_stage(expected).ok_or(RegistryError::InvalidTransition {
            from: expected,
            to: Stage::Failed,
        })?;
        let budget = self.policies.get(step).max_attempts;
        self.apply_failure(identity, expected, error, move |attempts| attempts >= budget)
    }

    /// Move straight to `Failed` regardless of remaining budget
    pub fn fail(&self, identity: &RecordingId, expected: Stage, error: &str) -> Result<ProcessingRecord> {
        self.apply_failure(identity, expected, error, |_| true)
    }

    fn apply_failure(
        &self,
        identity: &RecordingId,
        expected: Stage,
        error: &str,
        exhausted: impl Fn(u32) -> bool,
    ) -> Result<ProcessingRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;

        let held_elsewhere = current
            .claimed_by
            .map(|owner| owner != self.session)
            .unwrap_or(false);
        if current.stage != expected || held_elsewhere {
            return Err(RegistryError::Conflict {
                identity: identity.clone(),
                expected,
                actual: current.stage,
            });
        }

        let attempts = current.attempts + 1;
        let (stage, failed_stage, event_type) = if exhausted(attempts) {
            (Stage::Failed, Some(expected.as_str()), EventType::Failed)
        } else {
            (expected, None, EventType::FailureRecorded)
        };

        tx.execute(
            "UPDATE recordings
             SET stage = ?2, attempts = ?3, last_error = ?4, failed_stage = ?5,
                 claimed_by = NULL, updated_at = ?6
             WHERE identity = ?1",
            params![
                identity.as_str(),
                stage.as_str(),
                attempts,
                error,
                failed_stage,
                Utc::now().to_rfc3339(),
            ],
        )?;

        append_event(
            &tx,
            identity,
            current.generation,
            event_type,
            Some(expected),
            stage,
            &format!("Attempt {} at {} failed", attempts, expected),
            Some(error),
        )?;

        let record = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;
        tx.commit()?;

        if record.is_failed() {
            warn!(%identity, stage = %expected, attempts, error, "Recording failed");
        }
        Ok(record)
    }

    /// Start a new fingerprint generation: back to `Discovered`, attempts
    /// cleared, earlier artifacts kept but marked superseded.
    pub fn reset_for_new_fingerprint(
        &self,
        identity: &RecordingId,
        fingerprint: &Fingerprint,
    ) -> Result<ProcessingRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;

        if current.claimed_by == Some(self.session) {
            return Err(RegistryError::Conflict {
                identity: identity.clone(),
                expected: Stage::Discovered,
                actual: current.stage,
            });
        }

        let generation = current.generation + 1;
        tx.execute(
            "UPDATE recordings
             SET stage = ?2, attempts = 0, last_error = NULL, fingerprint = ?3,
                 generation = ?4, failed_stage = NULL, claimed_by = NULL, updated_at = ?5
             WHERE identity = ?1",
            params![
                identity.as_str(),
                Stage::Discovered.as_str(),
                serde_json::to_string(fingerprint)?,
                generation,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE artifacts SET superseded = 1 WHERE identity = ?1",
            params![identity.as_str()],
        )?;

        append_event(
            &tx,
            identity,
            generation,
            EventType::Reset,
            Some(current.stage),
            Stage::Discovered,
            &format!("Fingerprint {} → {}", current.fingerprint, fingerprint),
            None,
        )?;

        let record = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;
        tx.commit()?;

        info!(%identity, generation, "Recording changed; reset to discovered");
        Ok(record)
    }

    /// Re-drive a failed record from the settled stage before the failure
    pub fn redrive(&self, identity: &RecordingId) -> Result<ProcessingRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;

        let target = current
            .failed_stage
            .and_then(Step::for_running_stage)
            .map(|step| step.from_stage())
            .unwrap_or(Stage::Discovered);

        if !current.is_failed() {
            return Err(RegistryError::InvalidTransition {
                from: current.stage,
                to: target,
            });
        }

        tx.execute(
            "UPDATE recordings
             SET stage = ?2, attempts = 0, failed_stage = NULL, claimed_by = NULL, updated_at = ?3
             WHERE identity = ?1 AND stage = 'failed'",
            params![identity.as_str(), target.as_str(), Utc::now().to_rfc3339()],
        )?;

        append_event(
            &tx,
            identity,
            current.generation,
            EventType::Redriven,
            Some(Stage::Failed),
            target,
            &format!("Re-driven from {}", target),
            current.last_error.as_deref(),
        )?;

        let record = read_record(&tx, identity)?
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;
        tx.commit()?;

        info!(%identity, stage = %target, "Recording re-driven");
        Ok(record)
    }

    /// Remove a record, its artifact references and its trail
    pub fn purge(&self, identity: &RecordingId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM recordings WHERE identity = ?1",
            params![identity.as_str()],
        )?;
        tx.execute("DELETE FROM artifacts WHERE identity = ?1", params![identity.as_str()])?;
        tx.execute("DELETE FROM stage_events WHERE identity = ?1", params![identity.as_str()])?;
        tx.commit()?;

        if removed > 0 {
            info!(%identity, "Record purged");
        }
        Ok(removed > 0)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn append_event(
    tx: &Transaction<'_>,
    identity: &RecordingId,
    generation: u32,
    event_type: EventType,
    from: Option<Stage>,
    to: Stage,
    detail: &str,
    error: Option<&str>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO stage_events (identity, generation, event_type, from_stage, to_stage, detail, error, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            identity.as_str(),
            generation,
            event_type.as_str(),
            from.map(|s| s.as_str()),
            to.as_str(),
            detail,
            error,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

struct RecordRow {
    source_path: String,
    stage: String,
    attempts: u32,
    last_error: Option<String>,
    fingerprint: String,
    success_fingerprint: Option<String>,
    generation: u32,
    failed_stage: Option<String>,
    claimed_by: Option<String>,
    discovered_at: String,
    updated_at: String,
}

type ArtifactRow = (String, String, u32, String, bool);

fn artifact_columns(r: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn read_record(conn: &Connection, identity: &RecordingId) -> Result<Option<ProcessingRecord>> {
    let row = conn
        .query_row(
            "SELECT source_path, stage, attempts, last_error, fingerprint, success_fingerprint,
                    generation, failed_stage, claimed_by, discovered_at, updated_at
             FROM recordings WHERE identity = ?1",
            params![identity.as_str()],
            |r| {
                Ok(RecordRow {
                    source_path: r.get(0)?,
                    stage: r.get(1)?,
                    attempts: r.get(2)?,
                    last_error: r.get(3)?,
                    fingerprint: r.get(4)?,
                    success_fingerprint: r.get(5)?,
                    generation: r.get(6)?,
                    failed_stage: r.get(7)?,
                    claimed_by: r.get(8)?,
                    discovered_at: r.get(9)?,
                    updated_at: r.get(10)?,
                })
            },
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let id = identity.as_str();
    let mut artifacts = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT step, location, generation, created_at, superseded
         FROM artifacts WHERE identity = ?1 AND generation = ?2",
    )?;
    let rows = stmt.query_map(params![id, row.generation], artifact_columns)?;
    for artifact in rows {
        let artifact = parse_artifact(artifact?, id)?;
        artifacts.insert(artifact.step, artifact);
    }

    let claimed_by = row
        .claimed_by
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| corrupt(id, format!("claimed_by: {}", e)))?;

    Ok(Some(ProcessingRecord {
        identity: identity.clone(),
        source_path: PathBuf::from(row.source_path),
        stage: parse_stage(&row.stage, id)?,
        attempts: row.attempts,
        last_error: row.last_error,
        fingerprint: serde_json::from_str(&row.fingerprint)?,
        fingerprint_at_last_success: row
            .success_fingerprint
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        generation: row.generation,
        failed_stage: row.failed_stage.map(|s| parse_stage(&s, id)).transpose()?,
        claimed_by,
        artifacts,
        discovered_at: parse_time(&row.discovered_at, id)?,
        updated_at: parse_time(&row.updated_at, id)?,
    }))
}

fn parse_artifact(row: ArtifactRow, identity: &str) -> Result<ArtifactRef> {
    let (step, location, generation, created_at, superseded) = row;
    let step = Step::ALL
        .into_iter()
        .find(|s| s.as_str() == step)
        .ok_or_else(|| corrupt(identity, format!("unknown step '{}'", step)))?;
    Ok(ArtifactRef {
        step,
        location: PathBuf::from(location),
        generation,
        created_at: parse_time(&created_at, identity)?,
        superseded,
    })
}

fn parse_stage(s: &str, identity: &str) -> Result<Stage> {
    s.parse().map_err(|e: String| corrupt(identity, e))
}

fn parse_time(s: &str, identity: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(identity, format!("timestamp '{}': {}", s, e)))
}

fn corrupt(identity: &str, reason: String) -> RegistryError {
    RegistryError::Corrupt {
        identity: identity.to_string(),
        reason,
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::RetryPolicy;
    use tempfile::TempDir;

    fn fingerprint(hash: &str) -> Fingerprint {
        Fingerprint {
            content_hash: hash.to_string(),
            size: 42,
            modified_ms: 1_700_000_000_000,
        }
    }

    fn recording(name: &str, hash: &str) -> Recording {
        Recording::new(PathBuf::from(format!("/rec/{}", name)), fingerprint(hash), Utc::now())
    }

    fn open(temp: &TempDir, max_attempts: u32) -> Registry {
        let policies = StagePolicies::uniform(RetryPolicy {
            max_attempts,
            ..Default::default()
        });
        Registry::open(&temp.path().join("registry.sqlite3"), policies).unwrap()
    }

    #[test]
    fn test_create_is_idempotent_for_same_fingerprint() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let rec = recording("a.m4a", "aaaa");

        let first = registry.create(&rec).unwrap();
        let second = registry.create(&rec).unwrap();

        assert_eq!(first.identity, second.identity);
        assert_eq!(second.stage, Stage::Discovered);
        assert_eq!(registry.events(&rec.id).unwrap().len(), 1);
    }

    #[test]
    fn test_create_rejects_changed_fingerprint() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);

        registry.create(&recording("a.m4a", "aaaa")).unwrap();
        let result = registry.create(&recording("a.m4a", "bbbb"));

        assert!(matches!(result, Err(RegistryError::AlreadyExists(_))));
    }

    #[test]
    fn test_advance_is_compare_and_swap() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let rec = recording("a.m4a", "aaaa");
        registry.create(&rec).unwrap();

        let claimed = registry
            .advance(&rec.id, Stage::Discovered, Stage::Transcribing, None)
            .unwrap();
        assert_eq!(claimed.claimed_by, Some(registry.session()));

        let again = registry.advance(&rec.id, Stage::Discovered, Stage::Transcribing, None);
        assert!(again.unwrap_err().is_conflict());

        let skip = registry.advance(&rec.id, Stage::Transcribing, Stage::Completed, None);
        assert!(matches!(skip, Err(RegistryError::InvalidTransition { .. })));
    }

    #[test]
    fn test_artifact_recorded_with_advance() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let rec = recording("a.m4a", "aaaa");
        registry.create(&rec).unwrap();
        registry
            .advance(&rec.id, Stage::Discovered, Stage::Transcribing, None)
            .unwrap();

        let record = registry
            .advance(
                &rec.id,
                Stage::Transcribing,
                Stage::Transcribed,
                Some(Path::new("/art/transcript.json")),
            )
            .unwrap();

        assert_eq!(record.stage, Stage::Transcribed);
        assert_eq!(record.claimed_by, None);
        assert_eq!(
            record.artifact(Step::Transcribe).unwrap().location,
            PathBuf::from("/art/transcript.json")
        );
    }

    #[test]
    fn test_failure_budget_moves_to_failed() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 2);
        let rec = recording("a.m4a", "aaaa");
        registry.create(&rec).unwrap();
        registry
            .advance(&rec.id, Stage::Discovered, Stage::Transcribing, None)
            .unwrap();

        let first = registry
            .record_failure(&rec.id, Stage::Transcribing, "timeout")
            .unwrap();
        assert_eq!(first.stage, Stage::Transcribing);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.claimed_by, None);

        let second = registry
            .record_failure(&rec.id, Stage::Transcribing, "timeout again")
            .unwrap();
        assert_eq!(second.stage, Stage::Failed);
        assert_eq!(second.failed_stage, Some(Stage::Transcribing));
        assert_eq!(second.last_error.as_deref(), Some("timeout again"));
    }

    #[test]
    fn test_reclaim_refuses_own_session_claim() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let rec = recording("a.m4a", "aaaa");
        registry.create(&rec).unwrap();
        registry
            .advance(&rec.id, Stage::Discovered, Stage::Transcribing, None)
            .unwrap();

        let result = registry.reclaim(&rec.id, Stage::Transcribing);
        assert!(result.unwrap_err().is_conflict());

        registry.release(&rec.id, Stage::Transcribing).unwrap();
        let record = registry.reclaim(&rec.id, Stage::Transcribing).unwrap();
        assert_eq!(record.claimed_by, Some(registry.session()));
    }

    #[test]
    fn test_reset_supersedes_artifacts() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let rec = recording("a.m4a", "aaaa");
        registry.create(&rec).unwrap();
        registry
            .advance(&rec.id, Stage::Discovered, Stage::Transcribing, None)
            .unwrap();
        registry
            .advance(
                &rec.id,
                Stage::Transcribing,
                Stage::Transcribed,
                Some(Path::new("/art/g0/transcript.json")),
            )
            .unwrap();

        let record = registry
            .reset_for_new_fingerprint(&rec.id, &fingerprint("bbbb"))
            .unwrap();

        assert_eq!(record.stage, Stage::Discovered);
        assert_eq!(record.generation, 1);
        assert!(record.artifacts.is_empty());
        assert_eq!(record.fingerprint.content_hash, "bbbb");

        let old = registry.superseded_artifacts(&rec.id).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].generation, 0);
    }

    #[test]
    fn test_redrive_resumes_before_failed_stage() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let rec = recording("a.m4a", "aaaa");
        registry.create(&rec).unwrap();
        registry
            .advance(&rec.id, Stage::Discovered, Stage::Transcribing, None)
            .unwrap();
        registry
            .advance(&rec.id, Stage::Transcribing, Stage::Transcribed, Some(Path::new("/t")))
            .unwrap();
        registry
            .advance(&rec.id, Stage::Transcribed, Stage::ExtractingInsights, None)
            .unwrap();
        registry
            .fail(&rec.id, Stage::ExtractingInsights, "refused")
            .unwrap();

        let record = registry.redrive(&rec.id).unwrap();
        assert_eq!(record.stage, Stage::Transcribed);
        assert_eq!(record.attempts, 0);
        assert!(record.artifact(Step::Transcribe).is_some());

        let not_failed = registry.redrive(&rec.id);
        assert!(matches!(not_failed, Err(RegistryError::InvalidTransition { .. })));
    }

    #[test]
    fn test_purge_and_summary() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let a = recording("a.m4a", "aaaa");
        let b = recording("b.m4a", "bbbb");
        registry.create(&a).unwrap();
        registry.create(&b).unwrap();

        assert_eq!(registry.summary().unwrap().get(Stage::Discovered), 2);
        assert!(registry.purge(&a.id).unwrap());
        assert!(!registry.purge(&a.id).unwrap());
        assert_eq!(registry.summary().unwrap().total(), 1);
        assert!(registry.events(&a.id).unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_call_keeps_runtime_responsive() {
        let temp = TempDir::new().unwrap();
        let registry = open(&temp, 3);
        let rec = recording("a.m4a", "aaaa");

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };

        // Holds the connection for a while, as a slow fsync would
        let created = registry
            .call(move |r| {
                let guard = r.lock()?;
                std::thread::sleep(Duration::from_millis(200));
                drop(guard);
                r.create(&rec)
            })
            .await
            .unwrap();
        ticker.abort();

        assert_eq!(created.stage, Stage::Discovered);
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 5);
    }
}
