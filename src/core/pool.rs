//! Fixed-size worker pool.
//!
//! Each worker pulls one item from the queue, runs it through the
//! coordinator to an outcome, and only then pulls the next. Retries go back
//! to the queue with a delay instead of sleeping inside the worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};

use crate::ingest::{EnqueueResult, WorkItem, WorkQueue};

use super::coordinator::{Coordinator, Outcome, PipelineError};

/// Outcome counts for one pool run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub processed: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub requeued: usize,
    pub conflicts: usize,
    pub interrupted: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicUsize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    requeued: AtomicUsize,
    conflicts: AtomicUsize,
    interrupted: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: &Outcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Completed => &self.completed,
            Outcome::Skipped { .. } => &self.skipped,
            Outcome::Failed { .. } => &self.failed,
            Outcome::Requeue { .. } => &self.requeued,
            Outcome::Conflict => &self.conflicts,
            Outcome::Interrupted => &self.interrupted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> PoolReport {
        PoolReport {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Workers sharing one queue and one coordinator
pub struct WorkerPool {
    coordinator: Arc<Coordinator>,
    queue: Arc<WorkQueue>,
    workers: usize,
    shutdown: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// `shutdown` is both observed (stop pulling work) and raised on a
    /// fatal storage error so the rest of the process winds down too.
    pub fn new(
        coordinator: Arc<Coordinator>,
        queue: Arc<WorkQueue>,
        workers: usize,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            coordinator,
            queue,
            workers: workers.max(1),
            shutdown,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Enqueue every unfinished record not already in the queue: work left
    /// by an earlier run, or records re-driven from another process
    pub async fn resume(&self) -> Result<usize, PipelineError> {
        let records = self.coordinator.registry().call(|r| r.resumable()).await?;
        let mut queued = 0;
        for record in &records {
            if self.queue.contains(&record.identity) {
                continue;
            }
            debug!(identity = %record.identity, stage = %record.stage, "Resuming");
            if self.queue.enqueue(WorkItem::from_record(record)).await == EnqueueResult::Queued {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(count = queued, "Resumed unfinished recordings");
        }
        Ok(queued)
    }

    /// Re-run `resume` every `every` until shutdown, so records re-driven
    /// while the pool is running get picked up. A storage error raises
    /// shutdown like a worker's would.
    pub async fn sweep(&self, every: Duration) -> Result<(), PipelineError> {
        let mut stop = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            if *stop.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.resume().await {
                        error!(error = %e, "Sweep failed");
                        self.shutdown.send_replace(true);
                        return Err(e);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Counts so far
    pub fn report(&self) -> PoolReport {
        self.counters.report()
    }

    /// Run workers until shutdown; returns the first fatal error, if any
    pub async fn run(&self) -> Result<PoolReport, PipelineError> {
        let mut tasks = JoinSet::new();
        for n in 0..self.workers {
            let worker = Worker {
                coordinator: Arc::clone(&self.coordinator),
                queue: Arc::clone(&self.queue),
                shutdown: Arc::clone(&self.shutdown),
                counters: Arc::clone(&self.counters),
            };
            tasks.spawn(worker.run().instrument(info_span!("worker", n)));
        }
        info!(workers = self.workers, "Worker pool started");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("worker task failed: {}", e),
                ))),
            };
            if let Err(e) = result {
                error!(error = %e, "Worker stopped on fatal error");
                self.shutdown.send_replace(true);
                first_error.get_or_insert(e);
            }
        }

        let report = self.counters.report();
        info!(
            processed = report.processed,
            completed = report.completed,
            failed = report.failed,
            "Worker pool stopped"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

struct Worker {
    coordinator: Arc<Coordinator>,
    queue: Arc<WorkQueue>,
    shutdown: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self) -> Result<(), PipelineError> {
        let mut stop = self.shutdown.subscribe();
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let item = tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                item = self.queue.dequeue() => match item {
                    Some(item) => item,
                    None => return Ok(()),
                },
            };

            let outcome = match self.coordinator.process(&item).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.queue.complete(&item.identity);
                    return Err(e);
                }
            };
            self.counters.record(&outcome);

            match outcome {
                Outcome::Requeue { delay } => self.queue.retry_later(&item.identity, delay),
                _ => self.queue.complete(&item.identity),
            }
        }
    }
}
