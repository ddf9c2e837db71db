//! Long-running commands.
//!
//! - `voxpipe watch` - scan, then watch and process until Ctrl+C
//! - `voxpipe run` - scan, process until idle, exit

use std::fs::{File, OpenOptions};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::adapters;
use crate::config::Settings;
use crate::core::{Coordinator, PoolReport, Registry, WorkerPool};
use crate::domain::{Stage, Step};
use crate::ingest::{DispatchReport, Dispatcher, FsEvent, WorkQueue, Watcher};
use crate::stages::Stages;

use super::open_registry;

const IDLE_POLL: Duration = Duration::from_millis(100);

/// How often `watch` looks for records re-driven from another process
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a processing run needs, wired together
struct Pipeline {
    registry: Registry,
    queue: Arc<WorkQueue>,
    pool: Arc<WorkerPool>,
    shutdown: Arc<watch::Sender<bool>>,
    /// Held for the lifetime of the run
    _lock: File,
}

impl Pipeline {
    fn assemble(settings: &Settings) -> Result<Self> {
        let lock = acquire_lock(settings)?;
        let registry = open_registry(settings)?;

        for dir in [&settings.library, &settings.watch.root] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let artifacts = settings.artifacts_dir();
        std::fs::create_dir_all(&artifacts)
            .with_context(|| format!("Failed to create {}", artifacts.display()))?;

        let transcription = adapters::transcription_provider(
            &settings.transcription,
            settings.policies.get(Step::Transcribe).timeout(),
        )?;
        let insights = adapters::insight_provider(
            &settings.insights,
            settings.policies.get(Step::ExtractInsights).timeout(),
        )?;
        info!(
            transcription = transcription.name(),
            insights = insights.name(),
            "Providers ready"
        );

        let stages = Stages::new(
            transcription,
            insights,
            settings.insights.prompt.clone(),
            settings.library.clone(),
        );

        let (tx, rx) = watch::channel(false);
        let shutdown = Arc::new(tx);
        let coordinator =
            Arc::new(Coordinator::new(registry.clone(), stages, artifacts).with_shutdown(rx));
        let queue = Arc::new(WorkQueue::new(settings.queue_capacity));
        let pool = Arc::new(WorkerPool::new(
            coordinator,
            Arc::clone(&queue),
            settings.workers,
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            registry,
            queue,
            pool,
            shutdown,
            _lock: lock,
        })
    }

    fn start_pool(&self) -> JoinHandle<Result<PoolReport, crate::core::PipelineError>> {
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move { pool.run().await })
    }

    fn start_dispatcher(&self, settings: &Settings, events: mpsc::Receiver<FsEvent>) -> JoinHandle<DispatchReport> {
        let dispatcher = Dispatcher::new(Arc::clone(&self.queue), settings.watch.settle_window);
        tokio::spawn(dispatcher.run(events, self.shutdown.subscribe()))
    }

    /// Raise shutdown, stop intake and wait for the workers
    async fn stop(&self, pool: JoinHandle<Result<PoolReport, crate::core::PipelineError>>) -> Result<PoolReport> {
        self.shutdown.send_replace(true);
        self.queue.close();
        let report = pool.await.context("Worker pool task failed")??;
        Ok(report)
    }
}

/// One instance per home directory
fn acquire_lock(settings: &Settings) -> Result<File> {
    std::fs::create_dir_all(&settings.home)
        .with_context(|| format!("Failed to create {}", settings.home.display()))?;

    let path = settings.lock_path();
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow!(
            "Another voxpipe instance is already running (lock held on {})",
            path.display()
        )
    })?;
    Ok(file)
}

/// Watch continuously until Ctrl+C
pub async fn execute_watch(settings: &Settings) -> Result<ExitCode> {
    let pipeline = Pipeline::assemble(settings)?;
    let watcher = Watcher::new(&settings.watch)?;

    // Workers first: resuming can fill the queue
    let pool_task = pipeline.start_pool();
    pipeline.pool.resume().await?;

    let sweep_task = {
        let pool = Arc::clone(&pipeline.pool);
        tokio::spawn(async move { pool.sweep(SWEEP_INTERVAL).await })
    };

    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(16));
    let dispatch_task = pipeline.start_dispatcher(settings, rx);

    // Live watching starts before the scan so nothing written meanwhile is missed
    let handle = watcher.watch(tx.clone())?;
    if settings.watch.scan_on_startup {
        watcher.scan(&tx).await?;
    }
    drop(tx);

    println!("🎙  Watching {} (Ctrl+C to stop)", watcher.filter().root().display());
    println!("   Library: {}", settings.library.display());
    println!();

    let mut stop = pipeline.shutdown.subscribe();
    interrupted(&mut stop).await?;

    drop(handle);
    let report = pipeline.stop(pool_task).await?;
    let dispatched = dispatch_task.await.context("Dispatcher task failed")?;
    sweep_task.await.context("Sweep task failed")??;

    print_report(&report, &dispatched);
    Ok(ExitCode::SUCCESS)
}

/// Process everything currently in the watch directory, then exit
pub async fn execute_run(settings: &Settings) -> Result<ExitCode> {
    let pipeline = Pipeline::assemble(settings)?;
    let watcher = Watcher::new(&settings.watch)?;

    // Workers first: resuming can fill the queue
    let pool_task = pipeline.start_pool();
    pipeline.pool.resume().await?;

    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(16));
    let dispatch_task = pipeline.start_dispatcher(settings, rx);
    watcher.scan(&tx).await?;
    drop(tx);

    let mut stop = pipeline.shutdown.subscribe();
    let dispatched = tokio::select! {
        report = drain(dispatch_task, &pipeline.queue) => Some(report?),
        result = interrupted(&mut stop) => {
            result?;
            None
        }
    };

    let report = pipeline.stop(pool_task).await?;
    print_report(&report, &dispatched.unwrap_or_default());

    let failed = pipeline.registry.call(|r| r.summary()).await?.get(Stage::Failed);
    if failed > 0 {
        println!("\n⚠️  {} recording(s) failed; see `voxpipe list --stage failed`", failed);
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

/// Wait for the dispatcher to settle every scanned path and the queue to empty
async fn drain(dispatch_task: JoinHandle<DispatchReport>, queue: &WorkQueue) -> Result<DispatchReport> {
    let report = dispatch_task.await.context("Dispatcher task failed")?;
    queue.wait_idle(IDLE_POLL).await;
    Ok(report)
}

/// Ctrl+C, or shutdown raised elsewhere (a fatal worker error)
async fn interrupted(stop: &mut watch::Receiver<bool>) -> Result<()> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutdown requested");
        }
        _ = raised(stop) => {}
    }
    Ok(())
}

async fn raised(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn print_report(report: &PoolReport, dispatched: &DispatchReport) {
    println!();
    println!("Events:     {} ({} queued, {} coalesced)", dispatched.events, dispatched.queued, dispatched.coalesced);
    println!("Processed:  {}", report.processed);
    println!("  ✅ completed  {}", report.completed);
    println!("  ⏭  skipped    {}", report.skipped);
    println!("  ↻  retried    {}", report.requeued);
    println!("  ❌ failed     {}", report.failed);
    if report.interrupted > 0 {
        println!("  ⏸  interrupted {} (resumes on next start)", report.interrupted);
    }
}
