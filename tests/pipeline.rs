//! Pipeline Integration Tests
//!
//! Dispatcher settle-window behaviour and the worker pool draining the
//! coalescing queue end to end.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{fast_policies, Behavior, Harness, StubTranscriber};
use tokio::sync::{mpsc, watch};

use voxpipe::core::{PoolReport, WorkerPool};
use voxpipe::domain::{Fingerprint, Stage};
use voxpipe::ingest::{Dispatcher, EnqueueResult, FsEvent, FsEventKind, WorkQueue};

const WINDOW: Duration = Duration::from_millis(200);

fn changed(path: &std::path::Path) -> FsEvent {
    FsEvent::new(path.to_path_buf(), FsEventKind::Changed)
}

#[tokio::test]
async fn test_rapid_writes_produce_one_item_with_final_fingerprint() {
    let harness = Harness::new(fast_policies(3));
    let queue = Arc::new(WorkQueue::new(8));
    let mut dispatcher = Dispatcher::new(Arc::clone(&queue), WINDOW);
    let path = harness.inbox.join("memo.m4a");

    let t0 = Instant::now();
    let mut last = t0;
    for (i, chunk) in ["a", "ab", "abc"].iter().enumerate() {
        std::fs::write(&path, chunk).unwrap();
        last = t0 + Duration::from_millis(20 * i as u64);
        dispatcher.observe(&changed(&path), last);
    }

    dispatcher.flush(last + WINDOW / 2).await;
    assert!(queue.is_empty());

    dispatcher.flush(last + WINDOW).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(dispatcher.report().events, 3);
    assert_eq!(dispatcher.report().queued, 1);
    assert_eq!(dispatcher.pending(), 0);

    let item = queue.dequeue().await.unwrap();
    let expected = Fingerprint::compute(&path).await.unwrap();
    assert_eq!(item.fingerprint, expected);
    assert_eq!(item.fingerprint.size, 3);
}

#[tokio::test]
async fn test_empty_file_waits_for_content() {
    let harness = Harness::new(fast_policies(3));
    let queue = Arc::new(WorkQueue::new(8));
    let mut dispatcher = Dispatcher::new(Arc::clone(&queue), WINDOW);
    let path = harness.inbox.join("memo.m4a");

    std::fs::write(&path, b"").unwrap();
    let t0 = Instant::now();
    dispatcher.observe(&changed(&path), t0);
    dispatcher.flush(t0 + WINDOW).await;
    assert!(queue.is_empty());
    assert_eq!(dispatcher.pending(), 1);

    std::fs::write(&path, b"audio").unwrap();
    let t1 = t0 + WINDOW * 2;
    dispatcher.observe(&changed(&path), t1);
    dispatcher.flush(t1 + WINDOW).await;
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_dispatcher_run_drains_closed_source() {
    let harness = Harness::new(fast_policies(3));
    let queue = Arc::new(WorkQueue::new(8));
    let dispatcher = Dispatcher::new(Arc::clone(&queue), Duration::from_millis(50));

    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    for name in ["one.m4a", "two.m4a"] {
        let path = harness.inbox.join(name);
        std::fs::write(&path, name).unwrap();
        tx.send(FsEvent::new(path, FsEventKind::Scanned)).await.unwrap();
    }
    drop(tx);

    let report = tokio::time::timeout(Duration::from_secs(5), dispatcher.run(rx, shutdown_rx))
        .await
        .unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.queued, 2);
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_dispatcher_run_leaves_empty_files_behind() {
    let harness = Harness::new(fast_policies(3));
    let queue = Arc::new(WorkQueue::new(8));
    let dispatcher = Dispatcher::new(Arc::clone(&queue), Duration::from_millis(50));

    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let empty = harness.inbox.join("empty.m4a");
    let full = harness.inbox.join("full.m4a");
    std::fs::write(&empty, b"").unwrap();
    std::fs::write(&full, b"audio").unwrap();
    tx.send(FsEvent::new(empty, FsEventKind::Scanned)).await.unwrap();
    tx.send(FsEvent::new(full, FsEventKind::Scanned)).await.unwrap();
    drop(tx);

    let report = tokio::time::timeout(Duration::from_secs(3), dispatcher.run(rx, shutdown_rx))
        .await
        .expect("dispatcher returns with only empty files pending");
    assert_eq!(report.events, 2);
    assert_eq!(report.queued, 1);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_dispatcher_stops_when_full_queue_closes() {
    let harness = Harness::new(fast_policies(3));
    // No workers: the second stable file waits for capacity
    let queue = Arc::new(WorkQueue::new(1));
    let dispatcher = Dispatcher::new(Arc::clone(&queue), Duration::from_millis(50));

    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for name in ["one.m4a", "two.m4a", "three.m4a"] {
        let path = harness.inbox.join(name);
        std::fs::write(&path, name).unwrap();
        tx.send(FsEvent::new(path, FsEventKind::Scanned)).await.unwrap();
    }
    let task = tokio::spawn(dispatcher.run(rx, shutdown_rx));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!task.is_finished());

    shutdown_tx.send_replace(true);
    queue.close();
    let report = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("dispatcher stops once the queue closes")
        .unwrap();
    assert_eq!(report.queued, 1);
    assert_eq!(queue.len(), 1);
    drop(tx);
}

struct Running {
    queue: Arc<WorkQueue>,
    pool: Arc<WorkerPool>,
    shutdown: Arc<watch::Sender<bool>>,
    task: tokio::task::JoinHandle<Result<PoolReport, voxpipe::core::PipelineError>>,
}

impl Running {
    fn start(harness: &Harness, workers: usize) -> Self {
        let (tx, rx) = watch::channel(false);
        let shutdown = Arc::new(tx);
        let coordinator = Arc::new(harness.coordinator().with_shutdown(rx));
        let queue = Arc::new(WorkQueue::new(4));
        let pool = Arc::new(WorkerPool::new(
            coordinator,
            Arc::clone(&queue),
            workers,
            Arc::clone(&shutdown),
        ));
        let task = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run().await })
        };
        Self {
            queue,
            pool,
            shutdown,
            task,
        }
    }

    async fn finish(self) -> PoolReport {
        tokio::time::timeout(Duration::from_secs(10), self.queue.wait_idle(Duration::from_millis(10)))
            .await
            .expect("queue drained");
        self.shutdown.send_replace(true);
        self.task.await.unwrap().unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_processes_every_recording() {
    let harness = Harness::new(fast_policies(3));
    let running = Running::start(&harness, 3);

    for i in 0..6 {
        let item = harness.recording(&format!("memo-{}.m4a", i), &format!("take {}", i)).await;
        assert_eq!(running.queue.enqueue(item).await, EnqueueResult::Queued);
    }

    let report = running.finish().await;
    assert_eq!(report.completed, 6);
    assert_eq!(report.failed, 0);
    assert_eq!(harness.documents().len(), 6);
    assert_eq!(harness.registry.summary().unwrap().get(Stage::Completed), 6);
}

#[tokio::test]
async fn test_pool_requeues_transient_failures() {
    let transcriber = StubTranscriber::new(Behavior::TransientTimes(2));
    let harness = Harness::with_transcriber(fast_policies(3), transcriber);
    let running = Running::start(&harness, 1);

    let item = harness.recording("memo.m4a", "hello").await;
    running.queue.enqueue(item.clone()).await;

    let report = running.finish().await;
    assert_eq!(report.requeued, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(harness.transcriber.calls(), 3);
    assert_eq!(
        harness.registry.get(&item.identity).unwrap().stage,
        Stage::Completed
    );
}

#[tokio::test]
async fn test_pool_resumes_unfinished_records() {
    let mut harness = Harness::new(fast_policies(3));
    let unfinished = harness.recording("unfinished.m4a", "hello").await;
    let done = harness.recording("done.m4a", "bye").await;

    // Earlier run: one finished, one abandoned mid-transcription
    harness.coordinator().process(&done).await.unwrap();
    harness.registry.create(&unfinished.recording()).unwrap();
    harness
        .registry
        .advance(&unfinished.identity, Stage::Discovered, Stage::Transcribing, None)
        .unwrap();
    harness.reopen_registry();

    let running = Running::start(&harness, 2);
    assert_eq!(running.pool.resume().await.unwrap(), 1);

    let report = running.finish().await;
    assert_eq!(report.completed, 1);
    assert_eq!(harness.transcriber.calls(), 2);
    assert_eq!(harness.registry.resumable().unwrap().len(), 0);
    assert_eq!(harness.documents().len(), 2);
}

#[tokio::test]
async fn test_failed_records_are_reported_not_fatal() {
    let harness = Harness::with_transcriber(fast_policies(3), StubTranscriber::new(Behavior::Permanent));
    let running = Running::start(&harness, 2);

    for name in ["bad-1.m4a", "bad-2.m4a"] {
        let item = harness.recording(name, name).await;
        running.queue.enqueue(item).await;
    }

    let report = running.finish().await;
    assert_eq!(report.failed, 2);
    assert_eq!(harness.registry.list(Some(Stage::Failed)).unwrap().len(), 2);
}

#[tokio::test]
async fn test_sweep_picks_up_redriven_records() {
    let harness = Harness::with_transcriber(fast_policies(3), StubTranscriber::new(Behavior::Permanent));
    let running = Running::start(&harness, 1);
    let sweep = {
        let pool = Arc::clone(&running.pool);
        tokio::spawn(async move { pool.sweep(Duration::from_millis(50)).await })
    };

    let item = harness.recording("memo.m4a", "hello").await;
    running.queue.enqueue(item.clone()).await;
    tokio::time::timeout(Duration::from_secs(5), running.queue.wait_idle(Duration::from_millis(10)))
        .await
        .unwrap();
    assert_eq!(harness.registry.get(&item.identity).unwrap().stage, Stage::Failed);

    // Re-driven from another process while the pool keeps running
    harness.transcriber.set(Behavior::Succeed);
    harness.registry.redrive(&item.identity).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.registry.get(&item.identity).unwrap().stage != Stage::Completed {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("re-driven record completes");

    let report = running.finish().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 1);
    sweep.await.unwrap().unwrap();
    assert_eq!(harness.documents().len(), 1);
}
