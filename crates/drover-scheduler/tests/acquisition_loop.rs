//! Poll loop behaviour with paused time.
//!
//! Covers the loop-level guarantees the policy alone cannot show:
//!
//! - Idle escalation and saturation surface as real waits
//! - Waits are interruptible by wake-ups and shutdown
//! - Rejections reported after reconfiguration land in the next cycle

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use drover_scheduler::memory::{InMemoryExecutor, InMemoryJobQueue};
use drover_scheduler::{
    AcquisitionConfig, AcquisitionLoop, AdaptiveBackoffPolicy, CycleReport,
    DEFAULT_EXECUTION_SATURATION_WAIT, DispatchOutcome, JobAcquirer, JobDispatcher, JobIdBatch,
    RejectionHandle, SchedulerError, SchedulingPolicy,
};

const QUEUE: &str = "payments";

fn config(base_idle_wait_ms: u64) -> AcquisitionConfig {
    AcquisitionConfig {
        base_idle_wait_ms,
        idle_factor: 2.0,
        max_idle_wait_ms: base_idle_wait_ms * 16,
        base_backoff_wait_ms: 50,
        backoff_factor: 2.0,
        max_backoff_wait_ms: 1_000,
        decrease_threshold: 10,
        default_batch_size: 3,
        jitter_enabled: false,
        ..Default::default()
    }
}

type Worker = AcquisitionLoop<AdaptiveBackoffPolicy>;

fn in_memory_worker(
    store: &Arc<InMemoryJobQueue>,
    config: AcquisitionConfig,
    pool_size: usize,
) -> (Worker, mpsc::UnboundedReceiver<CycleReport>) {
    expiring_worker(store, config, pool_size, Duration::from_secs(300))
}

/// Worker whose locks expire after `lock_time`; jobs run for 10s.
fn expiring_worker(
    store: &Arc<InMemoryJobQueue>,
    config: AcquisitionConfig,
    pool_size: usize,
    lock_time: Duration,
) -> (Worker, mpsc::UnboundedReceiver<CycleReport>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = AcquisitionLoop::new(
        "w1",
        vec![QUEUE.to_string()],
        AdaptiveBackoffPolicy::new(config).unwrap(),
        Arc::new(store.acquirer("w1", lock_time)),
        Arc::new(InMemoryExecutor::new(
            Arc::clone(store),
            "w1",
            pool_size,
            Duration::from_secs(10),
        )),
    )
    .with_reports(tx);
    (worker, rx)
}

/// Hands out pre-scripted batches, one script entry per poll.
struct ScriptedAcquirer {
    script: Mutex<VecDeque<Vec<JobIdBatch>>>,
}

impl ScriptedAcquirer {
    fn new(script: Vec<Vec<&str>>) -> Self {
        let script = script
            .into_iter()
            .map(|ids| ids.into_iter().map(JobIdBatch::single).collect())
            .collect();
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl JobAcquirer for ScriptedAcquirer {
    async fn acquire(
        &self,
        _queue: &str,
        _capacity: usize,
    ) -> Result<Vec<JobIdBatch>, SchedulerError> {
        Ok(self.script.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct FailingAcquirer;

#[async_trait]
impl JobAcquirer for FailingAcquirer {
    async fn acquire(
        &self,
        _queue: &str,
        _capacity: usize,
    ) -> Result<Vec<JobIdBatch>, SchedulerError> {
        Err(SchedulerError::Acquisition("connection refused".to_string()))
    }
}

/// Accepts everything and keeps the rejection handles for later reports.
#[derive(Default)]
struct RecordingDispatcher {
    invalidate_immediately: bool,
    handles: Mutex<Vec<RejectionHandle>>,
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        queue: &str,
        batch: JobIdBatch,
        rejections: RejectionHandle,
    ) -> DispatchOutcome {
        if self.invalidate_immediately {
            for id in batch.ids() {
                rejections.invalidate(queue, id.as_str());
            }
        }
        self.handles.lock().unwrap().push(rejections);
        DispatchOutcome::Accepted
    }
}

fn scripted_worker(
    acquirer: impl JobAcquirer + 'static,
    dispatcher: Arc<RecordingDispatcher>,
) -> Worker {
    AcquisitionLoop::new(
        "w1",
        vec![QUEUE.to_string()],
        AdaptiveBackoffPolicy::new(config(1_000)).unwrap(),
        Arc::new(acquirer),
        dispatcher,
    )
}

#[tokio::test(start_paused = true)]
async fn test_idle_waits_grow_through_loop() {
    let store = Arc::new(InMemoryJobQueue::new());
    let (worker, mut reports) = in_memory_worker(&store, config(100), 4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let mut waits = Vec::new();
    for _ in 0..4 {
        let report = reports.recv().await.unwrap();
        assert_eq!(report.acquired, 0);
        waits.push(report.wait_ms);
    }
    assert_eq!(waits, vec![100, 200, 400, 800]);

    shutdown_tx.send(true).unwrap();
    let policy = handle.await.unwrap();
    assert_eq!(policy.idle_level(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_wake_cuts_idle_wait_short() {
    let store = Arc::new(InMemoryJobQueue::new());
    let (worker, mut reports) = in_memory_worker(&store, config(10_000), 4);
    let wake = worker.wake_handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let first = reports.recv().await.unwrap();
    assert_eq!(first.wait(), Duration::from_secs(10));

    let started = Instant::now();
    store.push(QUEUE, ["a", "b", "c"]).await;
    wake.wake();

    let second = reports.recv().await.unwrap();
    assert_eq!(second.cycle, 2);
    assert_eq!(second.acquired, 3);
    assert_eq!(second.wait(), Duration::ZERO);
    assert!(started.elapsed() < Duration::from_secs(10));

    shutdown_tx.send(true).unwrap();
    let policy = handle.await.unwrap();
    // The wake-up itself never reached the policy as a signal.
    assert_eq!(policy.backoff_level(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wake_during_busy_cycle_does_not_skip_idle_wait() {
    let store = Arc::new(InMemoryJobQueue::new());
    store.push(QUEUE, ["a", "b", "c"]).await;
    let (worker, mut reports) = in_memory_worker(&store, config(10_000), 4);
    // Announced work that the first cycle picks up anyway.
    worker.wake_handle().wake();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let busy = reports.recv().await.unwrap();
    assert_eq!(busy.acquired, 3);
    let idle = reports.recv().await.unwrap();
    assert_eq!(idle.acquired, 0);
    assert_eq!(idle.wait(), Duration::from_secs(10));

    let started = Instant::now();
    let next = reports.recv().await.unwrap();
    assert_eq!(next.cycle, 3);
    assert!(started.elapsed() >= Duration::from_secs(10));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_wait() {
    let store = Arc::new(InMemoryJobQueue::new());
    let (worker, mut reports) = in_memory_worker(&store, config(60_000), 4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    reports.recv().await.unwrap();
    let started = Instant::now();
    shutdown_tx.send(true).unwrap();
    let policy = handle.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(policy.idle_level(), 1);
    assert_eq!(policy.wait_time(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_shutdown_sender_stops_loop() {
    let store = Arc::new(InMemoryJobQueue::new());
    let (worker, mut reports) = in_memory_worker(&store, config(60_000), 4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    reports.recv().await.unwrap();
    drop(shutdown_tx);
    let policy = handle.await.unwrap();
    assert_eq!(policy.idle_level(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_pool_throttles_then_saturates() {
    let store = Arc::new(InMemoryJobQueue::new());
    store.push(QUEUE, (0..10).map(|i| format!("job-{i}"))).await;
    let (mut worker, _reports) = in_memory_worker(&store, config(1_000), 1);

    // One slot: the first job runs, the other two bounce off the pool.
    let first = worker.run_cycle().await;
    assert_eq!(first.acquired, 3);
    assert_eq!(first.rejected, 2);
    assert_eq!(first.wait(), Duration::ZERO);
    assert_eq!(first.batch_sizes[QUEUE], 1);

    // Pool still busy: everything locked this time is rejected.
    let second = worker.run_cycle().await;
    assert_eq!(second.acquired, 1);
    assert_eq!(second.rejected, 1);
    assert_eq!(second.wait(), DEFAULT_EXECUTION_SATURATION_WAIT);
    assert_eq!(worker.policy().backoff_level(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_before_reconfigure_counts_in_same_cycle() {
    let dispatcher = Arc::new(RecordingDispatcher {
        invalidate_immediately: true,
        ..Default::default()
    });
    let mut worker = scripted_worker(
        ScriptedAcquirer::new(vec![vec!["a", "b"]]),
        Arc::clone(&dispatcher),
    );

    let report = worker.run_cycle().await;
    assert_eq!(report.acquired, 2);
    assert_eq!(report.rejected, 2);
    assert_eq!(report.wait(), DEFAULT_EXECUTION_SATURATION_WAIT);
}

#[tokio::test(start_paused = true)]
async fn test_late_invalidation_lands_in_next_cycle() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let mut worker = scripted_worker(
        ScriptedAcquirer::new(vec![vec!["a", "b"], vec!["c"]]),
        Arc::clone(&dispatcher),
    );

    let first = worker.run_cycle().await;
    assert_eq!(first.acquired, 2);
    assert_eq!(first.rejected, 0);

    // The commit of "a" fails after the first cycle was already reconfigured.
    let handle = dispatcher.handles.lock().unwrap()[0].clone();
    handle.invalidate(QUEUE, "a");

    let second = worker.run_cycle().await;
    assert_eq!(second.acquired, 1);
    assert_eq!(second.rejected, 1);
    // The late report does not count against the second cycle's own lock.
    assert_eq!(second.wait(), Duration::ZERO);
    assert_eq!(worker.policy().backoff_level(), 0);
    assert_eq!(second.batch_sizes[QUEUE], 3);
}

#[tokio::test(start_paused = true)]
async fn test_lost_lock_reported_by_executor_lands_in_next_cycle() {
    let store = Arc::new(InMemoryJobQueue::new());
    store.push(QUEUE, ["a"]).await;
    let (mut worker, _reports) =
        expiring_worker(&store, config(1_000), 1, Duration::from_secs(2));

    let first = worker.run_cycle().await;
    assert_eq!(first.acquired, 1);
    assert_eq!(first.rejected, 0);

    // The lock expires mid-execution and another worker takes the job over.
    tokio::time::advance(Duration::from_secs(3)).await;
    let rival = store.acquirer("w2", Duration::from_secs(300));
    assert_eq!(
        rival.acquire(QUEUE, 1).await.unwrap(),
        vec![JobIdBatch::single("a")]
    );

    // The executor finishes, fails to commit and reports the lost lock.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(store.completed(QUEUE).await, 0);

    store.push(QUEUE, ["b"]).await;
    let second = worker.run_cycle().await;
    assert_eq!(second.acquired, 1);
    assert_eq!(second.rejected, 1);
    assert_eq!(second.wait(), Duration::ZERO);
    assert_eq!(worker.policy().backoff_level(), 0);
    assert_eq!(second.batch_sizes[QUEUE], 3);
}

#[tokio::test(start_paused = true)]
async fn test_acquisition_failure_escalates_idle() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let mut worker = scripted_worker(FailingAcquirer, dispatcher);

    let first = worker.run_cycle().await;
    assert_eq!(first.acquired, 0);
    assert_eq!(first.wait(), Duration::from_secs(1));

    let second = worker.run_cycle().await;
    assert_eq!(second.wait(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_over_delivery_is_tolerated() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let mut worker = scripted_worker(
        ScriptedAcquirer::new(vec![vec!["a", "b", "c", "d", "e"]]),
        Arc::clone(&dispatcher),
    );

    let report = worker.run_cycle().await;
    assert_eq!(report.acquired, 5);
    assert_eq!(dispatcher.handles.lock().unwrap().len(), 5);
}
