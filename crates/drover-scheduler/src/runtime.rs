//! Poll loop driving a scheduling policy.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    AcquisitionCycle, AcquisitionOutcome, JobId, JobIdBatch, QueueName, SchedulerError,
    SchedulingPolicy,
};

/// Locks jobs in the shared job store.
#[async_trait]
pub trait JobAcquirer: Send + Sync {
    /// Lock up to `capacity` batches of due jobs for `queue`.
    async fn acquire(&self, queue: &str, capacity: usize)
    -> Result<Vec<JobIdBatch>, SchedulerError>;
}

/// Whether the execution side took a locked batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    /// The execution pool had no room; counts as a rejection for this cycle.
    Rejected,
}

/// Hands locked batches to the execution side.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Start executing `batch`. Locks found stale later on are reported
    /// through `rejections`.
    async fn dispatch(
        &self,
        queue: &str,
        batch: JobIdBatch,
        rejections: RejectionHandle,
    ) -> DispatchOutcome;
}

#[derive(Debug)]
pub(crate) enum RejectionReport {
    Batch { queue: QueueName, batch: JobIdBatch },
    Job { queue: QueueName, job_id: JobId },
}

/// Reports invalidated locks from the execution side back to the poll loop.
///
/// Reports that reach the loop before it reconfigures the policy count toward
/// the current cycle; later ones count toward the next.
#[derive(Debug, Clone)]
pub struct RejectionHandle {
    tx: mpsc::UnboundedSender<RejectionReport>,
}

impl RejectionHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<RejectionReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a whole batch as rejected.
    pub fn reject(&self, queue: impl Into<QueueName>, batch: JobIdBatch) {
        self.send(RejectionReport::Batch {
            queue: queue.into(),
            batch,
        });
    }

    /// Report that the lock on `job_id` was not actually held.
    pub fn invalidate(&self, queue: impl Into<QueueName>, job_id: impl Into<JobId>) {
        self.send(RejectionReport::Job {
            queue: queue.into(),
            job_id: job_id.into(),
        });
    }

    fn send(&self, report: RejectionReport) {
        if self.tx.send(report).is_err() {
            debug!("acquisition loop stopped, dropping rejection report");
        }
    }
}

/// Cuts the poll loop's current wait short, e.g. when new jobs were created.
#[derive(Debug, Clone, Default)]
pub struct WakeHandle {
    notify: Arc<Notify>,
}

impl WakeHandle {
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Summary of one finished cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub worker: String,
    /// Cycle number, starting at 1.
    pub cycle: u64,
    pub acquired: usize,
    pub rejected: usize,
    /// Wait chosen by the policy, in milliseconds.
    pub wait_ms: u64,
    /// Batch size each queue will request next.
    pub batch_sizes: BTreeMap<QueueName, usize>,
    pub completed_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// One worker's scheduling loop: poll, dispatch, reconfigure, wait.
pub struct AcquisitionLoop<P> {
    worker_id: String,
    queues: Vec<QueueName>,
    policy: P,
    acquirer: Arc<dyn JobAcquirer>,
    dispatcher: Arc<dyn JobDispatcher>,
    cycle: AcquisitionCycle,
    cycles_run: u64,
    rejections: RejectionHandle,
    rejection_rx: mpsc::UnboundedReceiver<RejectionReport>,
    wake: WakeHandle,
    reports: Option<mpsc::UnboundedSender<CycleReport>>,
}

impl<P> fmt::Debug for AcquisitionLoop<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionLoop")
            .field("worker_id", &self.worker_id)
            .field("queues", &self.queues)
            .field("cycles_run", &self.cycles_run)
            .finish()
    }
}

impl<P: SchedulingPolicy> AcquisitionLoop<P> {
    /// Create a loop polling `queues` in the given order.
    pub fn new(
        worker_id: impl Into<String>,
        queues: Vec<QueueName>,
        policy: P,
        acquirer: Arc<dyn JobAcquirer>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        let (rejections, rejection_rx) = RejectionHandle::channel();
        Self {
            worker_id: worker_id.into(),
            queues,
            policy,
            acquirer,
            dispatcher,
            cycle: AcquisitionCycle::new(),
            cycles_run: 0,
            rejections,
            rejection_rx,
            wake: WakeHandle::default(),
            reports: None,
        }
    }

    /// Send a [`CycleReport`] for every finished cycle to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<CycleReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn rejection_handle(&self) -> RejectionHandle {
        self.rejections.clone()
    }

    pub fn wake_handle(&self) -> WakeHandle {
        self.wake.clone()
    }

    /// Run a single acquisition cycle and reconfigure the policy.
    #[tracing::instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle.reset();

        for queue in self.queues.clone() {
            let capacity = self.policy.batch_size(&queue);
            let outcome = acquire_outcome(self.acquirer.as_ref(), &queue, capacity).await;
            for batch in outcome.batches() {
                let dispatched = self
                    .dispatcher
                    .dispatch(&queue, batch.clone(), self.rejection_handle())
                    .await;
                if dispatched == DispatchOutcome::Rejected {
                    self.cycle.submit_rejection(queue.as_str(), batch.clone());
                }
            }
            self.cycle.submit_outcome(queue, outcome);
        }

        self.drain_rejections();
        self.policy.reconfigure(&self.cycle);
        self.cycles_run += 1;

        let report = CycleReport {
            worker: self.worker_id.clone(),
            cycle: self.cycles_run,
            acquired: self.cycle.total_acquired(),
            rejected: self.cycle.total_rejected(),
            wait_ms: self.policy.wait_time().as_millis() as u64,
            batch_sizes: self
                .queues
                .iter()
                .map(|queue| (queue.clone(), self.policy.batch_size(queue)))
                .collect(),
            completed_at: Utc::now(),
        };
        debug!(
            cycle = report.cycle,
            acquired = report.acquired,
            rejected = report.rejected,
            wait_ms = report.wait_ms,
            "acquisition cycle complete"
        );

        if let Some(reports) = &self.reports
            && reports.send(report.clone()).is_err()
        {
            debug!("report receiver dropped");
            self.reports = None;
        }

        report
    }

    /// Run cycles until `shutdown_rx` turns true, then hand back the policy.
    ///
    /// Waits end early on shutdown or on [`WakeHandle::wake`]; neither is
    /// reported to the policy.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> P {
        info!(worker = %self.worker_id, queues = ?self.queues, "acquisition loop starting");

        loop {
            if *shutdown_rx.borrow() {
                info!(worker = %self.worker_id, "acquisition loop shutting down");
                break;
            }

            let report = self.run_cycle().await;
            if report.acquired > 0 {
                self.discard_pending_wake().await;
            }
            let wait = report.wait();
            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!(worker = %self.worker_id, "shutdown sender dropped, stopping");
                        break;
                    }
                }
                _ = self.wake.notify.notified() => {
                    debug!(worker = %self.worker_id, "wait interrupted by wake-up");
                }
                _ = sleep(wait) => {}
            }
        }

        info!(
            worker = %self.worker_id,
            cycles = self.cycles_run,
            "acquisition loop shut down gracefully"
        );
        self.policy
    }

    /// Drop a wake-up stored while the loop was busy polling.
    ///
    /// A cycle that acquired work has already seen whatever the wake-up
    /// announced; a stored permit would otherwise cut the next idle wait short.
    async fn discard_pending_wake(&self) {
        tokio::select! {
            biased;
            _ = self.wake.notify.notified() => {
                debug!(worker = %self.worker_id, "discarding wake-up consumed by busy cycle");
            }
            _ = std::future::ready(()) => {}
        }
    }

    fn drain_rejections(&mut self) {
        while let Ok(report) = self.rejection_rx.try_recv() {
            match report {
                RejectionReport::Batch { queue, batch } => {
                    self.cycle.submit_rejection(queue, batch);
                }
                RejectionReport::Job { queue, job_id } => {
                    if !self.cycle.invalidate(&queue, &job_id) {
                        debug!(queue = %queue, job_id = %job_id, "invalidation for a lock from an earlier cycle");
                        self.cycle.submit_rejection(queue, JobIdBatch::single(job_id));
                    }
                }
            }
        }
    }
}

/// Lock jobs for `queue` and turn the result into an outcome.
///
/// Failures become an empty outcome so a broken store escalates the idle wait.
async fn acquire_outcome(
    acquirer: &dyn JobAcquirer,
    queue: &str,
    capacity: usize,
) -> AcquisitionOutcome {
    let batches = match acquirer.acquire(queue, capacity).await {
        Ok(batches) => batches,
        Err(error) => {
            warn!(queue, error = %error, "job acquisition failed");
            Vec::new()
        }
    };

    let requested = if batches.len() > capacity {
        warn!(
            queue,
            capacity,
            acquired = batches.len(),
            "acquirer locked more batches than requested"
        );
        batches.len()
    } else {
        capacity
    };

    AcquisitionOutcome::new(requested, batches).unwrap_or_default()
}
