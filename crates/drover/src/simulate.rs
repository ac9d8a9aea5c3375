//! Simulate command: competing workers over one in-memory job store.
//!
//! Every worker runs its own [`AcquisitionLoop`] with its own policy and
//! execution pool. Workers compete for the same jobs, so short lock times
//! and small pools produce the contention the policy reacts to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval, sleep_until};
use tracing::{info, warn};

use drover_scheduler::memory::{InMemoryExecutor, InMemoryJobQueue};
use drover_scheduler::{AcquisitionConfig, AcquisitionLoop, AdaptiveBackoffPolicy, CycleReport};

/// How often the store is checked for remaining jobs between reports.
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Options for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub workers: usize,
    pub jobs: usize,
    pub queues: usize,
    pub pool_size: usize,
    pub lock_time: Duration,
    pub work_time: Duration,
    pub max_cycles: Option<u64>,
    pub timeout: Duration,
    pub json: bool,
}

/// Final state of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker: String,
    pub cycles: u64,
    pub idle_level: u32,
    pub backoff_level: u32,
}

/// Why a simulation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Drained,
    MaxCycles,
    Timeout,
    Interrupted,
}

#[derive(Debug)]
pub struct SimulationResult {
    pub stop_reason: StopReason,
    pub completed: usize,
    pub pending: usize,
    pub workers: Vec<WorkerSummary>,
}

fn queue_names(count: usize) -> Vec<String> {
    (0..count.max(1)).map(|i| format!("queue-{}", i)).collect()
}

/// Total pending jobs across `queues`.
async fn pending(store: &InMemoryJobQueue, queues: &[String]) -> usize {
    let mut total = 0;
    for queue in queues {
        total += store.pending(queue).await;
    }
    total
}

async fn completed(store: &InMemoryJobQueue, queues: &[String]) -> usize {
    let mut total = 0;
    for queue in queues {
        total += store.completed(queue).await;
    }
    total
}

/// Run a simulation, handing every cycle report to `on_report`.
pub async fn simulate(
    config: AcquisitionConfig,
    options: &SimulateOptions,
    mut shutdown_rx: watch::Receiver<bool>,
    mut on_report: impl FnMut(&CycleReport),
) -> Result<SimulationResult> {
    let queues = queue_names(options.queues);
    let store = Arc::new(InMemoryJobQueue::new());
    for (index, queue) in queues.iter().enumerate() {
        let ids = (index..options.jobs)
            .step_by(queues.len())
            .map(|job| format!("{}/job-{}", queue, job));
        store.push(queue, ids).await;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();

    let mut handles = Vec::with_capacity(options.workers);
    for index in 0..options.workers.max(1) {
        let worker_id = format!("worker-{}", index);
        let policy = AdaptiveBackoffPolicy::new(config.clone())
            .map_err(|e| miette::miette!("invalid policy configuration: {}", e))?;
        let worker = AcquisitionLoop::new(
            worker_id.clone(),
            queues.clone(),
            policy,
            Arc::new(store.acquirer(worker_id.clone(), options.lock_time)),
            Arc::new(InMemoryExecutor::new(
                Arc::clone(&store),
                worker_id.clone(),
                options.pool_size,
                options.work_time,
            )),
        )
        .with_reports(report_tx.clone());

        let stop_rx = stop_rx.clone();
        handles.push((worker_id, tokio::spawn(worker.run(stop_rx))));
    }
    drop(report_tx);

    info!(
        workers = handles.len(),
        jobs = options.jobs,
        queues = queues.len(),
        "simulation started"
    );

    let deadline = Instant::now() + options.timeout;
    let mut drain_check = interval(DRAIN_CHECK_INTERVAL);
    let mut cycles: HashMap<String, u64> = HashMap::new();

    let stop_reason = loop {
        tokio::select! {
            report = report_rx.recv() => {
                let Some(report) = report else {
                    warn!("every worker stopped before the simulation ended");
                    break StopReason::Interrupted;
                };
                on_report(&report);
                cycles.insert(report.worker.clone(), report.cycle);

                if let Some(max_cycles) = options.max_cycles
                    && cycles.len() == handles.len()
                    && cycles.values().all(|&cycle| cycle >= max_cycles)
                {
                    break StopReason::MaxCycles;
                }
            }
            _ = drain_check.tick() => {
                if pending(&store, &queues).await == 0 {
                    break StopReason::Drained;
                }
            }
            _ = sleep_until(deadline) => break StopReason::Timeout,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break StopReason::Interrupted;
                }
            }
        }
    };

    let _ = stop_tx.send(true);

    let mut workers = Vec::with_capacity(handles.len());
    for (worker_id, handle) in handles {
        let policy = handle
            .await
            .map_err(|e| miette::miette!("worker {} panicked: {}", worker_id, e))?;
        workers.push(WorkerSummary {
            cycles: cycles.get(&worker_id).copied().unwrap_or(0),
            worker: worker_id,
            idle_level: policy.idle_level(),
            backoff_level: policy.backoff_level(),
        });
    }

    // Reports sent between the stop decision and shutdown.
    while let Ok(report) = report_rx.try_recv() {
        on_report(&report);
        if let Some(worker) = workers.iter_mut().find(|w| w.worker == report.worker) {
            worker.cycles = worker.cycles.max(report.cycle);
        }
    }

    Ok(SimulationResult {
        stop_reason,
        completed: completed(&store, &queues).await,
        pending: pending(&store, &queues).await,
        workers,
    })
}

fn print_report(report: &CycleReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "failed to serialize cycle report"),
        }
        return;
    }

    let batches = report
        .batch_sizes
        .iter()
        .map(|(queue, size)| format!("{}={}", queue, size))
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "{} {} cycle={} acquired={} rejected={} wait={}ms batch=[{}]",
        report.completed_at.format("%H:%M:%S%.3f"),
        report.worker,
        report.cycle,
        report.acquired,
        report.rejected,
        report.wait_ms,
        batches
    );
}

pub async fn run(config: AcquisitionConfig, options: SimulateOptions) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let json = options.json;
    let result = simulate(config, &options, shutdown_rx, |report| {
        print_report(report, json)
    })
    .await?;

    info!(
        reason = ?result.stop_reason,
        completed = result.completed,
        pending = result.pending,
        "simulation finished"
    );
    if !json {
        println!(
            "stopped: {:?}, completed {} jobs, {} pending",
            result.stop_reason, result.completed, result.pending
        );
        for worker in &result.workers {
            println!(
                "  {}: {} cycles, idle level {}, backoff level {}",
                worker.worker, worker.cycles, worker.idle_level, worker.backoff_level
            );
        }
    }
    Ok(())
}
