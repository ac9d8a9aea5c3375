//! In-memory job store and execution pool.
//!
//! Workers sharing one [`InMemoryJobQueue`] compete for jobs the way workers
//! sharing a database table do: locks expire, and an expired lock can be
//! taken over by another worker, in which case the original owner's commit
//! fails and is reported as an invalidated lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::{
    DispatchOutcome, JobAcquirer, JobDispatcher, JobId, JobIdBatch, QueueName, RejectionHandle,
    SchedulerError,
};

#[derive(Debug, Clone)]
struct JobLock {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct StoredJob {
    id: JobId,
    lock: Option<JobLock>,
    completed: bool,
}

impl StoredJob {
    fn is_available(&self, now: Instant) -> bool {
        !self.completed
            && self
                .lock
                .as_ref()
                .is_none_or(|lock| lock.expires_at <= now)
    }

    fn is_held_by(&self, owner: &str) -> bool {
        self.lock.as_ref().is_some_and(|lock| lock.owner == owner)
    }
}

/// Shared job table, keyed by queue.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<HashMap<QueueName, Vec<StoredJob>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add jobs to the end of `queue`.
    pub async fn push<I, J>(&self, queue: &str, ids: I)
    where
        I: IntoIterator<Item = J>,
        J: Into<JobId>,
    {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.entry(queue.to_string()).or_default();
        stored.extend(ids.into_iter().map(|id| StoredJob {
            id: id.into(),
            lock: None,
            completed: false,
        }));
    }

    /// Jobs in `queue` that have not completed, locked or not.
    pub async fn pending(&self, queue: &str) -> usize {
        self.count(queue, |job| !job.completed).await
    }

    /// Jobs in `queue` that completed.
    pub async fn completed(&self, queue: &str) -> usize {
        self.count(queue, |job| job.completed).await
    }

    async fn count(&self, queue: &str, predicate: impl Fn(&StoredJob) -> bool) -> usize {
        self.jobs
            .lock()
            .await
            .get(queue)
            .map(|jobs| jobs.iter().filter(|job| predicate(job)).count())
            .unwrap_or(0)
    }

    /// Lock up to `capacity` available jobs in `queue` for `owner`.
    pub async fn lock(
        &self,
        queue: &str,
        owner: &str,
        capacity: usize,
        lock_time: Duration,
    ) -> Vec<JobIdBatch> {
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;
        let Some(stored) = jobs.get_mut(queue) else {
            return Vec::new();
        };

        stored
            .iter_mut()
            .filter(|job| job.is_available(now))
            .take(capacity)
            .map(|job| {
                if let Some(previous) = &job.lock {
                    debug!(job_id = %job.id, previous_owner = %previous.owner, owner, "taking over expired lock");
                }
                job.lock = Some(JobLock {
                    owner: owner.to_string(),
                    expires_at: now + lock_time,
                });
                JobIdBatch::single(job.id.clone())
            })
            .collect()
    }

    /// Complete a job, provided `owner` still holds its lock.
    pub async fn commit(&self, queue: &str, job_id: &str, owner: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = find_job(&mut jobs, queue, job_id) else {
            return false;
        };
        if job.completed || !job.is_held_by(owner) {
            return false;
        }
        job.completed = true;
        job.lock = None;
        true
    }

    /// Give up `owner`'s lock on a job without completing it.
    pub async fn release(&self, queue: &str, job_id: &str, owner: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = find_job(&mut jobs, queue, job_id)
            && job.is_held_by(owner)
        {
            job.lock = None;
        }
    }

    /// An acquirer locking jobs in this store on behalf of `worker_id`.
    pub fn acquirer(
        self: &Arc<Self>,
        worker_id: impl Into<String>,
        lock_time: Duration,
    ) -> InMemoryAcquirer {
        InMemoryAcquirer {
            store: Arc::clone(self),
            worker_id: worker_id.into(),
            lock_time,
        }
    }
}

fn find_job<'a>(
    jobs: &'a mut HashMap<QueueName, Vec<StoredJob>>,
    queue: &str,
    job_id: &str,
) -> Option<&'a mut StoredJob> {
    jobs.get_mut(queue)?.iter_mut().find(|job| job.id == job_id)
}

/// [`JobAcquirer`] over an [`InMemoryJobQueue`].
#[derive(Debug, Clone)]
pub struct InMemoryAcquirer {
    store: Arc<InMemoryJobQueue>,
    worker_id: String,
    lock_time: Duration,
}

#[async_trait]
impl JobAcquirer for InMemoryAcquirer {
    async fn acquire(
        &self,
        queue: &str,
        capacity: usize,
    ) -> Result<Vec<JobIdBatch>, SchedulerError> {
        Ok(self
            .store
            .lock(queue, &self.worker_id, capacity, self.lock_time)
            .await)
    }
}

/// Bounded execution pool committing jobs to an [`InMemoryJobQueue`].
///
/// A batch that finds no free slot is rejected and its locks released.
/// Accepted batches run for `work_time`, then commit each job; a job whose
/// lock was taken over in the meantime is reported as invalidated.
#[derive(Debug, Clone)]
pub struct InMemoryExecutor {
    store: Arc<InMemoryJobQueue>,
    worker_id: String,
    slots: Arc<Semaphore>,
    work_time: Duration,
}

impl InMemoryExecutor {
    pub fn new(
        store: Arc<InMemoryJobQueue>,
        worker_id: impl Into<String>,
        pool_size: usize,
        work_time: Duration,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            slots: Arc::new(Semaphore::new(pool_size)),
            work_time,
        }
    }

    /// Free execution slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[async_trait]
impl JobDispatcher for InMemoryExecutor {
    async fn dispatch(
        &self,
        queue: &str,
        batch: JobIdBatch,
        rejections: RejectionHandle,
    ) -> DispatchOutcome {
        let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
            for job_id in batch.ids() {
                self.store.release(queue, job_id, &self.worker_id).await;
            }
            return DispatchOutcome::Rejected;
        };

        let store = Arc::clone(&self.store);
        let worker_id = self.worker_id.clone();
        let queue = queue.to_string();
        let work_time = self.work_time;
        tokio::spawn(async move {
            sleep(work_time).await;
            for job_id in batch.ids() {
                if !store.commit(&queue, job_id, &worker_id).await {
                    debug!(queue = %queue, job_id = %job_id, worker = %worker_id, "commit lost the lock");
                    rejections.invalidate(queue.as_str(), job_id.as_str());
                }
            }
            drop(slot);
        });

        DispatchOutcome::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK_TIME: Duration = Duration::from_secs(10);

    async fn store_with(ids: &[&str]) -> Arc<InMemoryJobQueue> {
        let store = Arc::new(InMemoryJobQueue::new());
        store.push("payments", ids.iter().copied()).await;
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_respects_capacity_and_order() {
        let store = store_with(&["a", "b", "c"]).await;

        let batches = store.lock("payments", "w1", 2, LOCK_TIME).await;
        assert_eq!(batches, vec![JobIdBatch::single("a"), JobIdBatch::single("b")]);

        let batches = store.lock("payments", "w2", 5, LOCK_TIME).await;
        assert_eq!(batches, vec![JobIdBatch::single("c")]);

        assert!(store.lock("payments", "w3", 5, LOCK_TIME).await.is_empty());
        assert!(store.lock("mail", "w3", 5, LOCK_TIME).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_completes_job() {
        let store = store_with(&["a"]).await;
        store.lock("payments", "w1", 1, LOCK_TIME).await;

        assert!(store.commit("payments", "a", "w1").await);
        assert_eq!(store.completed("payments").await, 1);
        assert_eq!(store.pending("payments").await, 0);
        // Completed jobs cannot be committed or locked again.
        assert!(!store.commit("payments", "a", "w1").await);
        assert!(store.lock("payments", "w2", 1, LOCK_TIME).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_taken_over() {
        let store = store_with(&["a"]).await;
        store.lock("payments", "w1", 1, LOCK_TIME).await;

        tokio::time::advance(LOCK_TIME).await;
        let batches = store.lock("payments", "w2", 1, LOCK_TIME).await;
        assert_eq!(batches, vec![JobIdBatch::single("a")]);

        assert!(!store.commit("payments", "a", "w1").await);
        assert!(store.commit("payments", "a", "w2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_only_by_owner() {
        let store = store_with(&["a"]).await;
        store.lock("payments", "w1", 1, LOCK_TIME).await;

        store.release("payments", "a", "w2").await;
        assert!(store.lock("payments", "w2", 1, LOCK_TIME).await.is_empty());

        store.release("payments", "a", "w1").await;
        assert_eq!(store.lock("payments", "w2", 1, LOCK_TIME).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_executor_rejects_and_releases() {
        let store = store_with(&["a", "b"]).await;
        let executor = InMemoryExecutor::new(Arc::clone(&store), "w1", 1, Duration::from_secs(5));
        let (rejections, _reports) = RejectionHandle::channel();

        let batches = store.lock("payments", "w1", 2, LOCK_TIME).await;
        let first = executor
            .dispatch("payments", batches[0].clone(), rejections.clone())
            .await;
        let second = executor
            .dispatch("payments", batches[1].clone(), rejections)
            .await;

        assert_eq!(first, DispatchOutcome::Accepted);
        assert_eq!(second, DispatchOutcome::Rejected);
        assert_eq!(executor.available_slots(), 0);
        // The rejected job is free for another worker right away.
        assert_eq!(
            store.lock("payments", "w2", 2, LOCK_TIME).await,
            vec![JobIdBatch::single("b")]
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.completed("payments").await, 1);
        assert_eq!(executor.available_slots(), 1);
    }
}
