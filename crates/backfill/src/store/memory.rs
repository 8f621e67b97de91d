//! In-memory Store implementation.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::BackfillError;
use crate::job::{Job, JobState};
use crate::op::{BufferedOp, OpGroup};
use crate::store::Store;

#[derive(Debug)]
struct JobInner {
    repo: String,
    state: RwLock<JobState>,
    rev: RwLock<String>,
    retry_count: AtomicU32,
    // Serializes buffer mutations and flushes for this job; buffering
    // decisions read the rev under this lock.
    buffer: tokio::sync::Mutex<Vec<OpGroup>>,
}

/// In-memory job. Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct MemoryJob {
    inner: Arc<JobInner>,
}

impl MemoryJob {
    fn new(repo: &str) -> Self {
        Self {
            inner: Arc::new(JobInner {
                repo: repo.to_owned(),
                state: RwLock::new(JobState::Enqueued),
                rev: RwLock::new(String::new()),
                retry_count: AtomicU32::new(0),
                buffer: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Atomically move Enqueued -> InProgress. Returns false if the job was
    /// in any other state.
    fn claim(&self) -> bool {
        let mut state = self.inner.state.write();
        if *state == JobState::Enqueued {
            *state = JobState::InProgress;
            true
        } else {
            false
        }
    }

    fn set_rev_monotonic(&self, rev: &str) {
        // rev is non-decreasing per repo.
        let mut current = self.inner.rev.write();
        if rev > current.as_str() {
            *current = rev.to_owned();
        }
    }
}

#[async_trait]
impl Job for MemoryJob {
    fn repo(&self) -> &str {
        &self.inner.repo
    }

    fn state(&self) -> JobState {
        self.inner.state.read().clone()
    }

    fn rev(&self) -> String {
        self.inner.rev.read().clone()
    }

    fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::Relaxed)
    }

    async fn set_state(&self, state: JobState) -> Result<(), BackfillError> {
        *self.inner.state.write() = state;
        Ok(())
    }

    async fn set_rev(&self, rev: String) -> Result<(), BackfillError> {
        self.set_rev_monotonic(&rev);
        Ok(())
    }

    async fn increment_retry_count(&self) -> Result<u32, BackfillError> {
        Ok(self.inner.retry_count.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn buffer_ops(
        &self,
        since: Option<String>,
        rev: String,
        ops: Vec<BufferedOp>,
    ) -> Result<bool, BackfillError> {
        let mut buffer = self.inner.buffer.lock().await;
        let current_rev = self.rev();

        if rev <= current_rev {
            return Err(BackfillError::AlreadyProcessed);
        }
        if self.state() == JobState::Complete {
            return Err(BackfillError::JobComplete);
        }
        if let Some(since) = &since {
            // The chain extends the last buffered commit, or the applied rev
            // when nothing is buffered. A brand-new job (empty baseline)
            // accepts any commit.
            let baseline = buffer
                .last()
                .map(|group| group.rev.clone())
                .unwrap_or(current_rev);
            if !baseline.is_empty() && *since != baseline {
                return Err(BackfillError::EventGap);
            }
        }

        buffer.push(OpGroup::new(since, rev, ops));
        Ok(true)
    }

    async fn flush_buffered_ops<F, Fut>(&self, mut f: F) -> Result<(), BackfillError>
    where
        F: FnMut(String, BufferedOp) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        // The buffer lock is held for the whole drain: events arriving for
        // this repo wait until the flush decides the job's fate.
        let mut buffer = self.inner.buffer.lock().await;
        let groups = std::mem::take(&mut *buffer);

        for group in groups {
            let current_rev = self.rev();
            if !current_rev.is_empty() {
                if group.rev < current_rev {
                    // Superseded by the snapshot.
                    continue;
                }
                if let Some(since) = &group.since {
                    if *since > current_rev {
                        // The snapshot landed below the chain's base; the
                        // remaining groups are unreplayable.
                        return Err(BackfillError::EventGap);
                    }
                }
            }

            let rev = group.rev.clone();
            for op in group.ops {
                f(rev.clone(), op).await;
            }
            self.set_rev_monotonic(&group.rev);
        }

        Ok(())
    }

    async fn clear_buffered_ops(&self) -> Result<usize, BackfillError> {
        let mut buffer = self.inner.buffer.lock().await;
        let discarded = buffer.iter().map(OpGroup::len).sum();
        buffer.clear();
        Ok(discarded)
    }
}

/// In-memory Store: a job map plus a FIFO claim queue.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: DashMap<String, MemoryJob>,
    queue: Mutex<VecDeque<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_queued(&self, repo: &str) {
        let mut queue = self.queue.lock();
        if !queue.iter().any(|queued| queued == repo) {
            queue.push_back(repo.to_owned());
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Job = MemoryJob;

    async fn get_job(&self, repo: &str) -> Result<MemoryJob, BackfillError> {
        self.jobs
            .get(repo)
            .map(|job| job.clone())
            .ok_or(BackfillError::JobNotFound)
    }

    async fn get_next_enqueued_job(&self) -> Result<Option<MemoryJob>, BackfillError> {
        loop {
            let Some(repo) = self.queue.lock().pop_front() else {
                return Ok(None);
            };
            if let Some(job) = self.jobs.get(&repo).map(|job| job.clone()) {
                if job.claim() {
                    return Ok(Some(job));
                }
            }
        }
    }

    async fn update_rev(&self, repo: &str, rev: &str) -> Result<(), BackfillError> {
        let job = self.get_job(repo).await?;
        job.set_rev(rev.to_owned()).await
    }

    async fn enqueue_job(&self, repo: &str) -> Result<(), BackfillError> {
        let requeue = {
            let job = self
                .jobs
                .entry(repo.to_owned())
                .or_insert_with(|| MemoryJob::new(repo));
            let mut state = job.inner.state.write();
            match *state {
                JobState::Enqueued => true,
                JobState::Failed(_) => {
                    *state = JobState::Enqueued;
                    true
                }
                _ => false,
            }
        };

        if requeue {
            self.push_queued(repo);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    use crate::repo::Cid;

    fn create_op(path: &str) -> BufferedOp {
        BufferedOp::create(path, Bytes::from_static(b"rec"), Cid::new("bafy1"))
    }

    async fn job_with_rev(store: &MemoryStore, repo: &str, rev: &str) -> MemoryJob {
        store.enqueue_job(repo).await.unwrap();
        let job = store.get_job(repo).await.unwrap();
        job.set_rev(rev.to_owned()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();
        store.enqueue_job("did:plc:alice").await.unwrap();

        assert!(store.get_next_enqueued_job().await.unwrap().is_some());
        assert!(store.get_next_enqueued_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_job_is_in_progress_and_not_reclaimed() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();

        let job = store.get_next_enqueued_job().await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::InProgress);
        assert!(store.get_next_enqueued_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_requeues_failed_job() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();
        let job = store.get_next_enqueued_job().await.unwrap().unwrap();
        job.set_state(JobState::failed("repo not found"))
            .await
            .unwrap();

        store.enqueue_job("did:plc:alice").await.unwrap();
        let retried = store.get_next_enqueued_job().await.unwrap().unwrap();
        assert_eq!(retried.repo(), "did:plc:alice");
        assert_eq!(retried.state(), JobState::InProgress);
    }

    #[tokio::test]
    async fn enqueue_leaves_in_progress_job_alone() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();
        let job = store.get_next_enqueued_job().await.unwrap().unwrap();

        store.enqueue_job("did:plc:alice").await.unwrap();
        assert_eq!(job.state(), JobState::InProgress);
        assert!(store.get_next_enqueued_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_queue_is_fifo() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();
        store.enqueue_job("did:plc:bob").await.unwrap();

        let first = store.get_next_enqueued_job().await.unwrap().unwrap();
        let second = store.get_next_enqueued_job().await.unwrap().unwrap();
        assert_eq!(first.repo(), "did:plc:alice");
        assert_eq!(second.repo(), "did:plc:bob");
    }

    #[tokio::test]
    async fn buffer_ops_rejects_stale_rev() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r5").await;

        let result = job
            .buffer_ops(Some("r2".to_owned()), "r3".to_owned(), vec![create_op("a/1")])
            .await;
        assert!(matches!(result, Err(BackfillError::AlreadyProcessed)));
    }

    #[tokio::test]
    async fn stale_rev_is_suppressed_even_when_complete() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r5").await;
        job.set_state(JobState::Complete).await.unwrap();

        let result = job
            .buffer_ops(Some("r2".to_owned()), "r3".to_owned(), vec![create_op("a/1")])
            .await;
        assert!(matches!(result, Err(BackfillError::AlreadyProcessed)));
    }

    #[tokio::test]
    async fn complete_job_rejects_new_ops() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r5").await;
        job.set_state(JobState::Complete).await.unwrap();

        let result = job
            .buffer_ops(Some("r5".to_owned()), "r6".to_owned(), vec![create_op("a/1")])
            .await;
        assert!(matches!(result, Err(BackfillError::JobComplete)));
    }

    #[tokio::test]
    async fn buffer_detects_gap_against_last_buffered_rev() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r1").await;

        let buffered = job
            .buffer_ops(Some("r1".to_owned()), "r2".to_owned(), vec![create_op("a/1")])
            .await
            .unwrap();
        assert!(buffered);

        // Chains onto the buffered r2, not the applied r1.
        let buffered = job
            .buffer_ops(Some("r2".to_owned()), "r3".to_owned(), vec![create_op("a/2")])
            .await
            .unwrap();
        assert!(buffered);

        let result = job
            .buffer_ops(Some("r5".to_owned()), "r6".to_owned(), vec![create_op("a/3")])
            .await;
        assert!(matches!(result, Err(BackfillError::EventGap)));
    }

    #[tokio::test]
    async fn new_job_accepts_any_first_commit() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();
        let job = store.get_job("did:plc:alice").await.unwrap();

        let buffered = job
            .buffer_ops(Some("r7".to_owned()), "r8".to_owned(), vec![create_op("a/1")])
            .await
            .unwrap();
        assert!(buffered);
    }

    #[tokio::test]
    async fn store_buffer_ops_creates_job_lazily() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_job("did:plc:alice").await,
            Err(BackfillError::JobNotFound)
        ));

        let buffered = store
            .buffer_ops(
                "did:plc:alice",
                None,
                "r1".to_owned(),
                vec![create_op("a/1")],
            )
            .await
            .unwrap();
        assert!(buffered);

        let job = store.get_job("did:plc:alice").await.unwrap();
        assert_eq!(job.state(), JobState::Enqueued);
    }

    #[tokio::test]
    async fn store_buffer_ops_signals_complete_as_unbuffered() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r1").await;
        job.set_state(JobState::Complete).await.unwrap();

        let buffered = store
            .buffer_ops(
                "did:plc:alice",
                Some("r1".to_owned()),
                "r2".to_owned(),
                vec![create_op("a/1")],
            )
            .await
            .unwrap();
        assert!(!buffered);
    }

    #[tokio::test]
    async fn flush_replays_in_insertion_order_and_clears() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r1").await;

        job.buffer_ops(
            Some("r1".to_owned()),
            "r2".to_owned(),
            vec![create_op("a/1"), BufferedOp::delete("a/0")],
        )
        .await
        .unwrap();
        job.buffer_ops(Some("r2".to_owned()), "r3".to_owned(), vec![create_op("a/2")])
            .await
            .unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        job.flush_buffered_ops(move |rev, op| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((rev, op.kind, op.path));
            }
        })
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].2, "a/1");
        assert_eq!(seen[1].2, "a/0");
        assert_eq!(seen[2].2, "a/2");
        assert_eq!(seen[2].0, "r3");
        assert_eq!(job.rev(), "r3");

        // Buffer is empty afterwards; another flush sees nothing.
        let count = Arc::new(StdMutex::new(0u32));
        let sink = Arc::clone(&count);
        job.flush_buffered_ops(move |_, _| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() += 1;
            }
        })
        .await
        .unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_skips_groups_superseded_by_snapshot() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r1").await;

        job.buffer_ops(Some("r1".to_owned()), "r2".to_owned(), vec![create_op("a/1")])
            .await
            .unwrap();
        // Snapshot landed at r5, above the buffered chain.
        job.set_rev("r5".to_owned()).await.unwrap();

        let count = Arc::new(StdMutex::new(0u32));
        let sink = Arc::clone(&count);
        job.flush_buffered_ops(move |_, _| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() += 1;
            }
        })
        .await
        .unwrap();

        assert_eq!(*count.lock().unwrap(), 0);
        assert_eq!(job.rev(), "r5");
    }

    #[tokio::test]
    async fn flush_replays_group_at_snapshot_rev() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();
        let job = store.get_job("did:plc:alice").await.unwrap();

        // Live event for an unknown repo, then a snapshot at the same rev.
        job.buffer_ops(None, "r1".to_owned(), vec![create_op("a/1")])
            .await
            .unwrap();
        job.set_rev("r1".to_owned()).await.unwrap();

        let count = Arc::new(StdMutex::new(0u32));
        let sink = Arc::clone(&count);
        job.flush_buffered_ops(move |_, _| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() += 1;
            }
        })
        .await
        .unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_surfaces_gap_when_snapshot_is_too_old() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r1").await;

        job.buffer_ops(Some("r1".to_owned()), "r2".to_owned(), vec![create_op("a/1")])
            .await
            .unwrap();
        job.buffer_ops(Some("r2".to_owned()), "r3".to_owned(), vec![create_op("a/2")])
            .await
            .unwrap();

        // Pretend the chain base moved past the applied rev: rebuild the
        // buffer with a since above r1.
        job.clear_buffered_ops().await.unwrap();
        {
            let mut buffer = job.inner.buffer.lock().await;
            buffer.push(OpGroup::new(
                Some("r4".to_owned()),
                "r5".to_owned(),
                vec![create_op("a/3")],
            ));
        }

        let result = job
            .flush_buffered_ops(|_, _| async {})
            .await;
        assert!(matches!(result, Err(BackfillError::EventGap)));

        // Gap discards the buffer.
        let count = Arc::new(StdMutex::new(0u32));
        let sink = Arc::clone(&count);
        job.flush_buffered_ops(move |_, _| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() += 1;
            }
        })
        .await
        .unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_discards_without_callbacks() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r1").await;
        job.buffer_ops(Some("r1".to_owned()), "r2".to_owned(), vec![create_op("a/1")])
            .await
            .unwrap();

        job.clear_buffered_ops().await.unwrap();

        let count = Arc::new(StdMutex::new(0u32));
        let sink = Arc::clone(&count);
        job.flush_buffered_ops(move |_, _| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() += 1;
            }
        })
        .await
        .unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn rev_is_monotonic() {
        let store = MemoryStore::new();
        let job = job_with_rev(&store, "did:plc:alice", "r5").await;

        job.set_rev("r3".to_owned()).await.unwrap();
        assert_eq!(job.rev(), "r5");

        store.update_rev("did:plc:alice", "r7").await.unwrap();
        assert_eq!(job.rev(), "r7");
    }

    #[tokio::test]
    async fn retry_count_increments() {
        let store = MemoryStore::new();
        store.enqueue_job("did:plc:alice").await.unwrap();
        let job = store.get_job("did:plc:alice").await.unwrap();

        assert_eq!(job.retry_count(), 0);
        assert_eq!(job.increment_retry_count().await.unwrap(), 1);
        assert_eq!(job.retry_count(), 1);
    }
}
