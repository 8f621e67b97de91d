//! Persistence seam for jobs and their buffered-op queues.

mod memory;

pub use memory::{MemoryJob, MemoryStore};

use async_trait::async_trait;

use crate::error::BackfillError;
use crate::job::Job;
use crate::op::BufferedOp;

/// Store of backfill jobs, one per repo DID.
///
/// Implementations must serialize mutations to a single job; the engine
/// assumes per-repo linearizability. An in-memory store backs tests; a
/// durable store can sit behind the same trait and persist buffers across
/// restarts.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Job: Job + Clone + Send + Sync + 'static;

    async fn get_job(&self, repo: &str) -> Result<Self::Job, BackfillError>;

    /// Claim any Enqueued job, atomically marking it InProgress. The same
    /// job is never handed to two callers. Selection must avoid starvation.
    async fn get_next_enqueued_job(&self) -> Result<Option<Self::Job>, BackfillError>;

    /// Advance a job's rev directly; shortcut for the Complete-path bypass
    /// in event handling.
    async fn update_rev(&self, repo: &str, rev: &str) -> Result<(), BackfillError>;

    /// Create a job in Enqueued if none exists; re-queues an existing
    /// Enqueued or Failed job and leaves InProgress/Complete jobs untouched.
    async fn enqueue_job(&self, repo: &str) -> Result<(), BackfillError>;

    /// Buffer one commit's ops against the repo's job, creating the job
    /// lazily on first contact. Returns `Ok(false)` when the job is already
    /// complete and the caller should apply the ops directly.
    async fn buffer_ops(
        &self,
        repo: &str,
        since: Option<String>,
        rev: String,
        ops: Vec<BufferedOp>,
    ) -> Result<bool, BackfillError> {
        let job = match self.get_job(repo).await {
            Ok(job) => job,
            Err(BackfillError::JobNotFound) => {
                self.enqueue_job(repo).await?;
                self.get_job(repo).await?
            }
            Err(e) => return Err(e),
        };

        match job.buffer_ops(since, rev, ops).await {
            Ok(buffered) => Ok(buffered),
            Err(BackfillError::JobComplete) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
