//! Per-repo job state machine and the persistence seam behind it.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackfillError;
use crate::op::BufferedOp;

/// Lifecycle state of a backfill job.
///
/// `Complete` is terminal; `Failed` is terminal to the current attempt but
/// operationally re-queueable by an external scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Enqueued,
    InProgress,
    Complete,
    Failed(String),
}

impl JobState {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enqueued => f.write_str("enqueued"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Complete => f.write_str("complete"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

impl FromStr for JobState {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            other => {
                if let Some(reason) = other
                    .strip_prefix("failed (")
                    .and_then(|r| r.strip_suffix(')'))
                {
                    Ok(Self::Failed(reason.to_owned()))
                } else {
                    Err(BackfillError::storage(format!("unknown job state `{other}`")))
                }
            }
        }
    }
}

/// One backfill job per repo DID.
///
/// Accessors are synchronous: implementations keep the current state, rev,
/// and retry count resident in memory even when backed by a durable store.
/// Mutators persist and fail only on storage errors.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn repo(&self) -> &str;
    fn state(&self) -> JobState;
    /// Highest rev whose records have been applied downstream; empty string
    /// before any. Non-decreasing across the job's lifetime.
    fn rev(&self) -> String;
    fn retry_count(&self) -> u32;

    async fn set_state(&self, state: JobState) -> Result<(), BackfillError>;
    async fn set_rev(&self, rev: String) -> Result<(), BackfillError>;
    /// Write path for the external retry scheduler; the engine itself never
    /// increments this.
    async fn increment_retry_count(&self) -> Result<u32, BackfillError>;

    /// Atomically append all ops of one commit to the buffer.
    ///
    /// Returns `Ok(true)` when the group was buffered. Protocol outcomes:
    /// - `rev <= job.rev` → [`BackfillError::AlreadyProcessed`] (stale
    ///   replay, checked before anything else so Complete jobs suppress it
    ///   too);
    /// - job Complete → [`BackfillError::JobComplete`] (caller applies the
    ///   ops directly);
    /// - `since` does not extend the last buffered rev (or `job.rev` when
    ///   the buffer is empty) while a baseline exists →
    ///   [`BackfillError::EventGap`].
    async fn buffer_ops(
        &self,
        since: Option<String>,
        rev: String,
        ops: Vec<BufferedOp>,
    ) -> Result<bool, BackfillError>;

    /// Drain the buffer through `f` in insertion order and clear it.
    ///
    /// Groups at a rev strictly below the job's rev were superseded by the
    /// snapshot and are skipped. A group whose `since` lies above the job's
    /// rev means the snapshot landed before the chain's base; the drain
    /// stops with [`BackfillError::EventGap`] and the buffer is discarded.
    /// The job's rev advances to each applied group's rev. The state
    /// transition to Complete is the flusher's responsibility, not this
    /// method's.
    async fn flush_buffered_ops<F, Fut>(&self, f: F) -> Result<(), BackfillError>
    where
        F: FnMut(String, BufferedOp) -> Fut + Send,
        Fut: Future<Output = ()> + Send;

    /// Discard the buffer without invoking any callbacks. Returns the
    /// number of ops discarded.
    async fn clear_buffered_ops(&self) -> Result<usize, BackfillError>;
}
