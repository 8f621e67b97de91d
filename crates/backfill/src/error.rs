use reqwest::StatusCode;

use crate::repo::Cid;

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("job not found")]
    JobNotFound,

    /// Signal, not a failure: the job is already complete, so the caller
    /// applies the ops directly instead of buffering them.
    #[error("job is already complete")]
    JobComplete,

    /// The commit's rev is at or below the job's rev; replayed event.
    #[error("event already processed")]
    AlreadyProcessed,

    /// The commit's `since` does not extend the current chain.
    #[error("event gap: commit does not extend the current rev")]
    EventGap,

    #[error("backfill cancelled")]
    Cancelled,

    #[error("do request: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("upstream returned {status} for {url}")]
    UpstreamStatus { status: StatusCode, url: String },

    #[error("couldn't read repo CAR from response body: {reason}")]
    Decode { reason: String },

    #[error("missing block for {cid}")]
    MissingBlock { cid: Cid },

    #[error("missing record at {path}")]
    MissingRecord { path: String },

    #[error("record handler error: {reason}")]
    Handler { reason: String },

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl BackfillError {
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn missing_block(cid: Cid) -> Self {
        Self::MissingBlock { cid }
    }

    pub fn missing_record(path: impl Into<String>) -> Self {
        Self::MissingRecord { path: path.into() }
    }

    pub fn upstream_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::UpstreamStatus {
            status,
            url: url.into(),
        }
    }

    /// Whether this error is one of the buffering protocol signals rather
    /// than a real failure.
    pub fn is_protocol_signal(&self) -> bool {
        matches!(
            self,
            Self::JobComplete | Self::AlreadyProcessed | Self::EventGap
        )
    }
}
