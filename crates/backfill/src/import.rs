//! Snapshot import and buffer flushing.
//!
//! Invoked by the dispatcher with a job already marked InProgress. Fetches
//! the repo's CAR snapshot (rate limited, incremental when the job carries a
//! rev), fans record creates out to the user callbacks, then replays the
//! live-event buffer and completes the job.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::StatusCode;
use reqwest::header;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};

use crate::backfiller::{Backfiller, dispatch_op};
use crate::error::BackfillError;
use crate::job::{Job, JobState};
use crate::repo::{BlockSource, CarDecoder, CheckoutRepo};
use crate::store::Store;

impl<S, D> Backfiller<S, D>
where
    S: Store,
    D: CarDecoder,
{
    /// Run one snapshot import for `job` and return the job's next state.
    ///
    /// Failures map to `Failed(reason)` states for the dispatcher to
    /// persist; cancellation hands the job back as Enqueued.
    #[instrument(skip(self, job), fields(repo = %job.repo()))]
    pub(crate) async fn backfill_repo(&self, job: &S::Job) -> JobState {
        let did = job.repo().to_owned();
        info!("processing backfill job");

        let mut url = self.checkout_url.clone();
        url.query_pairs_mut().append_pair("did", &did);
        let since = job.rev();
        if !since.is_empty() {
            url.query_pairs_mut().append_pair("since", &since);
        }

        // All snapshot fetches across all jobs share one token bucket.
        if self.limiter.acquire(&self.token).await.is_err() {
            debug!("cancelled while waiting for the sync rate limiter");
            return JobState::Enqueued;
        }

        let mut request = self
            .client
            .get(url)
            .timeout(self.config.request_timeout)
            .header(header::ACCEPT, "application/vnd.ipld.car")
            .header(header::USER_AGENT, self.config.user_agent());
        if let Some((name, value)) = &self.config.magic_header {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = tokio::select! {
            _ = self.token.cancelled() => {
                debug!("cancelled before snapshot request");
                return JobState::Enqueued;
            }
            response = request.send() => match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "snapshot request failed");
                    return JobState::failed(format!("do request: {e}"));
                }
            },
        };

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            info!("repo not found upstream");
            return JobState::failed("repo not found");
        }
        if !status.is_success() {
            warn!(status = %status, "unexpected upstream status");
            return JobState::failed(status.to_string());
        }

        // Stream the CAR body into the decoder, counting bytes on the way.
        let metrics = Arc::clone(&self.metrics);
        let body = response
            .bytes_stream()
            .inspect_ok(move |chunk| metrics.record_bytes(chunk.len() as u64))
            .map_err(std::io::Error::other);
        let mut reader = StreamReader::new(body);
        let repo = match self
            .decoder
            .read_repo(&mut reader as &mut (dyn tokio::io::AsyncRead + Send + Unpin))
            .await
        {
            Ok(repo) => repo,
            Err(e) => {
                warn!(error = %e, "failed to decode snapshot");
                return JobState::failed("couldn't read repo CAR from response body");
            }
        };

        let snapshot_rev = repo.rev().to_owned();
        debug!(rev = %snapshot_rev, "decoded snapshot");

        if self.dispatch_records(&did, &snapshot_rev, &repo).await.is_err() {
            debug!("cancelled during record dispatch");
            return JobState::Enqueued;
        }

        if let Err(e) = job.set_rev(snapshot_rev).await {
            warn!(error = %e, "failed to persist snapshot rev");
        }

        self.flush_job(job).await
    }

    /// Fan record creates out to the user callbacks: a lazy producer over
    /// the record iterator, `parallel_record_creates` concurrent workers,
    /// and this task draining results. Per-record errors are logged and the
    /// record skipped; only cancellation aborts the dispatch.
    async fn dispatch_records(
        &self,
        did: &str,
        snapshot_rev: &str,
        repo: &D::Repo,
    ) -> Result<(), BackfillError> {
        let prefix = self.config.nsid_filter.clone();
        let mut results = stream::iter(repo.records(&prefix))
            .map(|entry| {
                let handler = Arc::clone(&self.handler);
                async move {
                    let (path, cid) = entry?;
                    let rec = repo.get_block(&cid).await?;
                    handler
                        .handle_create_record(did, snapshot_rev, &path, &rec, &cid)
                        .await
                        .map_err(|e| BackfillError::Handler {
                            reason: e.to_string(),
                        })?;
                    Ok::<_, BackfillError>(path)
                }
            })
            .buffer_unordered(self.config.parallel_record_creates);

        let mut processed = 0u64;
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Err(BackfillError::Cancelled),
                next = results.next() => next,
            };
            match next {
                None => break,
                Some(Ok(path)) => {
                    self.metrics.record_record_processed();
                    processed += 1;
                    tracing::trace!(path = %path, "record dispatched");
                }
                Some(Err(e)) => warn!(error = %e, "skipping record"),
            }
        }
        info!(records = processed, "snapshot records dispatched");
        Ok(())
    }

    /// Drain the job's buffer once through the user callbacks.
    async fn drain_job(&self, job: &S::Job) -> Result<(), BackfillError> {
        let repo = job.repo().to_owned();
        let handler = Arc::clone(&self.handler);
        let metrics = Arc::clone(&self.metrics);

        job.flush_buffered_ops(move |rev, op| {
            let handler = Arc::clone(&handler);
            let metrics = Arc::clone(&metrics);
            let repo = repo.clone();
            async move {
                metrics.record_op_flushed();
                if let Err(e) = dispatch_op(handler.as_ref(), &repo, &rev, &op).await {
                    warn!(repo = %repo, path = %op.path, error = %e, "buffered op failed downstream");
                }
            }
        })
        .await
    }

    /// Drain the job's buffer through the user callbacks, then transition
    /// the job. A gap between the snapshot and the buffered chain sends the
    /// job back to Enqueued for a fresh snapshot.
    pub(crate) async fn flush_job(&self, job: &S::Job) -> JobState {
        match self.drain_job(job).await {
            Ok(()) => {
                if let Err(e) = job.set_state(JobState::Complete).await {
                    warn!(repo = %job.repo(), error = %e, "failed to mark job complete");
                }
                // Commits that raced the drain buffered before the state
                // write landed; sweep them so a Complete buffer stays empty.
                if let Err(e) = self.drain_job(job).await {
                    warn!(repo = %job.repo(), error = %e, "failed to drain straggler ops");
                }
                info!(repo = %job.repo(), rev = %job.rev(), "backfill complete");
                JobState::Complete
            }
            Err(BackfillError::EventGap) => {
                // The dispatcher persists the reset and re-enqueues.
                warn!(repo = %job.repo(), "buffered chain diverged from snapshot; re-enqueueing");
                JobState::Enqueued
            }
            Err(e) => {
                warn!(repo = %job.repo(), error = %e, "failed to flush buffered ops");
                JobState::failed(format!("flush buffered ops: {e}"))
            }
        }
    }
}
