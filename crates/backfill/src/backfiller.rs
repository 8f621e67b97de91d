//! The backfill engine: construction and the job dispatcher loop.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BackfillConfig;
use crate::error::BackfillError;
use crate::handler::RecordHandler;
use crate::job::{Job, JobState};
use crate::limiter::RateLimiter;
use crate::metrics::BackfillMetrics;
use crate::op::{BufferedOp, OpKind};
use crate::repo::CarDecoder;
use crate::store::Store;

/// Reconciles repo snapshots with the live firehose so the downstream sees
/// every record of every repo.
///
/// One instance owns the dispatcher loop, the shared snapshot rate limiter,
/// and the parent cancellation token fanned out to all imports.
pub struct Backfiller<S, D>
where
    S: Store,
    D: CarDecoder,
{
    pub(crate) config: BackfillConfig,
    pub(crate) store: Arc<S>,
    pub(crate) decoder: Arc<D>,
    pub(crate) handler: Arc<dyn RecordHandler>,
    pub(crate) client: reqwest::Client,
    pub(crate) checkout_url: Url,
    pub(crate) limiter: RateLimiter,
    pub(crate) metrics: Arc<BackfillMetrics>,
    pub(crate) token: CancellationToken,
}

impl<S, D> Backfiller<S, D>
where
    S: Store,
    D: CarDecoder,
{
    pub fn new(
        store: Arc<S>,
        decoder: Arc<D>,
        handler: Arc<dyn RecordHandler>,
        config: BackfillConfig,
    ) -> Result<Self, BackfillError> {
        if config.parallel_backfills == 0 {
            return Err(BackfillError::configuration(
                "parallel_backfills must be at least 1",
            ));
        }
        if config.parallel_record_creates == 0 {
            return Err(BackfillError::configuration(
                "parallel_record_creates must be at least 1",
            ));
        }
        let checkout_url = Url::parse(&config.checkout_path).map_err(|e| {
            BackfillError::configuration(format!(
                "invalid checkout path `{}`: {e}",
                config.checkout_path
            ))
        })?;
        let limiter = RateLimiter::new(config.sync_requests_per_second as f64, 1)?;
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            config,
            store,
            decoder,
            handler,
            client,
            checkout_url,
            limiter,
            metrics: Arc::new(BackfillMetrics::new()),
            token: CancellationToken::new(),
        })
    }

    pub fn metrics(&self) -> Arc<BackfillMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request a graceful stop: the dispatcher starts no new imports and
    /// [`run`](Self::run) returns once in-flight imports drain.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// The backfill processor: pulls Enqueued jobs and fans them out to at
    /// most `parallel_backfills` concurrent snapshot imports.
    pub async fn run(self: Arc<Self>) {
        info!(
            parallel_backfills = self.config.parallel_backfills,
            "backfill processor started"
        );
        let semaphore = Arc::new(Semaphore::new(self.config.parallel_backfills));

        loop {
            if self.token.is_cancelled() {
                break;
            }

            let job = match self.store.get_next_enqueued_job().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if self.idle_wait().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "failed to poll for enqueued job");
                    if self.idle_wait().await {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = job.set_state(JobState::InProgress).await {
                warn!(repo = %job.repo(), error = %e, "failed to mark job in progress; skipping");
                continue;
            }

            let permit = tokio::select! {
                _ = self.token.cancelled() => {
                    // Claimed but never started: hand the job back.
                    if let Err(e) = job.set_state(JobState::Enqueued).await {
                        warn!(repo = %job.repo(), error = %e, "failed to hand back claimed job");
                    } else if let Err(e) = self.store.enqueue_job(job.repo()).await {
                        warn!(repo = %job.repo(), error = %e, "failed to re-enqueue claimed job");
                    }
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                let next_state = this.backfill_repo(&job).await;
                this.metrics.record_job_processed();

                let failed = next_state.is_failed();
                let requeue = next_state == JobState::Enqueued;
                if let Err(e) = job.set_state(next_state).await {
                    warn!(repo = %job.repo(), error = %e, "failed to persist job state");
                }
                if failed {
                    // Buffered ops are stale with respect to the failed attempt.
                    match job.clear_buffered_ops().await {
                        Ok(cleared) => this.metrics.record_ops_cleared(cleared),
                        Err(e) => {
                            warn!(repo = %job.repo(), error = %e, "failed to clear buffered ops")
                        }
                    }
                } else if requeue {
                    // Gapped or cancelled import: hand the job back for a
                    // fresh snapshot. Queued only after the state write so a
                    // racing claim cannot be overwritten.
                    if let Err(e) = this.store.enqueue_job(job.repo()).await {
                        warn!(repo = %job.repo(), error = %e, "failed to re-enqueue job");
                    }
                }
            });
        }

        // Drain: wait for every in-flight import before signalling done.
        debug!("draining in-flight imports");
        let _ = semaphore
            .acquire_many(self.config.parallel_backfills as u32)
            .await;
        info!("backfill processor stopped");
    }

    /// Sleep out one idle poll interval. Returns true when cancelled.
    async fn idle_wait(&self) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => false,
        }
    }

    /// Apply one op directly through the user callbacks; failures are logged
    /// and do not propagate.
    pub(crate) async fn apply_op(&self, repo: &str, rev: &str, op: &BufferedOp) {
        if let Err(e) = dispatch_op(self.handler.as_ref(), repo, rev, op).await {
            warn!(repo, path = %op.path, kind = %op.kind, error = %e, "record callback failed");
        }
    }
}

/// Route one op to the matching user callback.
pub(crate) async fn dispatch_op(
    handler: &dyn RecordHandler,
    repo: &str,
    rev: &str,
    op: &BufferedOp,
) -> anyhow::Result<()> {
    match op.kind {
        OpKind::Delete => handler.handle_delete_record(repo, rev, &op.path).await,
        OpKind::Create | OpKind::Update => match (&op.rec, &op.cid) {
            (Some(rec), Some(cid)) => {
                if op.kind == OpKind::Create {
                    handler.handle_create_record(repo, rev, &op.path, rec, cid).await
                } else {
                    handler.handle_update_record(repo, rev, &op.path, rec, cid).await
                }
            }
            _ => Err(anyhow::anyhow!(
                "{} op for {} carries no record payload",
                op.kind,
                op.path
            )),
        },
    }
}
