//! Live commit handling.
//!
//! Entry point for firehose commits. Ops are buffered against the repo's
//! job while a backfill is pending, or applied straight through once the
//! job is complete. Calls for the same repo must be serialized by the
//! firehose client; the engine does not serialize them.

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::backfiller::Backfiller;
use crate::error::BackfillError;
use crate::job::{Job, JobState};
use crate::op::{BufferedOp, OpKind};
use crate::repo::{BlockSource, CarDecoder, CheckoutRepo, Cid};
use crate::store::Store;

/// One record mutation within a live commit.
#[derive(Debug, Clone)]
pub struct CommitOp {
    pub action: OpKind,
    pub path: String,
    /// Block CID of the record; absent for deletes.
    pub cid: Option<Cid>,
}

/// A live commit from the firehose.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub repo: String,
    /// Rev this commit claims to extend; `None` for a repo's first commit.
    pub since: Option<String>,
    pub rev: String,
    pub ops: Vec<CommitOp>,
    /// CAR-encoded blocks carrying the records touched by this commit.
    pub blocks: Bytes,
}

impl<S, D> Backfiller<S, D>
where
    S: Store,
    D: CarDecoder,
{
    /// Process one live commit.
    ///
    /// Returns Ok for buffered and already-processed commits alike. An event
    /// gap resets the job to Enqueued, re-enqueues it for a fresh snapshot,
    /// and propagates the error to the caller.
    #[instrument(skip(self, evt), fields(repo = %evt.repo, rev = %evt.rev))]
    pub async fn handle_event(&self, evt: CommitEvent) -> Result<(), BackfillError> {
        let ops = self.resolve_event_ops(&evt).await?;
        let op_count = ops.len();

        let buffered = match self
            .store
            .buffer_ops(&evt.repo, evt.since.clone(), evt.rev.clone(), ops.clone())
            .await
        {
            Ok(buffered) => buffered,
            Err(BackfillError::AlreadyProcessed) => {
                debug!("event already processed");
                return Ok(());
            }
            Err(BackfillError::EventGap) => {
                warn!("event gap while buffering; re-enqueueing for a fresh snapshot");
                if let Ok(job) = self.store.get_job(&evt.repo).await {
                    if let Err(e) = job.set_state(JobState::Enqueued).await {
                        warn!(error = %e, "failed to reset job state after gap");
                    }
                }
                if let Err(e) = self.store.enqueue_job(&evt.repo).await {
                    warn!(error = %e, "failed to re-enqueue job after gap");
                }
                return Err(BackfillError::EventGap);
            }
            Err(e) => return Err(e),
        };

        if buffered {
            self.metrics.record_ops_buffered(op_count);
            return Ok(());
        }

        // Job already complete: bypass the buffer and apply directly.
        for op in &ops {
            self.apply_op(&evt.repo, &evt.rev, op).await;
        }
        self.store.update_rev(&evt.repo, &evt.rev).await?;
        Ok(())
    }

    /// Resolve every op's record bytes from the commit's block section.
    /// Any lookup failure fails the whole event.
    async fn resolve_event_ops(
        &self,
        evt: &CommitEvent,
    ) -> Result<Vec<BufferedOp>, BackfillError> {
        let needs_blocks = evt
            .ops
            .iter()
            .any(|op| op.action != OpKind::Delete);
        let blocks = if needs_blocks && self.config.trust_event_cids {
            Some(self.decoder.read_blocks(evt.blocks.clone()).await?)
        } else {
            None
        };

        let mut ops = Vec::with_capacity(evt.ops.len());
        for op in &evt.ops {
            match op.action {
                OpKind::Delete => ops.push(BufferedOp::delete(op.path.clone())),
                kind => {
                    let cid = op.cid.clone().ok_or_else(|| {
                        BackfillError::decode(format!("{kind} op for {} carries no cid", op.path))
                    })?;
                    let rec = match &blocks {
                        Some(blocks) => blocks.get_block(&cid).await?,
                        None => self.record_bytes_from_path(evt, &op.path).await?,
                    };
                    ops.push(BufferedOp {
                        kind,
                        path: op.path.clone(),
                        rec: Some(rec),
                        cid: Some(cid),
                    });
                }
            }
        }
        Ok(ops)
    }

    /// Untrusted path: decode the commit's blocks as a checkout and walk to
    /// the record path instead of trusting the op's CID.
    async fn record_bytes_from_path(
        &self,
        evt: &CommitEvent,
        path: &str,
    ) -> Result<Bytes, BackfillError> {
        let mut reader: &[u8] = &evt.blocks;
        let checkout = self
            .decoder
            .read_repo(&mut reader as &mut (dyn tokio::io::AsyncRead + Send + Unpin))
            .await?;

        let mut found = None;
        for entry in checkout.records("") {
            let (record_path, cid) = entry?;
            if record_path == path {
                found = Some(cid);
                break;
            }
        }
        let cid = found.ok_or_else(|| BackfillError::missing_record(path))?;
        checkout.get_block(&cid).await
    }
}
