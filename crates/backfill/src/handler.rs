//! Downstream record callbacks.

use async_trait::async_trait;

use crate::repo::Cid;

/// User callbacks receiving every record mutation exactly once per delivery
/// path. Invoked concurrently from many tasks; implementations must be
/// thread-safe. Errors are logged by the engine and never abort iteration —
/// the downstream owns its retries and idempotence.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle_create_record(
        &self,
        repo: &str,
        rev: &str,
        path: &str,
        rec: &[u8],
        cid: &Cid,
    ) -> anyhow::Result<()>;

    async fn handle_update_record(
        &self,
        repo: &str,
        rev: &str,
        path: &str,
        rec: &[u8],
        cid: &Cid,
    ) -> anyhow::Result<()>;

    async fn handle_delete_record(
        &self,
        repo: &str,
        rev: &str,
        path: &str,
    ) -> anyhow::Result<()>;
}
