//! Optional cross-node mutation mirror.
//!
//! Deployments that run more than one gateway node can plug a remote
//! key-value store in here. The `KeyStore` calls the mirror fire-and-forget
//! *after* the local mutation commits; mirror failures are logged and never
//! block or roll back a request.

use async_trait::async_trait;

use super::KeyRecord;

/// Replication hook invoked after local credit mutations commit.
#[async_trait]
pub trait KeyMirror: Send + Sync {
    /// Persist the full record after create or any non-credit mutation.
    async fn save_key(&self, record: &KeyRecord) -> anyhow::Result<()>;

    /// Propagate a revocation.
    async fn revoke_key(&self, key_id: &str) -> anyhow::Result<()>;

    /// Propagate a topup as an increment so concurrent nodes converge.
    async fn atomic_topup(&self, key_id: &str, amount: u64) -> anyhow::Result<()>;
}
