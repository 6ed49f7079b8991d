use std::time::Duration;

use async_trait::async_trait;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::entity::QuotaSpaceExpt;
use crate::error::Error;

/// Computes the new ledger from the current one (`None` when the space has no ledger yet).
/// Returning an error aborts the write.
pub type QuotaUpdater =
    Box<dyn FnOnce(Option<QuotaSpaceExpt>) -> Result<QuotaSpaceExpt, Error> + Send>;

#[async_trait]
pub trait QuotaQueries: Send + Sync {
    /// Runs `updater` against the space's ledger and persists its result.
    /// Implementations guarantee that no two updates of the same space interleave.
    async fn update_space_expt_quota(
        &self,
        space_id: i64,
        updater: QuotaUpdater,
    ) -> Result<QuotaSpaceExpt, Error>;

    async fn get_space_expt_quota(&self, space_id: i64) -> Result<Option<QuotaSpaceExpt>, Error>;
}

#[async_trait]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait IdempotentQueries: Send + Sync {
    /// Sets `key` if it is absent. Returns `false` when another writer set it first.
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    async fn exist(&self, key: &str) -> Result<bool, Error>;
}

#[async_trait]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DistributedLock: Send + Sync {
    /// Takes `key` for `ttl` if free. Returns `false` when it is held.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, Error>;

    /// Releases `key` regardless of owner. Returns whether a lock was held.
    async fn unlock(&self, key: &str) -> Result<bool, Error>;

    /// Releases `key` only if `owner` holds it.
    async fn unlock_owned(&self, key: &str, owner: &str) -> Result<bool, Error>;
}
