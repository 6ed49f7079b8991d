use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::db::{DistributedLock, IdempotentQueries, QuotaQueries, QuotaUpdater};
use crate::entity::QuotaSpaceExpt;
use crate::error::Error;

struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Single-process stand-in for the Valkey-backed shared state.
/// Expiry is evaluated lazily on access.
#[derive(Default)]
pub struct InMemorySharedState {
    markers: DashMap<String, Instant>,
    locks: DashMap<String, LockEntry>,
    quotas: DashMap<i64, Arc<Mutex<Option<QuotaSpaceExpt>>>>,
}

impl InMemorySharedState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotentQueries for InMemorySharedState {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return Ok(false);
                }
                entry.insert(now + ttl);
            }
            Entry::Vacant(entry) => {
                entry.insert(now + ttl);
            }
        }
        Ok(true)
    }

    async fn exist(&self, key: &str) -> Result<bool, Error> {
        Ok(self
            .markers
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now()))
    }
}

#[async_trait]
impl DistributedLock for InMemorySharedState {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let fresh = LockEntry {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Ok(false);
                }
                entry.insert(fresh);
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
            }
        }
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<bool, Error> {
        let now = Instant::now();
        Ok(self
            .locks
            .remove(key)
            .is_some_and(|(_, entry)| entry.expires_at > now))
    }

    async fn unlock_owned(&self, key: &str, owner: &str) -> Result<bool, Error> {
        let now = Instant::now();
        Ok(self
            .locks
            .remove_if(key, |_, entry| entry.owner == owner)
            .is_some_and(|(_, entry)| entry.expires_at > now))
    }
}

#[async_trait]
impl QuotaQueries for InMemorySharedState {
    async fn update_space_expt_quota(
        &self,
        space_id: i64,
        updater: QuotaUpdater,
    ) -> Result<QuotaSpaceExpt, Error> {
        // Clone the Arc out so the DashMap shard lock is not held across the await.
        let slot = self.quotas.entry(space_id).or_default().clone();
        let mut ledger = slot.lock().await;
        let updated = updater(ledger.clone())?;
        *ledger = Some(updated.clone());
        Ok(updated)
    }

    async fn get_space_expt_quota(&self, space_id: i64) -> Result<Option<QuotaSpaceExpt>, Error> {
        let slot = self.quotas.get(&space_id).map(|slot| slot.clone());
        match slot {
            Some(slot) => Ok(slot.lock().await.clone()),
            None => Ok(None),
        }
    }
}
