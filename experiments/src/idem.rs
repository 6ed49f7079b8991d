//! Short-lived "already done" markers guarding repeated actions.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use experiment_core::db::IdempotentQueries;
use experiment_core::error::{Error, ErrorDetails};

pub const CREATE_EVALUATOR_TTL: Duration = Duration::from_secs(10);
pub const SUBMIT_EVALUATOR_TTL: Duration = Duration::from_secs(10);
pub const COMPLETE_RUN_TTL: Duration = Duration::from_secs(3 * 60);
pub const COMPLETE_EXPT_TTL: Duration = Duration::from_secs(3 * 60);
pub const FINISH_EXPT_TTL: Duration = Duration::from_secs(60);
pub const EXPT_START_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn create_evaluator_key(cid: impl Display) -> String {
    format!("create_evaluator_idem:{cid}")
}

pub fn submit_evaluator_key(cid: impl Display) -> String {
    format!("submit_evaluator_idem:{cid}")
}

pub fn complete_run_key(expt_run_id: i64) -> String {
    format!("CompleteRun:{expt_run_id}")
}

pub fn complete_expt_key(expt_run_id: i64) -> String {
    format!("CompleteExpt:{expt_run_id}")
}

pub fn finish_expt_key(expt_id: i64) -> String {
    format!("FinishExpt:{expt_id}")
}

pub fn expt_start_key(expt_id: i64, expt_run_id: i64) -> String {
    format!("ExptStart:{expt_id}:{expt_run_id}")
}

pub struct IdempotentService {
    store: Arc<dyn IdempotentQueries>,
}

impl IdempotentService {
    pub fn new(store: Arc<dyn IdempotentQueries>) -> Self {
        Self { store }
    }

    /// First writer wins; later writers get `ActionRepeated` until the marker expires.
    pub async fn set(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        if self.store.set_nx(key, ttl).await? {
            return Ok(());
        }
        Err(Error::new_silent(ErrorDetails::ActionRepeated {
            key: key.to_string(),
        }))
    }

    pub async fn exist(&self, key: &str) -> Result<bool, Error> {
        self.store.exist(key).await
    }
}

/// Treats `ActionRepeated` as success, for handlers that short-circuit duplicates.
pub fn ignore_repeated(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if matches!(e.get_details(), ErrorDetails::ActionRepeated { .. }) => {
            tracing::debug!("Skipping repeated action: {e}");
            Ok(())
        }
        other => other,
    }
}
