//! Per-workspace admission of experiment runs under a concurrency cap.

use std::sync::Arc;

use experiment_core::config::ConfigProvider;
use experiment_core::db::QuotaQueries;
use experiment_core::entity::{QuotaSpaceExpt, Session};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::observability::METRIC_QUOTA_DENIED_TOTAL;
use experiment_core::utils::now_unix;
use tracing::instrument;

pub struct QuotaService {
    store: Arc<dyn QuotaQueries>,
    config: Arc<dyn ConfigProvider>,
}

impl QuotaService {
    pub fn new(store: Arc<dyn QuotaQueries>, config: Arc<dyn ConfigProvider>) -> Self {
        Self { store, config }
    }

    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, user_id = %session.user_id))]
    pub async fn allow_expt_run(
        &self,
        space_id: i64,
        expt_id: i64,
        session: &Session,
    ) -> Result<(), Error> {
        let conf = self.config.get_expt_exec_conf(space_id);
        let zombie_secs = i64::try_from(conf.zombie_interval_second).unwrap_or(i64::MAX);
        let limit = conf.space_expt_concur_limit;
        let now = now_unix();
        let result = self
            .store
            .update_space_expt_quota(
                space_id,
                Box::new(move |ledger| admit(ledger, expt_id, now, zombie_secs, limit)),
            )
            .await;
        match result {
            Ok(ledger) => {
                tracing::debug!(running = ledger.expt_id_to_start_at.len(), "Admitted run");
                Ok(())
            }
            Err(e) => {
                if matches!(
                    e.get_details(),
                    ErrorDetails::ExperimentRunningCountLimit { .. }
                ) {
                    metrics::counter!(METRIC_QUOTA_DENIED_TOTAL, "space_id" => space_id.to_string())
                        .increment(1);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, user_id = %session.user_id))]
    pub async fn release_expt_run(
        &self,
        space_id: i64,
        expt_id: i64,
        session: &Session,
    ) -> Result<(), Error> {
        self.store
            .update_space_expt_quota(
                space_id,
                Box::new(move |ledger| {
                    let mut ledger = ledger.unwrap_or_default();
                    ledger.expt_id_to_start_at.remove(&expt_id);
                    Ok(ledger)
                }),
            )
            .await?;
        Ok(())
    }
}

/// Zombies (older than `zombie_secs`) are evicted before the limit is checked.
/// Re-admitting an experiment already in the ledger refreshes its start time.
fn admit(
    ledger: Option<QuotaSpaceExpt>,
    expt_id: i64,
    now: i64,
    zombie_secs: i64,
    limit: usize,
) -> Result<QuotaSpaceExpt, Error> {
    let Some(mut ledger) = ledger else {
        return Ok(QuotaSpaceExpt {
            expt_id_to_start_at: [(expt_id, now)].into_iter().collect(),
        });
    };
    ledger.expt_id_to_start_at.retain(|id, started_at| {
        let zombie = now.saturating_sub(*started_at) > zombie_secs;
        if zombie {
            tracing::warn!(
                expt_id = *id,
                started_at = *started_at,
                "Evicting zombie experiment from quota"
            );
        }
        !zombie
    });
    if !ledger.expt_id_to_start_at.contains_key(&expt_id)
        && ledger.expt_id_to_start_at.len() >= limit
    {
        return Err(Error::new(ErrorDetails::ExperimentRunningCountLimit { limit }));
    }
    ledger.expt_id_to_start_at.insert(expt_id, now);
    Ok(ledger)
}
