//! Event-driven run scheduler. Each schedule event is one tick of a run: the tick seeds the run
//! on its first delivery, dispatches a bounded batch of queued items to the item pipeline, and
//! either republishes itself or completes the run once no work is left.

mod item;
mod mode;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use experiment_core::bus::ExptEventPublisher;
use experiment_core::config::{ConfigProvider, ExptExecConf};
use experiment_core::db::ExptDatabase;
use experiment_core::entity::{
    EvaluationSetItem, Experiment, ExperimentUpdate, ExptItemResultRunLog, ExptScheduleEvent,
    ExptStatus, ItemRunState, ListEvaluationSetItemsParam, ReadConsistency,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::observability::METRIC_SCHEDULER_TICK_TOTAL;
use experiment_core::rpc::EvaluationSetService;
use experiment_core::utils::id::IdGenerator;
use futures::stream::{self, StreamExt, TryStreamExt};
use itertools::Itertools;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::idem::IdempotentService;
use crate::manager::{CompleteExptParam, ExptManager};
use crate::result::{ExptResultService, QueueingRows, STATS_MAX_LOOPS, queueing_rows};

pub use item::{
    ExptEvalItem, ItemEvalOutcome, ItemEvaluator, TokenCost, build_evaluator_input,
    build_target_input,
};
pub use mode::ScheduleMode;

const PROCESSING: &[ItemRunState] = &[ItemRunState::Processing];
const QUEUEING: &[ItemRunState] = &[ItemRunState::Queueing];
const FINISHED: &[ItemRunState] = &[
    ItemRunState::Success,
    ItemRunState::Fail,
    ItemRunState::Terminal,
];

/// Item run logs of one run, split by what the tick does with them.
#[derive(Clone, Debug, Default)]
pub struct ScanResult {
    /// Dispatched by this tick.
    pub to_submit: Vec<ExptItemResultRunLog>,
    /// Still in flight, or queued beyond this tick's capacity.
    pub incomplete: Vec<ExptItemResultRunLog>,
    pub complete: Vec<ExptItemResultRunLog>,
}

pub struct ExptSchedulerDeps {
    pub db: Arc<dyn ExptDatabase>,
    pub manager: Arc<ExptManager>,
    pub results: Arc<ExptResultService>,
    pub idem: Arc<IdempotentService>,
    pub eval_sets: Arc<dyn EvaluationSetService>,
    pub publisher: Arc<dyn ExptEventPublisher>,
    pub config: Arc<dyn ConfigProvider>,
    pub id_gen: Arc<dyn IdGenerator>,
    pub item_evaluator: Arc<ItemEvaluator>,
}

pub struct ExptSchedulerService {
    db: Arc<dyn ExptDatabase>,
    manager: Arc<ExptManager>,
    results: Arc<ExptResultService>,
    idem: Arc<IdempotentService>,
    eval_sets: Arc<dyn EvaluationSetService>,
    publisher: Arc<dyn ExptEventPublisher>,
    config: Arc<dyn ConfigProvider>,
    id_gen: Arc<dyn IdGenerator>,
    item_evaluator: Arc<ItemEvaluator>,
}

fn item_concur_num(expt: &Experiment, conf: &ExptExecConf) -> usize {
    expt.eval_conf
        .item_concur_num
        .unwrap_or(conf.item_eval_conf.concur_num)
        .max(1)
}

fn alive_time_exceeded(expt: &Experiment, now: DateTime<Utc>) -> bool {
    expt.max_alive_time > 0
        && expt
            .start_at
            .is_some_and(|start| (now - start).num_milliseconds() > expt.max_alive_time)
}

/// Eval set version the experiment's items are read from. Online experiments read the draft.
fn item_version_id(expt: &Experiment) -> i64 {
    expt.eval_set_version
        .as_ref()
        .map_or(expt.eval_set_version_id, |v| v.id)
}

impl ExptSchedulerService {
    pub fn new(deps: ExptSchedulerDeps) -> Self {
        let ExptSchedulerDeps {
            db,
            manager,
            results,
            idem,
            eval_sets,
            publisher,
            config,
            id_gen,
            item_evaluator,
        } = deps;
        Self {
            db,
            manager,
            results,
            idem,
            eval_sets,
            publisher,
            config,
            id_gen,
            item_evaluator,
        }
    }

    /// Handles one schedule event. An error leaves the event to be redelivered.
    #[instrument(skip_all, fields(space_id = %event.space_id, expt_id = %event.expt_id, expt_run_id = %event.expt_run_id, mode = %event.expt_run_mode))]
    pub async fn schedule(&self, event: &ExptScheduleEvent) -> Result<(), Error> {
        let mode = ScheduleMode::from(event.expt_run_mode);
        let result = self.tick(mode, event).await;
        metrics::counter!(
            METRIC_SCHEDULER_TICK_TOTAL,
            "space_id" => event.space_id.to_string(),
            "mode" => mode.mode().to_string(),
            "is_error" => result.is_err().to_string(),
        )
        .increment(1);
        result
    }

    async fn tick(&self, mode: ScheduleMode, event: &ExptScheduleEvent) -> Result<(), Error> {
        let Some(mut expt) = self
            .db
            .get_experiment(event.space_id, event.expt_id, ReadConsistency::Primary)
            .await?
        else {
            tracing::warn!("Dropping schedule event of a missing experiment");
            return Ok(());
        };
        if expt.latest_run_id != event.expt_run_id {
            tracing::debug!(
                latest_run_id = expt.latest_run_id,
                "Dropping schedule event of a superseded run"
            );
            return Ok(());
        }
        if expt.status.is_finished() {
            return self
                .manager
                .complete_run(event.space_id, event.expt_id, event.expt_run_id)
                .await;
        }
        if alive_time_exceeded(&expt, Utc::now()) {
            tracing::warn!(
                max_alive_time = expt.max_alive_time,
                "Experiment exceeded its max alive time"
            );
            self.manager
                .complete_expt(
                    event.space_id,
                    event.expt_id,
                    event.expt_run_id,
                    CompleteExptParam {
                        status: Some(ExptStatus::SystemTerminated),
                        status_message: format!(
                            "experiment exceeded its max alive time of {} ms",
                            expt.max_alive_time
                        ),
                    },
                    &event.session,
                )
                .await?;
            return self
                .manager
                .complete_run(event.space_id, event.expt_id, event.expt_run_id)
                .await;
        }

        self.manager.pack_tuple(&mut expt).await?;
        let started = Instant::now();
        mode.schedule_start(event, &expt);
        mode.expt_start(self, event, &mut expt).await?;
        let scan = mode.scan_eval_items(self, event, &expt).await?;
        let expt = Arc::new(expt);
        self.dispatch(event, &expt, &scan.to_submit).await?;
        let need_tick = mode.expt_end(self, event, &expt, &scan).await?;
        mode.schedule_end(event, &scan, need_tick, started);
        mode.next_tick(self, event, need_tick).await
    }

    /// First tick of a `Submit` run: seeds `Queueing` rows for every item of the dataset
    /// version and marks the experiment `Processing`.
    async fn seed_submit(
        &self,
        event: &ExptScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<(), Error> {
        let conf = self.config.get_expt_exec_conf(expt.space_id);
        let retries = self.config.get_rpc_retries();
        let mut items: Vec<EvaluationSetItem> = Vec::new();
        let mut page_token = None;
        for _ in 0..STATS_MAX_LOOPS {
            let param = ListEvaluationSetItemsParam {
                space_id: expt.space_id,
                eval_set_id: expt.eval_set_id,
                version_id: expt.eval_set_version_id,
                page_token: page_token.take(),
                page_size: conf.scan_item_page_size,
            };
            let page = retries
                .retry("evaluation_set", || self.eval_sets.list_evaluation_set_items(&param))
                .await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        let items: Vec<&EvaluationSetItem> = items.iter().unique_by(|i| i.item_id).collect();
        let rows = queueing_rows(
            expt.space_id,
            expt.id,
            event.expt_run_id,
            &items,
            0,
            self.id_gen.as_ref(),
        )?;
        let turns = self.results.create_nx(&rows).await?;
        self.results
            .recompute_stats(expt.space_id, expt.id)
            .await?;
        self.mark_processing(event, expt).await?;
        tracing::info!(items = items.len(), turns, "Seeded experiment results");
        Ok(())
    }

    /// First tick of a `FailRetry` run: puts failed and terminated turns back in the queue
    /// under fresh run logs.
    async fn seed_fail_retry(
        &self,
        event: &ExptScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<(), Error> {
        let retry_turns = self
            .results
            .list_turn_ids(expt.space_id, expt.id, |state| state.needs_retry())
            .await?;
        let item_ids: Vec<i64> = retry_turns.iter().map(|t| t.item_id).unique().collect();
        self.results
            .update_turns_status(expt.space_id, expt.id, &retry_turns, ItemRunState::Queueing)
            .await?;
        self.results
            .update_items_status(expt.space_id, expt.id, &item_ids, ItemRunState::Queueing)
            .await?;
        if !item_ids.is_empty() {
            let ids = self.id_gen.gen_multi_ids(item_ids.len())?;
            let run_logs = ids
                .into_iter()
                .zip(&item_ids)
                .map(|(id, &item_id)| ExptItemResultRunLog {
                    id,
                    space_id: expt.space_id,
                    expt_id: expt.id,
                    expt_run_id: event.expt_run_id,
                    item_id,
                    status: ItemRunState::Queueing,
                    ..Default::default()
                })
                .collect();
            self.results
                .create_nx(&QueueingRows {
                    run_logs,
                    ..Default::default()
                })
                .await?;
        }
        self.results
            .recompute_stats(expt.space_id, expt.id)
            .await?;
        self.mark_processing(event, expt).await?;
        tracing::info!(
            items = item_ids.len(),
            turns = retry_turns.len(),
            "Queued failed turns for retry"
        );
        Ok(())
    }

    /// First tick of an `Append` run, and finish requests on later ticks.
    async fn start_append(
        &self,
        event: &ExptScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<(), Error> {
        let mut update = ExperimentUpdate::default();
        if expt.status == ExptStatus::Pending {
            expt.status = ExptStatus::Processing;
            update.status = Some(ExptStatus::Processing);
            update.start_at = Some(Utc::now());
        }
        if event.is_finish() && expt.status == ExptStatus::Processing {
            expt.status = ExptStatus::Draining;
            update.status = Some(ExptStatus::Draining);
        }
        if update.status.is_none() {
            return Ok(());
        }
        update.updated_by = Some(event.session.user_id.clone());
        self.db
            .update_experiment(expt.space_id, expt.id, &update)
            .await
    }

    async fn mark_processing(
        &self,
        event: &ExptScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<(), Error> {
        let start_at = Utc::now();
        self.db
            .update_experiment(
                expt.space_id,
                expt.id,
                &ExperimentUpdate {
                    status: Some(ExptStatus::Processing),
                    status_message: Some(String::new()),
                    start_at: Some(start_at),
                    updated_by: Some(event.session.user_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        expt.status = ExptStatus::Processing;
        expt.start_at = Some(start_at);
        Ok(())
    }

    /// Scans the run's item logs in three concurrent passes and picks the items to dispatch.
    /// `Processing` logs untouched for longer than the zombie interval are reclaimed.
    async fn scan(
        &self,
        event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<ScanResult, Error> {
        let conf = self.config.get_expt_exec_conf(expt.space_id);
        let concur = item_concur_num(expt, &conf);
        let passes = [(PROCESSING, None), (QUEUEING, Some(concur)), (FINISHED, None)];
        let mut scanned: Vec<Vec<ExptItemResultRunLog>> = stream::iter(passes)
            .map(|(states, limit)| {
                self.db.scan_item_run_logs(
                    expt.space_id,
                    expt.id,
                    event.expt_run_id,
                    states,
                    limit,
                )
            })
            .buffered(conf.scan_concur_num.max(1))
            .try_collect()
            .await?;
        let complete = scanned.pop().unwrap_or_default();
        let queueing = scanned.pop().unwrap_or_default();
        let processing = scanned.pop().unwrap_or_default();

        let zombie_after = TimeDelta::from_std(conf.zombie_interval()).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let (stale, active): (Vec<_>, Vec<_>) = processing
            .into_iter()
            .partition(|log| log.updated_at.is_some_and(|at| now - at > zombie_after));
        if !stale.is_empty() {
            tracing::warn!(items = stale.len(), "Reclaiming stale processing items");
        }

        let capacity = concur.saturating_sub(active.len());
        let mut to_submit = stale;
        to_submit.extend(queueing);
        let overflow = to_submit.split_off(capacity.min(to_submit.len()));
        let mut incomplete = active;
        incomplete.extend(overflow);
        Ok(ScanResult {
            to_submit,
            incomplete,
            complete,
        })
    }

    /// Claims the selected items, runs the claimed ones through the item pipeline at most
    /// `item_concur_num` at a time, and charges their token cost to the experiment.
    async fn dispatch(
        &self,
        event: &ExptScheduleEvent,
        expt: &Arc<Experiment>,
        to_submit: &[ExptItemResultRunLog],
    ) -> Result<(), Error> {
        let item_ids = self
            .results
            .claim_run_logs(expt.space_id, expt.id, event.expt_run_id, to_submit)
            .await?;
        if item_ids.len() < to_submit.len() {
            tracing::debug!(
                scanned = to_submit.len(),
                claimed = item_ids.len(),
                "Items were claimed by a concurrent tick"
            );
        }
        if item_ids.is_empty() {
            return Ok(());
        }
        self.results
            .update_items_status(expt.space_id, expt.id, &item_ids, ItemRunState::Processing)
            .await?;

        let version_id = item_version_id(expt);
        let items = self
            .config
            .get_rpc_retries()
            .retry("evaluation_set", || {
                self.eval_sets.batch_get_evaluation_set_items(
                    expt.space_id,
                    expt.eval_set_id,
                    version_id,
                    &item_ids,
                )
            })
            .await?;
        let mut by_id: HashMap<i64, EvaluationSetItem> =
            items.into_iter().map(|item| (item.item_id, item)).collect();

        let conf = self.config.get_expt_exec_conf(expt.space_id);
        let semaphore = Arc::new(Semaphore::new(item_concur_num(expt, &conf)));
        let mut join_set = JoinSet::new();
        for &item_id in &item_ids {
            let evaluator = self.item_evaluator.clone();
            let semaphore = semaphore.clone();
            let expt = expt.clone();
            let event = event.clone();
            let data = by_id.remove(&item_id);
            let item = ExptEvalItem {
                expt_id: expt.id,
                eval_set_version_id: version_id,
                item_id,
                state: ItemRunState::Processing,
            };
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await.map_err(|e| {
                    Error::new(ErrorDetails::CommonInternal {
                        message: format!("item semaphore closed: {e}"),
                    })
                })?;
                evaluator.eval(&expt, &event, &item, data.as_ref()).await
            });
        }

        let mut cost = TokenCost::default();
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => cost += outcome.cost,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert_with(|| {
                        Error::new(ErrorDetails::CommonInternal {
                            message: format!("item evaluation task failed: {e}"),
                        })
                    });
                }
            }
        }
        self.results
            .add_token_cost(expt.space_id, expt.id, cost.input_tokens, cost.output_tokens)
            .await?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
