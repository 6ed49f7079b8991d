use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use experiment_core::entity::{
    CalculateMode, EXT_KEY_FINISH, EvaluationSetItem, Experiment, ExperimentUpdate,
    ExptAggrCalculateEvent, ExptRunLog, ExptRunMode, ExptScheduleEvent, ExptStatus, ItemRunState,
    RunLogStatus, Session,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::observability::METRIC_EXPT_FINISHED_TOTAL;
use experiment_core::utils::now_unix;
use itertools::Itertools;
use tracing::instrument;

use super::{CheckRunOptions, ExptManager, expt_lock_key};
use crate::idem::{
    COMPLETE_EXPT_TTL, COMPLETE_RUN_TTL, FINISH_EXPT_TTL, complete_expt_key, complete_run_key,
    finish_expt_key, ignore_repeated,
};
use crate::result::queueing_rows;

/// Visibility delay of the schedule event published when a run starts.
pub const RUN_EVENT_DELAY: Duration = Duration::from_secs(3);
pub const TERMINATE_CHUNK_SIZE: usize = 30;

/// Sleeps inserted by the completion path.
#[derive(Clone, Copy, Debug)]
pub struct LifecyclePacing {
    /// Before `complete_expt` reads results, so in-flight writes of the last tick land first.
    pub complete_expt_settle: Duration,
    /// Between chunks of turns moved to `Terminal`.
    pub terminate_chunk_pause: Duration,
}

impl Default for LifecyclePacing {
    fn default() -> Self {
        Self {
            complete_expt_settle: Duration::from_secs(3),
            terminate_chunk_pause: Duration::from_millis(50),
        }
    }
}

impl LifecyclePacing {
    pub fn immediate() -> Self {
        Self {
            complete_expt_settle: Duration::ZERO,
            terminate_chunk_pause: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CompleteExptParam {
    /// Terminal status to write. Derived from the stats when absent.
    pub status: Option<ExptStatus>,
    pub status_message: String,
}

fn status_not_allowed(expt: &Experiment) -> Error {
    Error::new(ErrorDetails::ExperimentStatusNotAllowed {
        expt_id: expt.id,
        status: expt.status,
    })
}

fn schedule_event(
    expt: &Experiment,
    expt_run_id: i64,
    mode: ExptRunMode,
    session: &Session,
) -> ExptScheduleEvent {
    ExptScheduleEvent {
        space_id: expt.space_id,
        expt_id: expt.id,
        expt_run_id,
        expt_run_mode: mode,
        session: session.clone(),
        ext: HashMap::new(),
        created_at: now_unix(),
    }
}

impl ExptManager {
    /// Validates and starts the first run of a `Pending` experiment. Online experiments run in
    /// `Append` mode and wait for items from `invoke`.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, user_id = %session.user_id))]
    pub async fn run(&self, space_id: i64, expt_id: i64, session: &Session) -> Result<i64, Error> {
        let mut expt = self.get(space_id, expt_id).await?;
        if expt.status != ExptStatus::Pending {
            return Err(status_not_allowed(&expt));
        }
        self.prepare_run(&mut expt, session).await?;
        let mode = if expt.is_online() {
            ExptRunMode::Append
        } else {
            ExptRunMode::Submit
        };
        self.start_run(&expt, mode, session).await
    }

    /// Re-runs the failed and terminated turns of a finished experiment.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, user_id = %session.user_id))]
    pub async fn retry_unsuccess(
        &self,
        space_id: i64,
        expt_id: i64,
        session: &Session,
    ) -> Result<i64, Error> {
        let mut expt = self.get(space_id, expt_id).await?;
        if !matches!(
            expt.status,
            ExptStatus::Failed | ExptStatus::Terminated | ExptStatus::SystemTerminated
        ) || expt.is_online()
        {
            return Err(status_not_allowed(&expt));
        }
        self.prepare_run(&mut expt, session).await?;
        self.start_run(&expt, ExptRunMode::FailRetry, session).await
    }

    async fn prepare_run(&self, expt: &mut Experiment, session: &Session) -> Result<(), Error> {
        self.pack_tuple(expt).await?;
        let credit_cost = expt.credit_cost;
        self.check_run(
            expt,
            session,
            CheckRunOptions {
                check_benefit: true,
            },
        )
        .await?;
        if expt.credit_cost != credit_cost {
            self.db
                .update_experiment(
                    expt.space_id,
                    expt.id,
                    &ExperimentUpdate {
                        credit_cost: Some(expt.credit_cost),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn start_run(
        &self,
        expt: &Experiment,
        mode: ExptRunMode,
        session: &Session,
    ) -> Result<i64, Error> {
        let run_id = self.id_gen.gen_id()?;
        self.log_run(expt.space_id, expt.id, run_id, mode, session)
            .await?;
        if let Err(e) = self
            .quota
            .allow_expt_run(expt.space_id, expt.id, session)
            .await
        {
            self.release_lock(expt.id, run_id).await;
            return Err(e);
        }
        self.publisher
            .publish_schedule_event(
                &schedule_event(expt, run_id, mode, session),
                Some(RUN_EVENT_DELAY),
            )
            .await?;
        tracing::info!(expt_run_id = run_id, %mode, "Started experiment run");
        Ok(run_id)
    }

    /// Takes the per-experiment mutex for the run, then records the run log and points the
    /// experiment at it. Fails with `ExperimentRunningExisted` while another run holds the mutex.
    pub async fn log_run(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        mode: ExptRunMode,
        session: &Session,
    ) -> Result<(), Error> {
        let lease = self.config.get_expt_exec_conf(space_id).zombie_interval();
        let locked = self
            .lock
            .try_lock(&expt_lock_key(expt_id), &expt_run_id.to_string(), lease)
            .await?;
        if !locked {
            return Err(Error::new(ErrorDetails::ExperimentRunningExisted { expt_id }));
        }
        let logged: Result<(), Error> = async {
            self.db
                .create_run_log(&ExptRunLog {
                    id: expt_run_id,
                    space_id,
                    expt_id,
                    expt_run_id,
                    mode,
                    status: RunLogStatus::Pending,
                    created_by: session.user_id.clone(),
                    ..Default::default()
                })
                .await?;
            self.db
                .update_experiment(
                    space_id,
                    expt_id,
                    &ExperimentUpdate {
                        latest_run_id: Some(expt_run_id),
                        // Retried experiments leave their terminal status.
                        status: (mode == ExptRunMode::FailRetry)
                            .then_some(ExptStatus::Processing),
                        updated_by: Some(session.user_id.clone()),
                        ..Default::default()
                    },
                )
                .await
        }
        .await;
        if let Err(e) = logged {
            self.release_lock(expt_id, expt_run_id).await;
            return Err(e);
        }
        self.mark_latest_write(expt_id);
        Ok(())
    }

    async fn release_lock(&self, expt_id: i64, expt_run_id: i64) {
        match self
            .lock
            .unlock_owned(&expt_lock_key(expt_id), &expt_run_id.to_string())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(expt_id, expt_run_id, "Experiment mutex was not held by this run");
            }
            Err(e) => e.log_at_level("Failed to release experiment mutex: ", tracing::Level::WARN),
        }
    }

    /// Closes one run: counts its turns, releases the experiment mutex and records the outcome
    /// on the run log. Repeated calls for the same run are no-ops.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, expt_run_id = %expt_run_id))]
    pub async fn complete_run(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
    ) -> Result<(), Error> {
        let marker = complete_run_key(expt_run_id);
        if self.idem.exist(&marker).await? {
            tracing::debug!("Run already completed");
            return Ok(());
        }
        let mut run_log = self
            .db
            .get_run_log(space_id, expt_id, expt_run_id)
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("run log {expt_run_id} of experiment {expt_id}"),
                })
            })?;
        let stats = self.results.calculate_stats(space_id, expt_id).await?;
        self.release_lock(expt_id, expt_run_id).await;

        run_log.pending_cnt = stats.pending_turn_cnt;
        run_log.processing_cnt = stats.processing_turn_cnt;
        run_log.success_cnt = stats.success_turn_cnt;
        run_log.fail_cnt = stats.fail_turn_cnt;
        run_log.terminated_cnt = stats.terminated_turn_cnt;
        run_log.status = if stats.incomplete_turn_cnt() > 0
            || stats.fail_turn_cnt > 0
            || stats.terminated_turn_cnt > 0
        {
            RunLogStatus::Failed
        } else {
            RunLogStatus::Success
        };
        self.db.update_run_log(&run_log).await?;
        tracing::info!(status = %run_log.status, "Completed experiment run");
        ignore_repeated(self.idem.set(&marker, COMPLETE_RUN_TTL).await)
    }

    /// Moves the experiment to its terminal status, triggers the aggregate calculation and frees
    /// its quota slot. Repeated calls for the same run are no-ops.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, expt_run_id = %expt_run_id))]
    pub async fn complete_expt(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        param: CompleteExptParam,
        session: &Session,
    ) -> Result<(), Error> {
        let marker = complete_expt_key(expt_run_id);
        if self.idem.exist(&marker).await? {
            tracing::debug!("Experiment already completed");
            return Ok(());
        }
        tokio::time::sleep(self.pacing.complete_expt_settle).await;

        if matches!(
            param.status,
            Some(ExptStatus::Terminated | ExptStatus::SystemTerminated)
        ) {
            self.terminate_incomplete_turns(space_id, expt_id, expt_run_id)
                .await?;
        }
        let stats = self.results.recompute_stats(space_id, expt_id).await?;
        self.publisher
            .publish_aggr_calculate_events(
                &[ExptAggrCalculateEvent {
                    space_id,
                    expt_id,
                    calculate_mode: CalculateMode::CreateAllFields,
                    specific_field: None,
                    create_time: now_unix(),
                }],
                None,
            )
            .await?;

        let status = param.status.unwrap_or_else(|| {
            let unsuccessful = stats.pending_turn_cnt
                + stats.processing_turn_cnt
                + stats.fail_turn_cnt
                + stats.terminated_turn_cnt;
            if unsuccessful == 0 {
                ExptStatus::Success
            } else {
                ExptStatus::Failed
            }
        });
        self.db
            .update_experiment(
                space_id,
                expt_id,
                &ExperimentUpdate {
                    status: Some(status),
                    status_message: Some(param.status_message),
                    end_at: Some(Utc::now()),
                    updated_by: Some(session.user_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.mark_latest_write(expt_id);
        self.quota
            .release_expt_run(space_id, expt_id, session)
            .await?;

        metrics::counter!(
            METRIC_EXPT_FINISHED_TOTAL,
            "space_id" => space_id.to_string(),
            "status" => status.to_string(),
        )
        .increment(1);
        tracing::info!(%status, "Experiment finished");
        ignore_repeated(self.idem.set(&marker, COMPLETE_EXPT_TTL).await)
    }

    async fn terminate_incomplete_turns(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
    ) -> Result<(), Error> {
        let incomplete = self
            .results
            .list_turn_ids(space_id, expt_id, |state| !state.is_final())
            .await?;
        for (n, chunk) in incomplete.chunks(TERMINATE_CHUNK_SIZE).enumerate() {
            if n > 0 {
                tokio::time::sleep(self.pacing.terminate_chunk_pause).await;
            }
            let item_ids: Vec<i64> = chunk.iter().map(|t| t.item_id).unique().collect();
            self.results
                .update_turns_status(space_id, expt_id, chunk, ItemRunState::Terminal)
                .await?;
            self.results
                .update_items_status(space_id, expt_id, &item_ids, ItemRunState::Terminal)
                .await?;
            self.results
                .update_run_logs_status(
                    space_id,
                    expt_id,
                    expt_run_id,
                    &item_ids,
                    ItemRunState::Terminal,
                )
                .await?;
        }
        tracing::info!(turns = incomplete.len(), "Terminated incomplete turns");
        Ok(())
    }

    /// Terminates a running or pending experiment.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, user_id = %session.user_id))]
    pub async fn kill(
        &self,
        space_id: i64,
        expt_id: i64,
        reason: &str,
        session: &Session,
    ) -> Result<(), Error> {
        let expt = self.get(space_id, expt_id).await?;
        if expt.status.is_finished() {
            return Err(status_not_allowed(&expt));
        }
        if expt.latest_run_id == 0 {
            // Never ran: nothing to terminate or release.
            self.db
                .update_experiment(
                    space_id,
                    expt_id,
                    &ExperimentUpdate {
                        status: Some(ExptStatus::Terminated),
                        status_message: Some(reason.to_string()),
                        end_at: Some(Utc::now()),
                        updated_by: Some(session.user_id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            self.mark_latest_write(expt_id);
            return Ok(());
        }
        self.complete_expt(
            space_id,
            expt_id,
            expt.latest_run_id,
            CompleteExptParam {
                status: Some(ExptStatus::Terminated),
                status_message: reason.to_string(),
            },
            session,
        )
        .await
    }

    /// Asks a running online experiment to drain: once its queued items are evaluated the
    /// scheduler completes it. Repeated calls within the marker TTL are no-ops.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, user_id = %session.user_id))]
    pub async fn finish(
        &self,
        space_id: i64,
        expt_id: i64,
        session: &Session,
    ) -> Result<(), Error> {
        let marker = finish_expt_key(expt_id);
        if self.idem.exist(&marker).await? {
            return Ok(());
        }
        let expt = self.get(space_id, expt_id).await?;
        if expt.status.is_finished() || expt.latest_run_id == 0 {
            return Err(status_not_allowed(&expt));
        }
        self.db
            .update_experiment(
                space_id,
                expt_id,
                &ExperimentUpdate {
                    status: Some(ExptStatus::Draining),
                    updated_by: Some(session.user_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.mark_latest_write(expt_id);

        let mut event = schedule_event(&expt, expt.latest_run_id, ExptRunMode::Append, session);
        event
            .ext
            .insert(EXT_KEY_FINISH.to_string(), "true".to_string());
        self.publisher
            .publish_schedule_event(&event, Some(RUN_EVENT_DELAY))
            .await?;
        ignore_repeated(self.idem.set(&marker, FINISH_EXPT_TTL).await)
    }

    /// Adds items to a running online experiment and schedules their evaluation.
    /// Items already in the experiment are skipped. Returns the number of items added.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, items = items.len()))]
    pub async fn invoke(
        &self,
        space_id: i64,
        expt_id: i64,
        items: &[EvaluationSetItem],
        session: &Session,
    ) -> Result<usize, Error> {
        let expt = self.get(space_id, expt_id).await?;
        if !expt.is_online() || expt.status.is_finished() || expt.latest_run_id == 0 {
            return Err(status_not_allowed(&expt));
        }
        let incoming: Vec<i64> = items.iter().map(|item| item.item_id).collect();
        let existing: HashSet<i64> = self
            .db
            .get_item_results(space_id, expt_id, &incoming)
            .await?
            .into_iter()
            .map(|r| r.item_id)
            .collect();
        let new_items: Vec<&EvaluationSetItem> = items
            .iter()
            .filter(|item| !existing.contains(&item.item_id))
            .unique_by(|item| item.item_id)
            .collect();
        if new_items.is_empty() {
            return Ok(0);
        }

        let start_idx = self
            .db
            .get_max_item_idx(space_id, expt_id)
            .await?
            .map_or(0, |idx| idx + 1);
        let rows = queueing_rows(
            space_id,
            expt_id,
            expt.latest_run_id,
            &new_items,
            start_idx,
            self.id_gen.as_ref(),
        )?;
        let inserted_turns = self.results.create_nx(&rows).await?;
        self.db
            .incr_pending_turn_cnt(
                space_id,
                expt_id,
                i64::try_from(inserted_turns).unwrap_or(i64::MAX),
            )
            .await?;
        self.publisher
            .publish_schedule_event(
                &schedule_event(&expt, expt.latest_run_id, ExptRunMode::Append, session),
                None,
            )
            .await?;
        Ok(new_items.len())
    }
}
