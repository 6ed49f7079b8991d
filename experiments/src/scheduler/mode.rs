use std::time::Instant;

use experiment_core::entity::{Experiment, ExptRunMode, ExptScheduleEvent, ExptStatus};
use experiment_core::error::Error;

use super::{ExptSchedulerService, ScanResult};
use crate::idem::{EXPT_START_TTL, expt_start_key, ignore_repeated};
use crate::manager::CompleteExptParam;

/// Per-mode behaviour of a scheduler tick.
///
/// * `Submit` seeds every item of the dataset version on its first tick and completes the
///   experiment once all of them are evaluated.
/// * `FailRetry` re-queues the failed and terminated turns of a finished experiment.
/// * `Append` seeds nothing; items arrive through `ExptManager::invoke`. The experiment only
///   completes after a finish request has moved it to `Draining`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleMode {
    Submit,
    FailRetry,
    Append,
}

impl From<ExptRunMode> for ScheduleMode {
    fn from(mode: ExptRunMode) -> Self {
        match mode {
            ExptRunMode::Submit => ScheduleMode::Submit,
            ExptRunMode::FailRetry => ScheduleMode::FailRetry,
            ExptRunMode::Append => ScheduleMode::Append,
        }
    }
}

impl ScheduleMode {
    pub fn mode(self) -> ExptRunMode {
        match self {
            ScheduleMode::Submit => ExptRunMode::Submit,
            ScheduleMode::FailRetry => ExptRunMode::FailRetry,
            ScheduleMode::Append => ExptRunMode::Append,
        }
    }

    pub fn schedule_start(self, event: &ExptScheduleEvent, expt: &Experiment) {
        tracing::debug!(
            mode = %self.mode(),
            status = %expt.status,
            finish = event.is_finish(),
            "Scheduler tick started"
        );
    }

    /// Seeds the run. `Submit` and `FailRetry` seed once per run; `Append` applies its status
    /// transitions on every tick.
    pub async fn expt_start(
        self,
        scheduler: &ExptSchedulerService,
        event: &ExptScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<(), Error> {
        if self == ScheduleMode::Append {
            return scheduler.start_append(event, expt).await;
        }
        let marker = expt_start_key(expt.id, event.expt_run_id);
        if scheduler.idem.exist(&marker).await? {
            return Ok(());
        }
        match self {
            ScheduleMode::Submit => scheduler.seed_submit(event, expt).await?,
            ScheduleMode::FailRetry => scheduler.seed_fail_retry(event, expt).await?,
            ScheduleMode::Append => {}
        }
        ignore_repeated(scheduler.idem.set(&marker, EXPT_START_TTL).await)
    }

    pub async fn scan_eval_items(
        self,
        scheduler: &ExptSchedulerService,
        event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<ScanResult, Error> {
        let scan = scheduler.scan(event, expt).await?;
        tracing::debug!(
            mode = %self.mode(),
            to_submit = scan.to_submit.len(),
            incomplete = scan.incomplete.len(),
            complete = scan.complete.len(),
            "Scanned item run logs"
        );
        Ok(scan)
    }

    /// Returns whether the run needs another tick. When it does not, the run is completed:
    /// always for `Submit` and `FailRetry`, and for `Append` only once the experiment drains.
    pub async fn expt_end(
        self,
        scheduler: &ExptSchedulerService,
        event: &ExptScheduleEvent,
        expt: &Experiment,
        scan: &ScanResult,
    ) -> Result<bool, Error> {
        if !scan.to_submit.is_empty() || !scan.incomplete.is_empty() {
            return Ok(true);
        }
        let completes = match self {
            ScheduleMode::Submit | ScheduleMode::FailRetry => true,
            ScheduleMode::Append => expt.status == ExptStatus::Draining,
        };
        if !completes {
            tracing::debug!("Append run is idle");
            return Ok(false);
        }
        scheduler
            .manager
            .complete_run(event.space_id, event.expt_id, event.expt_run_id)
            .await?;
        scheduler
            .manager
            .complete_expt(
                event.space_id,
                event.expt_id,
                event.expt_run_id,
                CompleteExptParam::default(),
                &event.session,
            )
            .await?;
        Ok(false)
    }

    pub fn schedule_end(
        self,
        event: &ExptScheduleEvent,
        scan: &ScanResult,
        need_tick: bool,
        started: Instant,
    ) {
        tracing::info!(
            mode = %self.mode(),
            expt_run_id = event.expt_run_id,
            submitted = scan.to_submit.len(),
            incomplete = scan.incomplete.len(),
            complete = scan.complete.len(),
            need_tick,
            elapsed = ?started.elapsed(),
            "Scheduler tick finished"
        );
    }

    /// Republishes the event after the daemon interval when the run needs another tick.
    pub async fn next_tick(
        self,
        scheduler: &ExptSchedulerService,
        event: &ExptScheduleEvent,
        need_tick: bool,
    ) -> Result<(), Error> {
        if !need_tick {
            return Ok(());
        }
        let delay = scheduler
            .config
            .get_expt_exec_conf(event.space_id)
            .daemon_interval();
        let next = ExptScheduleEvent {
            expt_run_mode: self.mode(),
            ..event.clone()
        };
        scheduler
            .publisher
            .publish_schedule_event(&next, Some(delay))
            .await
    }
}

