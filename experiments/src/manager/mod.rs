//! Experiment lifecycle: creation and reads, the pre-run validation pipeline, and the run and
//! completion transitions driven by callers and the scheduler.

mod check;
mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use experiment_core::bus::ExptEventPublisher;
use experiment_core::config::ConfigProvider;
use experiment_core::db::{DistributedLock, ExptDatabase};
use experiment_core::entity::{
    EvalTargetType, EvaluatorVersionRef, Experiment, ExperimentUpdate, ExptEvalConf,
    ExptListFilter, ExptStats, ExptStatus, ExptType, Page, ReadConsistency, Session, SourceType,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::rpc::{AuditService, BenefitService, EvaluationSetService, EvaluatorService};
use experiment_core::utils::id::IdGenerator;
use moka::sync::Cache;
use tracing::instrument;

use crate::aggregation::ExptAggrResultService;
use crate::idem::IdempotentService;
use crate::quota::QuotaService;
use crate::result::ExptResultService;
use crate::target::EvalTargetService;

pub use check::CheckRunOptions;
pub use lifecycle::{CompleteExptParam, LifecyclePacing};

/// Reads of an experiment within this window after a write go to the primary.
const LATEST_WRITE_TTL: Duration = Duration::from_secs(10);
const LATEST_WRITE_CAPACITY: u64 = 10_000;

pub fn expt_lock_key(expt_id: i64) -> String {
    format!("expt:{expt_id}")
}

/// Collaborators of `ExptManager`.
pub struct ExptManagerDeps {
    pub db: Arc<dyn ExptDatabase>,
    pub lock: Arc<dyn DistributedLock>,
    pub idem: Arc<IdempotentService>,
    pub quota: Arc<QuotaService>,
    pub results: Arc<ExptResultService>,
    pub aggr: Arc<ExptAggrResultService>,
    pub targets: Arc<EvalTargetService>,
    pub eval_sets: Arc<dyn EvaluationSetService>,
    pub evaluators: Arc<dyn EvaluatorService>,
    pub audit: Arc<dyn AuditService>,
    pub benefit: Arc<dyn BenefitService>,
    pub publisher: Arc<dyn ExptEventPublisher>,
    pub config: Arc<dyn ConfigProvider>,
    pub id_gen: Arc<dyn IdGenerator>,
}

/// Source of the evaluation target when creating an experiment.
#[derive(Clone, Debug, Default)]
pub struct CreateEvalTargetParam {
    pub source_target_id: String,
    pub source_target_version: String,
}

#[derive(Clone, Debug, Default)]
pub struct CreateExptParam {
    pub space_id: i64,
    pub name: String,
    pub description: String,
    pub eval_set_id: i64,
    pub eval_set_version_id: i64,
    /// An already stored target version. Ignored when `create_eval_target_param` is set.
    pub target_version_id: Option<i64>,
    pub create_eval_target_param: Option<CreateEvalTargetParam>,
    pub evaluator_version_ids: Vec<i64>,
    pub eval_conf: ExptEvalConf,
    pub expt_type: ExptType,
    pub source_type: SourceType,
    pub source_id: String,
    pub max_alive_time: i64,
}

pub struct ExptManager {
    db: Arc<dyn ExptDatabase>,
    lock: Arc<dyn DistributedLock>,
    idem: Arc<IdempotentService>,
    quota: Arc<QuotaService>,
    results: Arc<ExptResultService>,
    aggr: Arc<ExptAggrResultService>,
    targets: Arc<EvalTargetService>,
    eval_sets: Arc<dyn EvaluationSetService>,
    evaluators: Arc<dyn EvaluatorService>,
    audit: Arc<dyn AuditService>,
    benefit: Arc<dyn BenefitService>,
    publisher: Arc<dyn ExptEventPublisher>,
    config: Arc<dyn ConfigProvider>,
    id_gen: Arc<dyn IdGenerator>,
    // Cloning a moka `Cache` yields a handle to the same cache.
    latest_write: Cache<i64, ()>,
    pacing: LifecyclePacing,
}

/// The experiment without the components joined on read.
fn persistable(expt: &Experiment) -> Experiment {
    Experiment {
        eval_set: None,
        eval_set_version: None,
        target: None,
        evaluators: Vec::new(),
        stats: None,
        aggregate_result: None,
        ..expt.clone()
    }
}

impl ExptManager {
    pub fn new(deps: ExptManagerDeps) -> Self {
        let ExptManagerDeps {
            db,
            lock,
            idem,
            quota,
            results,
            aggr,
            targets,
            eval_sets,
            evaluators,
            audit,
            benefit,
            publisher,
            config,
            id_gen,
        } = deps;
        Self {
            db,
            lock,
            idem,
            quota,
            results,
            aggr,
            targets,
            eval_sets,
            evaluators,
            audit,
            benefit,
            publisher,
            config,
            id_gen,
            latest_write: Cache::builder()
                .max_capacity(LATEST_WRITE_CAPACITY)
                .time_to_live(LATEST_WRITE_TTL)
                .build(),
            pacing: LifecyclePacing::default(),
        }
    }

    #[must_use]
    pub fn with_pacing(mut self, pacing: LifecyclePacing) -> Self {
        self.pacing = pacing;
        self
    }

    fn mark_latest_write(&self, expt_id: i64) {
        self.latest_write.insert(expt_id, ());
    }

    fn read_consistency(&self, expt_id: i64) -> ReadConsistency {
        if self.latest_write.contains_key(&expt_id) {
            ReadConsistency::Primary
        } else {
            ReadConsistency::Replica
        }
    }

    /// Returns true when no live experiment in the space uses `name`.
    pub async fn check_name(&self, space_id: i64, name: &str) -> Result<bool, Error> {
        Ok(self.db.get_experiment_by_name(space_id, name).await?.is_none())
    }

    #[instrument(skip_all, fields(space_id = %param.space_id, name = %param.name, user_id = %session.user_id))]
    pub async fn create(
        &self,
        param: CreateExptParam,
        session: &Session,
    ) -> Result<Experiment, Error> {
        if param.name.trim().is_empty() {
            return Err(Error::new(ErrorDetails::InvalidParam {
                message: "experiment name must not be empty".to_string(),
            }));
        }
        if !self.check_name(param.space_id, &param.name).await? {
            return Err(Error::new(ErrorDetails::ExperimentNameExisted { name: param.name }));
        }

        let mut expt = Experiment {
            space_id: param.space_id,
            name: param.name,
            description: param.description,
            eval_set_id: param.eval_set_id,
            eval_set_version_id: param.eval_set_version_id,
            eval_conf: param.eval_conf,
            expt_type: param.expt_type,
            source_type: param.source_type,
            source_id: param.source_id,
            status: ExptStatus::Pending,
            max_alive_time: param.max_alive_time,
            created_by: session.user_id.clone(),
            updated_by: session.user_id.clone(),
            ..Default::default()
        };

        if let Some(source) = &param.create_eval_target_param {
            let target = self
                .targets
                .create_or_get_by_source(
                    param.space_id,
                    &source.source_target_id,
                    &source.source_target_version,
                )
                .await?;
            expt.target_version_id = target.eval_target_version.as_ref().map(|v| v.id);
        } else {
            expt.target_version_id = param.target_version_id;
        }

        let evaluators = self
            .evaluators
            .batch_get_evaluators_by_version_ids(param.space_id, &param.evaluator_version_ids)
            .await?;
        expt.evaluator_version_refs = evaluators
            .iter()
            .filter_map(|e| {
                e.evaluator_version_id().map(|evaluator_version_id| EvaluatorVersionRef {
                    evaluator_id: e.id,
                    evaluator_version_id,
                })
            })
            .collect();

        self.pack_tuple(&mut expt).await?;
        self.check_run(&mut expt, session, CheckRunOptions::default())
            .await?;
        self.insert(expt).await
    }

    /// Copies the tuple and connector of an experiment into a new `Pending` experiment.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id, user_id = %session.user_id))]
    pub async fn clone_expt(
        &self,
        space_id: i64,
        expt_id: i64,
        session: &Session,
    ) -> Result<Experiment, Error> {
        let source = self.get(space_id, expt_id).await?;
        let mut name = format!("{}_copy", source.name);
        let mut suffix = 1;
        while !self.check_name(space_id, &name).await? {
            suffix += 1;
            name = format!("{}_copy{suffix}", source.name);
        }
        let mut expt = Experiment {
            name,
            status: ExptStatus::Pending,
            status_message: String::new(),
            latest_run_id: 0,
            start_at: None,
            end_at: None,
            created_by: session.user_id.clone(),
            updated_by: session.user_id.clone(),
            created_at: None,
            updated_at: None,
            ..persistable(&source)
        };
        self.pack_tuple(&mut expt).await?;
        self.insert(expt).await
    }

    async fn insert(&self, mut expt: Experiment) -> Result<Experiment, Error> {
        let (expt_id, stats_id) = self.id_gen.gen_id_pair()?;
        expt.id = expt_id;
        self.db.create_experiment(&persistable(&expt)).await?;
        self.db
            .create_stats(&ExptStats {
                id: stats_id,
                space_id: expt.space_id,
                expt_id: expt.id,
                ..Default::default()
            })
            .await?;
        self.mark_latest_write(expt.id);
        tracing::info!(expt_id = expt.id, "Created experiment");
        Ok(expt)
    }

    pub async fn get(&self, space_id: i64, expt_id: i64) -> Result<Experiment, Error> {
        self.db
            .get_experiment(space_id, expt_id, self.read_consistency(expt_id))
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("experiment {expt_id}"),
                })
            })
    }

    pub async fn mget(&self, space_id: i64, expt_ids: &[i64]) -> Result<Vec<Experiment>, Error> {
        let consistency = if expt_ids
            .iter()
            .any(|id| self.latest_write.contains_key(id))
        {
            ReadConsistency::Primary
        } else {
            ReadConsistency::Replica
        };
        self.db
            .mget_experiments(space_id, expt_ids, consistency)
            .await
    }

    pub async fn list(
        &self,
        space_id: i64,
        filter: &ExptListFilter,
        page: Page,
    ) -> Result<(Vec<Experiment>, i64), Error> {
        self.db.list_experiments(space_id, filter, page).await
    }

    /// Renames or re-describes an experiment.
    pub async fn update(
        &self,
        space_id: i64,
        expt_id: i64,
        name: Option<String>,
        description: Option<String>,
        session: &Session,
    ) -> Result<(), Error> {
        let expt = self.get(space_id, expt_id).await?;
        if let Some(name) = &name
            && *name != expt.name
            && !self.check_name(space_id, name).await?
        {
            return Err(Error::new(ErrorDetails::ExperimentNameExisted {
                name: name.clone(),
            }));
        }
        self.db
            .update_experiment(
                space_id,
                expt_id,
                &ExperimentUpdate {
                    name,
                    description,
                    updated_by: Some(session.user_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.mark_latest_write(expt_id);
        Ok(())
    }

    /// Soft-deletes an experiment that is not running.
    pub async fn delete(&self, space_id: i64, expt_id: i64) -> Result<(), Error> {
        let expt = self.get(space_id, expt_id).await?;
        if expt.status.is_running() {
            return Err(Error::new(ErrorDetails::ExperimentStatusNotAllowed {
                expt_id,
                status: expt.status,
            }));
        }
        self.db.delete_experiment(space_id, expt_id).await?;
        self.mark_latest_write(expt_id);
        Ok(())
    }

    /// Joins the eval set, target and evaluators the experiment refers to. Components that do
    /// not exist are left empty for `check_run` to report.
    pub async fn pack_tuple(&self, expt: &mut Experiment) -> Result<(), Error> {
        let space_id = expt.space_id;
        if expt.is_online() {
            expt.eval_set = self
                .eval_sets
                .get_evaluation_set(space_id, expt.eval_set_id)
                .await?;
            expt.eval_set_version = expt
                .eval_set
                .as_ref()
                .and_then(|set| set.evaluation_set_version.clone());
        } else if let Some((version, set)) = self
            .eval_sets
            .get_evaluation_set_version(space_id, expt.eval_set_version_id)
            .await?
        {
            expt.eval_set_id = set.id;
            expt.eval_set_version = Some(version);
            expt.eval_set = Some(set);
        }

        if let Some(version_id) = expt.target_version_id {
            expt.target = self.targets.get_by_version_id(space_id, version_id).await?;
            if let Some(target) = &expt.target {
                expt.target_id = Some(target.id);
                expt.target_type = Some(target.eval_target_type);
            }
        }

        expt.evaluators = self
            .evaluators
            .batch_get_evaluators_by_version_ids(space_id, &expt.evaluator_version_ids())
            .await?;
        Ok(())
    }

    /// Experiments with their tuple, stats and aggregates. A component that fails to load is
    /// logged and left empty.
    #[instrument(skip_all, fields(space_id = %space_id))]
    pub async fn mget_detail(
        &self,
        space_id: i64,
        expt_ids: &[i64],
    ) -> Result<Vec<Experiment>, Error> {
        let mut expts = self.mget(space_id, expt_ids).await?;

        let stats = self
            .db
            .mget_stats(space_id, expt_ids)
            .await
            .unwrap_or_else(|e| {
                e.log_at_level("Failed to load experiment stats: ", tracing::Level::WARN);
                Vec::new()
            });
        let mut aggregates = self
            .aggr
            .batch_get_expt_aggr_result_by_experiment_ids(space_id, expt_ids)
            .await
            .unwrap_or_else(|e| {
                e.log_at_level("Failed to load experiment aggregates: ", tracing::Level::WARN);
                Default::default()
            });

        for expt in &mut expts {
            self.pack_detail(expt).await;
            expt.stats = stats.iter().find(|s| s.expt_id == expt.id).cloned();
            expt.aggregate_result = aggregates.remove(&expt.id);
        }
        Ok(expts)
    }

    async fn pack_detail(&self, expt: &mut Experiment) {
        let space_id = expt.space_id;
        match self
            .eval_sets
            .get_evaluation_set_version(space_id, expt.eval_set_version_id)
            .await
        {
            Ok(Some((version, set))) => {
                expt.eval_set_version = Some(version);
                expt.eval_set = Some(set);
            }
            Ok(None) => {}
            Err(e) => {
                e.log_at_level("Failed to load eval set of experiment: ", tracing::Level::WARN);
            }
        }

        if let Some(version_id) = expt.target_version_id {
            match self.targets.get_by_version_id(space_id, version_id).await {
                Ok(Some(mut target)) => {
                    if target.eval_target_type == EvalTargetType::LoopPrompt {
                        self.targets
                            .pack_source_info(space_id, std::slice::from_mut(&mut target))
                            .await;
                    }
                    expt.target = Some(target);
                }
                Ok(None) => {}
                Err(e) => {
                    e.log_at_level("Failed to load target of experiment: ", tracing::Level::WARN);
                }
            }
        }

        match self
            .evaluators
            .batch_get_evaluators_by_version_ids(space_id, &expt.evaluator_version_ids())
            .await
        {
            Ok(evaluators) => expt.evaluators = evaluators,
            Err(e) => {
                e.log_at_level(
                    "Failed to load evaluators of experiment: ",
                    tracing::Level::WARN,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests;
