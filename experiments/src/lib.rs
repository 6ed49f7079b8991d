//! Evaluation experiment engine.
//!
//! `ExptEngine` wires the services of this crate over the stores and collaborators of
//! `experiment_core`. Processes build it once, either directly with `ExptEngine::new` or
//! through the process-wide `init_global`, then feed bus deliveries to `ExptEngine::consumer`.

use std::sync::Arc;

use experiment_core::bus::ExptEventPublisher;
use experiment_core::config::ConfigProvider;
use experiment_core::db::memory::{InMemoryDatabase, InMemorySharedState};
use experiment_core::db::{DistributedLock, ExptDatabase, IdempotentQueries, QuotaQueries};
use experiment_core::rpc::{
    AuditService, BenefitService, EvaluationSetService, EvaluatorService, LlmProvider, PromptRpc,
    TagService,
};
use experiment_core::utils::id::IdGenerator;
use once_cell::sync::OnceCell;

use crate::aggregation::ExptAggrResultService;
use crate::consumer::ExptEventConsumer;
use crate::evaluator::{EvaluatorRegistry, PromptEvaluatorService};
use crate::idem::IdempotentService;
use crate::manager::{ExptManager, ExptManagerDeps, LifecyclePacing};
use crate::quota::QuotaService;
use crate::result::ExptResultService;
use crate::scheduler::{ExptSchedulerDeps, ExptSchedulerService, ItemEvaluator};
use crate::target::EvalTargetService;

pub mod aggregation;
pub mod consumer;
pub mod evaluator;
pub mod idem;
pub mod manager;
pub mod quota;
pub mod result;
pub mod scheduler;
pub mod target;

/// Services owned by other systems that the engine calls into.
#[derive(Clone)]
pub struct RemoteServices {
    pub eval_sets: Arc<dyn EvaluationSetService>,
    pub prompts: Arc<dyn PromptRpc>,
    pub llm: Arc<dyn LlmProvider>,
    pub audit: Arc<dyn AuditService>,
    pub benefit: Arc<dyn BenefitService>,
    pub tags: Arc<dyn TagService>,
    pub evaluators: Arc<dyn EvaluatorService>,
}

/// Everything `ExptEngine` is built from.
#[derive(Clone)]
pub struct EngineDeps {
    pub db: Arc<dyn ExptDatabase>,
    pub quota_store: Arc<dyn QuotaQueries>,
    pub idem_store: Arc<dyn IdempotentQueries>,
    pub lock: Arc<dyn DistributedLock>,
    pub publisher: Arc<dyn ExptEventPublisher>,
    pub config: Arc<dyn ConfigProvider>,
    pub id_gen: Arc<dyn IdGenerator>,
    pub remote: RemoteServices,
}

impl EngineDeps {
    /// Single-process deployment: results and shared state both live in memory.
    pub fn in_memory(
        publisher: Arc<dyn ExptEventPublisher>,
        config: Arc<dyn ConfigProvider>,
        id_gen: Arc<dyn IdGenerator>,
        remote: RemoteServices,
    ) -> Self {
        let shared_state = Arc::new(InMemorySharedState::new());
        Self {
            db: Arc::new(InMemoryDatabase::new()),
            quota_store: shared_state.clone(),
            idem_store: shared_state.clone(),
            lock: shared_state,
            publisher,
            config,
            id_gen,
            remote,
        }
    }
}

pub struct ExptEngine {
    manager: Arc<ExptManager>,
    scheduler: Arc<ExptSchedulerService>,
    results: Arc<ExptResultService>,
    aggr: Arc<ExptAggrResultService>,
    targets: Arc<EvalTargetService>,
    quota: Arc<QuotaService>,
    idem: Arc<IdempotentService>,
    consumer: ExptEventConsumer,
}

impl ExptEngine {
    pub fn new(deps: EngineDeps) -> Self {
        Self::new_with_pacing(deps, LifecyclePacing::default())
    }

    pub fn new_with_pacing(deps: EngineDeps, pacing: LifecyclePacing) -> Self {
        let EngineDeps {
            db,
            quota_store,
            idem_store,
            lock,
            publisher,
            config,
            id_gen,
            remote,
        } = deps;

        let quota = Arc::new(QuotaService::new(quota_store, config.clone()));
        let idem = Arc::new(IdempotentService::new(idem_store));
        let results = Arc::new(ExptResultService::new(db.clone(), publisher.clone()));
        let aggr = Arc::new(ExptAggrResultService::new(
            db.clone(),
            remote.evaluators.clone(),
            remote.tags.clone(),
            id_gen.clone(),
        ));
        let targets = Arc::new(EvalTargetService::new(
            remote.prompts.clone(),
            db.clone(),
            id_gen.clone(),
        ));
        let registry = Arc::new(EvaluatorRegistry::new().with_service(Arc::new(
            PromptEvaluatorService::new(remote.llm.clone(), config.clone()),
        )));

        let manager = Arc::new(
            ExptManager::new(ExptManagerDeps {
                db: db.clone(),
                lock,
                idem: idem.clone(),
                quota: quota.clone(),
                results: results.clone(),
                aggr: aggr.clone(),
                targets: targets.clone(),
                eval_sets: remote.eval_sets.clone(),
                evaluators: remote.evaluators.clone(),
                audit: remote.audit.clone(),
                benefit: remote.benefit.clone(),
                publisher: publisher.clone(),
                config: config.clone(),
                id_gen: id_gen.clone(),
            })
            .with_pacing(pacing),
        );
        let item_evaluator = Arc::new(ItemEvaluator::new(
            db.clone(),
            results.clone(),
            targets.clone(),
            registry,
            config.clone(),
            id_gen.clone(),
        ));
        let scheduler = Arc::new(ExptSchedulerService::new(ExptSchedulerDeps {
            db,
            manager: manager.clone(),
            results: results.clone(),
            idem: idem.clone(),
            eval_sets: remote.eval_sets,
            publisher,
            config,
            id_gen,
            item_evaluator,
        }));
        let consumer = ExptEventConsumer::new(scheduler.clone(), aggr.clone());

        Self {
            manager,
            scheduler,
            results,
            aggr,
            targets,
            quota,
            idem,
            consumer,
        }
    }

    pub fn manager(&self) -> &Arc<ExptManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<ExptSchedulerService> {
        &self.scheduler
    }

    pub fn results(&self) -> &Arc<ExptResultService> {
        &self.results
    }

    pub fn aggr(&self) -> &Arc<ExptAggrResultService> {
        &self.aggr
    }

    pub fn targets(&self) -> &Arc<EvalTargetService> {
        &self.targets
    }

    pub fn quota(&self) -> &Arc<QuotaService> {
        &self.quota
    }

    pub fn idem(&self) -> &Arc<IdempotentService> {
        &self.idem
    }

    pub fn consumer(&self) -> &ExptEventConsumer {
        &self.consumer
    }
}

static GLOBAL_ENGINE: OnceCell<ExptEngine> = OnceCell::new();

/// Builds the process-wide engine on first call. Later calls return the same engine and
/// drop their `deps`, so concurrent callers all observe one instance.
pub fn init_global(deps: EngineDeps) -> &'static ExptEngine {
    let mut built = false;
    let engine = GLOBAL_ENGINE.get_or_init(|| {
        built = true;
        ExptEngine::new(deps)
    });
    if built {
        tracing::info!("Experiment engine initialized");
    } else {
        tracing::debug!("Experiment engine already initialized; ignoring new dependencies");
    }
    engine
}

pub fn global() -> Option<&'static ExptEngine> {
    GLOBAL_ENGINE.get()
}
