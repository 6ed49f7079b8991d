//! In-memory engine wired to deterministic collaborators, plus a bus driver.

use std::sync::Arc;

use experiment_core::bus::InMemoryEventBus;
use experiment_core::config::{EngineConfig, SwappableConfigProvider};
use experiment_core::db::memory::{InMemoryDatabase, InMemorySharedState};
use experiment_core::db::{ExperimentQueries, ExptStatsQueries, ExptTurnResultQueries};
use experiment_core::entity::{
    AggregatorType, Content, EvaluationSet, EvaluationSetItem, EvaluationSetSchema,
    EvaluationSetVersion, Evaluator, EvaluatorType, Experiment, ExptStats, ExptTurnResult,
    ExptType, FieldData, FieldSchema, Message, ModelConfig, PromptEvaluatorVersion,
    ReadConsistency, Role, Session, TokenUsage, Turn,
};
use experiment_core::rpc::{PromptTemplateInfo, ReplyItem};
use experiment_core::test_helpers::{
    FakeEvaluationSetService, FakeEvaluatorService, FakePromptRpc, FakeTagService,
    ScriptedLlmProvider, StaticAuditService, StaticBenefitService,
};
use experiment_core::utils::id::SequentialIdGenerator;
use experiments::manager::{CreateEvalTargetParam, CreateExptParam, LifecyclePacing};
use experiments::{EngineDeps, ExptEngine, RemoteServices};

pub const SPACE_ID: i64 = 1;
pub const EVAL_SET_ID: i64 = 100;
pub const EVAL_SET_VERSION_ID: i64 = 200;
pub const PROMPT_ID: i64 = 11;
pub const EVALUATOR_VERSION_ID: i64 = 90;
pub const ITEM_COUNT: i64 = 3;
/// Token usage reported by every scripted judge reply.
pub const JUDGE_INPUT_TOKENS: i64 = 10;
pub const JUDGE_OUTPUT_TOKENS: i64 = 2;

/// Upper bound on bus rounds before a flow is considered stuck.
const MAX_ROUNDS: usize = 50;

pub struct TestEngine {
    pub engine: ExptEngine,
    pub bus: Arc<InMemoryEventBus>,
    pub db: Arc<InMemoryDatabase>,
    pub llm: Arc<ScriptedLlmProvider>,
}

pub fn session() -> Session {
    Session::new("alice")
}

pub fn item(item_id: i64) -> EvaluationSetItem {
    EvaluationSetItem {
        id: item_id,
        item_id,
        eval_set_id: EVAL_SET_ID,
        turns: vec![Turn {
            id: item_id * 10,
            field_data_list: vec![FieldData {
                key: "question".to_string(),
                name: "question".to_string(),
                content: Some(Content::text(format!("question {item_id}"))),
            }],
        }],
    }
}

fn eval_sets() -> FakeEvaluationSetService {
    let version = EvaluationSetVersion {
        id: EVAL_SET_VERSION_ID,
        version: "v1".to_string(),
        evaluation_set_schema: Some(EvaluationSetSchema {
            field_schemas: vec![FieldSchema {
                key: "question".to_string(),
                name: "question".to_string(),
                ..Default::default()
            }],
        }),
        ..Default::default()
    };
    let set = EvaluationSet {
        id: EVAL_SET_ID,
        space_id: SPACE_ID,
        name: "qa".to_string(),
        evaluation_set_version: Some(version.clone()),
        ..Default::default()
    };
    FakeEvaluationSetService::new().with_version(
        set,
        version,
        (1..=ITEM_COUNT).map(item).collect(),
    )
}

fn judge() -> Evaluator {
    Evaluator {
        id: 9,
        space_id: SPACE_ID,
        name: "correctness".to_string(),
        evaluator_type: EvaluatorType::Prompt,
        prompt_evaluator_version: Some(PromptEvaluatorVersion {
            id: EVALUATOR_VERSION_ID,
            evaluator_id: 9,
            space_id: SPACE_ID,
            version: "v1".to_string(),
            message_list: vec![
                Message::new(Role::System, Content::text("You grade answers.")),
                Message::new(
                    Role::User,
                    Content::text("Q: {{question}}\nA: {{actual_output}}"),
                ),
            ],
            model_config: Some(ModelConfig {
                model_id: 1,
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn judge_reply(score: f64) -> ReplyItem {
    ReplyItem {
        content: Some(format!(r#"{{"score": {score}, "reason": "graded"}}"#)),
        token_usage: Some(TokenUsage {
            input_tokens: JUDGE_INPUT_TOKENS,
            output_tokens: JUDGE_OUTPUT_TOKENS,
        }),
        ..Default::default()
    }
}

/// Collaborators serving the `qa` dataset, the `QA` prompt and the `correctness` judge.
pub fn remote_services(llm: Arc<ScriptedLlmProvider>) -> RemoteServices {
    RemoteServices {
        eval_sets: Arc::new(eval_sets()),
        prompts: Arc::new(FakePromptRpc::new().with_prompt(PromptTemplateInfo {
            prompt_id: PROMPT_ID,
            prompt_key: "qa".to_string(),
            version: "1.0.0".to_string(),
            name: "QA".to_string(),
            description: "answers questions".to_string(),
            variables: vec!["question".to_string()],
        })),
        llm,
        audit: Arc::new(StaticAuditService::approving()),
        benefit: Arc::new(StaticBenefitService::default()),
        tags: Arc::new(FakeTagService::default()),
        evaluators: Arc::new(FakeEvaluatorService::new(vec![judge()])),
    }
}

pub fn offline_param(name: &str) -> CreateExptParam {
    CreateExptParam {
        space_id: SPACE_ID,
        name: name.to_string(),
        eval_set_id: EVAL_SET_ID,
        eval_set_version_id: EVAL_SET_VERSION_ID,
        create_eval_target_param: Some(CreateEvalTargetParam {
            source_target_id: PROMPT_ID.to_string(),
            source_target_version: "1.0.0".to_string(),
        }),
        evaluator_version_ids: vec![EVALUATOR_VERSION_ID],
        ..Default::default()
    }
}

pub fn online_param(name: &str) -> CreateExptParam {
    CreateExptParam {
        space_id: SPACE_ID,
        name: name.to_string(),
        eval_set_id: EVAL_SET_ID,
        evaluator_version_ids: vec![EVALUATOR_VERSION_ID],
        expt_type: ExptType::Online,
        ..Default::default()
    }
}

impl TestEngine {
    pub fn in_memory() -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        let db = Arc::new(InMemoryDatabase::new());
        let shared = Arc::new(InMemorySharedState::new());
        let llm = Arc::new(ScriptedLlmProvider::new(Ok(judge_reply(1.0))));
        let remote = remote_services(llm.clone());
        let deps = EngineDeps {
            db: db.clone(),
            quota_store: shared.clone(),
            idem_store: shared.clone(),
            lock: shared,
            publisher: bus.clone(),
            config: Arc::new(SwappableConfigProvider::new(EngineConfig::default())),
            id_gen: Arc::new(SequentialIdGenerator::new(10_000)),
            remote,
        };
        Self {
            engine: ExptEngine::new_with_pacing(deps, LifecyclePacing::immediate()),
            bus,
            db,
            llm,
        }
    }

    /// Delivers the events queued right now, ignoring their delays. Returns how many ran.
    pub async fn deliver_once(&self) -> usize {
        let deliveries = self.bus.drain().await;
        for delivery in &deliveries {
            self.engine
                .consumer()
                .handle(&delivery.event)
                .await
                .unwrap();
        }
        deliveries.len()
    }

    /// Delivers events until the bus is empty.
    pub async fn drive(&self) {
        for _ in 0..MAX_ROUNDS {
            if self.deliver_once().await == 0 {
                return;
            }
        }
        panic!("bus still busy after {MAX_ROUNDS} rounds");
    }

    pub async fn create(&self, param: CreateExptParam) -> Experiment {
        self.engine
            .manager()
            .create(param, &session())
            .await
            .unwrap()
    }

    pub async fn experiment(&self, expt_id: i64) -> Experiment {
        self.db
            .get_experiment(SPACE_ID, expt_id, ReadConsistency::Primary)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn stats(&self, expt_id: i64) -> ExptStats {
        self.db.get_stats(SPACE_ID, expt_id).await.unwrap().unwrap()
    }

    pub async fn turn_results(&self, expt_id: i64) -> Vec<ExptTurnResult> {
        self.db
            .list_turn_results(SPACE_ID, expt_id, 0, 1000)
            .await
            .unwrap()
    }

    /// Mean score of the judge in the experiment's aggregate, if computed.
    pub async fn judge_average(&self, expt_id: i64) -> Option<f64> {
        let mut aggregates = self
            .engine
            .aggr()
            .batch_get_expt_aggr_result_by_experiment_ids(SPACE_ID, &[expt_id])
            .await
            .unwrap();
        aggregates
            .remove(&expt_id)?
            .evaluator_results
            .remove(&EVALUATOR_VERSION_ID)?
            .aggregator_results
            .into_iter()
            .find(|r| r.aggregator_type == AggregatorType::Average)
            .and_then(|r| r.data.value)
    }
}
