use std::sync::Arc;
use std::time::Duration;

use experiment_core::bus::{InMemoryEventBus, PublishedEvent};
use experiment_core::config::{EngineConfig, SwappableConfigProvider};
use experiment_core::db::memory::{InMemoryDatabase, InMemorySharedState};
use experiment_core::db::{
    DistributedLock, ExperimentQueries, ExptItemResultQueries, ExptRunLogQueries,
};
use experiment_core::entity::{
    CalculateMode, Content, CreditCost, EvaluationSet, EvaluationSetItem, EvaluationSetSchema,
    EvaluationSetVersion, Evaluator, EvaluatorType, ExptRunMode, ExptStatus, ExptType, FieldData,
    FieldSchema, Message, ModelConfig, PromptEvaluatorVersion, ReadConsistency, Role,
    RunLogStatus, Session, Turn,
};
use experiment_core::error::ErrorDetails;
use experiment_core::rpc::{
    AuditService, BenefitService, CheckBenefitResult, DenyReason, MockBenefitService,
    PromptTemplateInfo,
};
use experiment_core::test_helpers::{
    FakeEvaluationSetService, FakeEvaluatorService, FakePromptRpc, FakeTagService,
    ScriptedLlmProvider, StaticAuditService, StaticBenefitService,
};
use experiment_core::utils::id::SequentialIdGenerator;

use super::*;
use crate::{EngineDeps, ExptEngine, RemoteServices};

const SPACE_ID: i64 = 1;
const EVAL_SET_ID: i64 = 100;
const EVAL_SET_VERSION_ID: i64 = 200;
const EVALUATOR_VERSION_ID: i64 = 90;

struct Harness {
    engine: ExptEngine,
    bus: Arc<InMemoryEventBus>,
    db: Arc<InMemoryDatabase>,
    shared: Arc<InMemorySharedState>,
}

struct HarnessOptions {
    audit: Arc<dyn AuditService>,
    benefit: Arc<dyn BenefitService>,
    concur_limit: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            audit: Arc::new(StaticAuditService::approving()),
            benefit: Arc::new(StaticBenefitService::default()),
            concur_limit: 10,
        }
    }
}

fn item(item_id: i64) -> EvaluationSetItem {
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
    FakeEvaluationSetService::new().with_version(set, version, (1..=3).map(item).collect())
}

fn evaluator() -> Evaluator {
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
            message_list: vec![Message::new(
                Role::User,
                Content::text("Q: {{question}}\nA: {{actual_output}}"),
            )],
            model_config: Some(ModelConfig {
                model_id: 1,
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn harness_with(options: HarnessOptions) -> Harness {
    let bus = Arc::new(InMemoryEventBus::new());
    let db = Arc::new(InMemoryDatabase::new());
    let shared = Arc::new(InMemorySharedState::new());
    let mut config = EngineConfig::default();
    config.expt_exec_conf.default.space_expt_concur_limit = options.concur_limit;
    let remote = RemoteServices {
        eval_sets: Arc::new(eval_sets()),
        prompts: Arc::new(FakePromptRpc::new().with_prompt(PromptTemplateInfo {
            prompt_id: 11,
            prompt_key: "qa".to_string(),
            version: "1.0.0".to_string(),
            name: "QA".to_string(),
            description: String::new(),
            variables: vec!["question".to_string()],
        })),
        llm: Arc::new(ScriptedLlmProvider::with_content(
            r#"{"score": 1, "reason": "ok"}"#,
        )),
        audit: options.audit,
        benefit: options.benefit,
        tags: Arc::new(FakeTagService::default()),
        evaluators: Arc::new(FakeEvaluatorService::new(vec![evaluator()])),
    };
    let deps = EngineDeps {
        db: db.clone(),
        quota_store: shared.clone(),
        idem_store: shared.clone(),
        lock: shared.clone(),
        publisher: bus.clone(),
        config: Arc::new(SwappableConfigProvider::new(config)),
        id_gen: Arc::new(SequentialIdGenerator::new(1000)),
        remote,
    };
    Harness {
        engine: ExptEngine::new_with_pacing(deps, LifecyclePacing::immediate()),
        bus,
        db,
        shared,
    }
}

fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

fn offline_param(name: &str) -> CreateExptParam {
    CreateExptParam {
        space_id: SPACE_ID,
        name: name.to_string(),
        eval_set_id: EVAL_SET_ID,
        eval_set_version_id: EVAL_SET_VERSION_ID,
        create_eval_target_param: Some(CreateEvalTargetParam {
            source_target_id: "11".to_string(),
            source_target_version: "1.0.0".to_string(),
        }),
        evaluator_version_ids: vec![EVALUATOR_VERSION_ID],
        ..Default::default()
    }
}

fn online_param(name: &str) -> CreateExptParam {
    CreateExptParam {
        space_id: SPACE_ID,
        name: name.to_string(),
        eval_set_id: EVAL_SET_ID,
        evaluator_version_ids: vec![EVALUATOR_VERSION_ID],
        expt_type: ExptType::Online,
        ..Default::default()
    }
}

fn session() -> Session {
    Session::new("alice")
}

async fn stored(h: &Harness, expt_id: i64) -> Experiment {
    h.db.get_experiment(SPACE_ID, expt_id, ReadConsistency::Primary)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_create_packs_target_and_rejects_duplicate_names() {
    let h = harness();
    let manager = h.engine.manager();
    let expt = manager.create(offline_param("e1"), &session()).await.unwrap();

    assert_eq!(expt.status, ExptStatus::Pending);
    assert!(expt.target_id.is_some());
    assert_eq!(expt.evaluator_version_ids(), vec![EVALUATOR_VERSION_ID]);
    assert_eq!(stored(&h, expt.id).await.name, "e1");
    assert!(!manager.check_name(SPACE_ID, "e1").await.unwrap());

    let err = manager
        .create(offline_param("e1"), &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentNameExisted { .. }
    ));
}

#[tokio::test]
async fn test_create_fails_validation_for_unknown_evaluator() {
    let h = harness();
    let mut param = offline_param("e1");
    param.evaluator_version_ids = vec![404];
    let err = h
        .engine
        .manager()
        .create(param, &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentValidateFail { .. }
    ));
}

#[tokio::test]
async fn test_audit_rejection_blocks_create_but_outage_does_not() {
    let h = harness_with(HarnessOptions {
        audit: Arc::new(StaticAuditService::rejecting()),
        ..Default::default()
    });
    let err = h
        .engine
        .manager()
        .create(offline_param("e1"), &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::RiskContentDetected { .. }
    ));

    let h = harness_with(HarnessOptions {
        audit: Arc::new(StaticAuditService::unavailable()),
        ..Default::default()
    });
    h.engine
        .manager()
        .create(offline_param("e1"), &session())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_run_publishes_delayed_submit_and_holds_mutex() {
    let h = harness();
    let manager = h.engine.manager();
    let expt = manager.create(offline_param("e1"), &session()).await.unwrap();
    let run_id = manager.run(SPACE_ID, expt.id, &session()).await.unwrap();

    let deliveries = h.bus.drain().await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].delay, Some(Duration::from_secs(3)));
    let PublishedEvent::Schedule(event) = &deliveries[0].event else {
        panic!("expected a schedule event, got {:?}", deliveries[0].event);
    };
    assert_eq!(event.expt_run_id, run_id);
    assert_eq!(event.expt_run_mode, ExptRunMode::Submit);
    assert_eq!(stored(&h, expt.id).await.latest_run_id, run_id);

    let run_log = h
        .db
        .get_run_log(SPACE_ID, expt.id, run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run_log.status, RunLogStatus::Pending);

    let err = manager
        .log_run(SPACE_ID, expt.id, run_id + 1, ExptRunMode::Submit, &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentRunningExisted { .. }
    ));
}

#[tokio::test]
async fn test_quota_denial_releases_mutex() {
    let h = harness_with(HarnessOptions {
        concur_limit: 1,
        ..Default::default()
    });
    let manager = h.engine.manager();
    let first = manager.create(offline_param("e1"), &session()).await.unwrap();
    let second = manager.create(offline_param("e2"), &session()).await.unwrap();
    manager.run(SPACE_ID, first.id, &session()).await.unwrap();

    let err = manager
        .run(SPACE_ID, second.id, &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentRunningCountLimit { limit: 1 }
    ));
    assert!(
        h.shared
            .try_lock(&expt_lock_key(second.id), "probe", Duration::from_secs(5))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_benefit_denial_and_free_runs() {
    let h = harness_with(HarnessOptions {
        benefit: Arc::new(StaticBenefitService::new(CheckBenefitResult {
            deny_reason: Some(DenyReason::InsufficientBalance),
            is_free: None,
        })),
        ..Default::default()
    });
    let manager = h.engine.manager();
    let expt = manager.create(offline_param("e1"), &session()).await.unwrap();
    let err = manager.run(SPACE_ID, expt.id, &session()).await.unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::BenefitDenied { .. }
    ));
    assert!(h.bus.drain().await.is_empty());

    let h = harness_with(HarnessOptions {
        benefit: Arc::new(StaticBenefitService::new(CheckBenefitResult {
            deny_reason: None,
            is_free: Some(true),
        })),
        ..Default::default()
    });
    let manager = h.engine.manager();
    let expt = manager.create(offline_param("e1"), &session()).await.unwrap();
    manager.run(SPACE_ID, expt.id, &session()).await.unwrap();
    assert_eq!(stored(&h, expt.id).await.credit_cost, CreditCost::Free);
}

#[tokio::test]
async fn test_online_run_skips_benefit() {
    let mut benefit = MockBenefitService::new();
    benefit.expect_check_and_deduct_eval_benefit().never();
    let h = harness_with(HarnessOptions {
        benefit: Arc::new(benefit),
        ..Default::default()
    });
    let manager = h.engine.manager();
    let expt = manager.create(online_param("o1"), &session()).await.unwrap();
    manager.run(SPACE_ID, expt.id, &session()).await.unwrap();

    let deliveries = h.bus.drain().await;
    let PublishedEvent::Schedule(event) = &deliveries[0].event else {
        panic!("expected a schedule event, got {:?}", deliveries[0].event);
    };
    assert_eq!(event.expt_run_mode, ExptRunMode::Append);
}

#[tokio::test]
async fn test_complete_run_is_idempotent() {
    let h = harness();
    let manager = h.engine.manager();
    let expt = manager.create(offline_param("e1"), &session()).await.unwrap();
    let run_id = manager.run(SPACE_ID, expt.id, &session()).await.unwrap();

    manager.complete_run(SPACE_ID, expt.id, run_id).await.unwrap();
    let mut run_log = h
        .db
        .get_run_log(SPACE_ID, expt.id, run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run_log.status, RunLogStatus::Success);
    assert!(
        h.shared
            .try_lock(&expt_lock_key(expt.id), "probe", Duration::from_secs(5))
            .await
            .unwrap()
    );
    h.shared.unlock(&expt_lock_key(expt.id)).await.unwrap();

    run_log.status = RunLogStatus::Failed;
    h.db.update_run_log(&run_log).await.unwrap();
    manager.complete_run(SPACE_ID, expt.id, run_id).await.unwrap();
    let run_log = h
        .db
        .get_run_log(SPACE_ID, expt.id, run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run_log.status, RunLogStatus::Failed);
}

#[tokio::test]
async fn test_kill() {
    let h = harness();
    let manager = h.engine.manager();

    let never_ran = manager.create(offline_param("e1"), &session()).await.unwrap();
    manager
        .kill(SPACE_ID, never_ran.id, "not needed", &session())
        .await
        .unwrap();
    let killed = stored(&h, never_ran.id).await;
    assert_eq!(killed.status, ExptStatus::Terminated);
    assert_eq!(killed.status_message, "not needed");
    assert!(h.bus.drain().await.is_empty());

    let running = manager.create(offline_param("e2"), &session()).await.unwrap();
    manager.run(SPACE_ID, running.id, &session()).await.unwrap();
    h.bus.drain().await;
    manager
        .kill(SPACE_ID, running.id, "stop", &session())
        .await
        .unwrap();
    let killed = stored(&h, running.id).await;
    assert_eq!(killed.status, ExptStatus::Terminated);
    assert!(killed.end_at.is_some());
    let deliveries = h.bus.drain().await;
    assert!(deliveries.iter().any(|d| matches!(
        &d.event,
        PublishedEvent::AggrCalculate(e) if e.calculate_mode == CalculateMode::CreateAllFields
    )));

    let err = manager
        .kill(SPACE_ID, running.id, "again", &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentStatusNotAllowed { .. }
    ));
}

#[tokio::test]
async fn test_finish_drains_once() {
    let h = harness();
    let manager = h.engine.manager();
    let expt = manager.create(online_param("o1"), &session()).await.unwrap();

    let err = manager.finish(SPACE_ID, expt.id, &session()).await.unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentStatusNotAllowed { .. }
    ));

    manager.run(SPACE_ID, expt.id, &session()).await.unwrap();
    h.bus.drain().await;
    manager.finish(SPACE_ID, expt.id, &session()).await.unwrap();
    manager.finish(SPACE_ID, expt.id, &session()).await.unwrap();

    assert_eq!(stored(&h, expt.id).await.status, ExptStatus::Draining);
    let deliveries = h.bus.drain().await;
    assert_eq!(deliveries.len(), 1);
    let PublishedEvent::Schedule(event) = &deliveries[0].event else {
        panic!("expected a schedule event, got {:?}", deliveries[0].event);
    };
    assert!(event.is_finish());
    assert_eq!(event.expt_run_mode, ExptRunMode::Append);
}

#[tokio::test]
async fn test_invoke_skips_known_items_and_appends_indexes() {
    let h = harness();
    let manager = h.engine.manager();
    let expt = manager.create(online_param("o1"), &session()).await.unwrap();

    let err = manager
        .invoke(SPACE_ID, expt.id, &[item(1)], &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentStatusNotAllowed { .. }
    ));

    manager.run(SPACE_ID, expt.id, &session()).await.unwrap();
    h.bus.drain().await;
    let added = manager
        .invoke(SPACE_ID, expt.id, &[item(1), item(2), item(2)], &session())
        .await
        .unwrap();
    assert_eq!(added, 2);
    let added = manager
        .invoke(SPACE_ID, expt.id, &[item(2), item(3)], &session())
        .await
        .unwrap();
    assert_eq!(added, 1);

    let mut results = h
        .db
        .get_item_results(SPACE_ID, expt.id, &[1, 2, 3])
        .await
        .unwrap();
    results.sort_by_key(|r| r.item_id);
    let indexes: Vec<(i64, i64)> = results.iter().map(|r| (r.item_id, r.item_idx)).collect();
    assert_eq!(indexes, vec![(1, 0), (2, 1), (3, 2)]);

    let deliveries = h.bus.drain().await;
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.delay.is_none()));
}

#[tokio::test]
async fn test_mget_detail_joins_components() {
    let h = harness();
    let manager = h.engine.manager();
    let expt = manager.create(offline_param("e1"), &session()).await.unwrap();

    let details = manager.mget_detail(SPACE_ID, &[expt.id]).await.unwrap();
    assert_eq!(details.len(), 1);
    let detail = &details[0];
    assert!(detail.stats.is_some());
    assert_eq!(detail.eval_set.as_ref().map(|s| s.id), Some(EVAL_SET_ID));
    assert_eq!(detail.evaluators.len(), 1);
    let prompt_name = detail
        .target
        .as_ref()
        .and_then(|t| t.eval_target_version.as_ref())
        .and_then(|v| v.prompt.as_ref())
        .map(|p| p.name.clone());
    assert_eq!(prompt_name.as_deref(), Some("QA"));
}

#[tokio::test]
async fn test_clone_update_and_delete() {
    let h = harness();
    let manager = h.engine.manager();
    let source = manager.create(offline_param("e1"), &session()).await.unwrap();
    let copy = manager
        .clone_expt(SPACE_ID, source.id, &session())
        .await
        .unwrap();
    assert_eq!(copy.name, "e1_copy");
    assert_eq!(copy.target_version_id, source.target_version_id);

    let err = manager
        .update(SPACE_ID, copy.id, Some("e1".to_string()), None, &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err.get_details(),
        ErrorDetails::ExperimentNameExisted { .. }
    ));

    manager.delete(SPACE_ID, source.id).await.unwrap();
    assert!(manager.check_name(SPACE_ID, "e1").await.unwrap());
    manager
        .update(SPACE_ID, copy.id, Some("e1".to_string()), None, &session())
        .await
        .unwrap();
    assert_eq!(stored(&h, copy.id).await.name, "e1");
}
