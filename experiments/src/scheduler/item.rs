//! Evaluation of one item: for every turn that has not succeeded yet, run the target, then the
//! evaluators on the target output, and record the outcome of the turn, the item and the item's
//! run log.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;

use chrono::Utc;
use experiment_core::config::ConfigProvider;
use experiment_core::db::ExptDatabase;
use experiment_core::entity::{
    BUILTIN_RUNTIME_PARAM_FIELD, ConnectorConf, Content, EvalTargetInputData,
    EvalTargetOutputData, EvalTargetRecord, EvalTargetRunError, EvalTargetRunStatus,
    EvalTargetType, EvaluationSetItem, Evaluator, EvaluatorInputData, EvaluatorOutputData,
    EvaluatorRecord, EvaluatorRunError, EvaluatorRunStatus, ExecuteEvalTargetParam, Experiment,
    ExptScheduleEvent, ExptTurnEvaluatorResultRef, ExptTurnResult, FieldAdapter, ItemRunState,
    Turn,
};
use experiment_core::error::Error;
use experiment_core::observability::METRIC_ITEM_EVAL_TOTAL;
use experiment_core::utils::id::{IdGenerator, new_log_id, new_trace_id};
use futures::stream::{self, StreamExt};
use tracing::instrument;

use crate::evaluator::{EvaluatorRegistry, EvaluatorRunOutcome, RunEvaluatorRequest};
use crate::result::ExptResultService;
use crate::target::EvalTargetService;

/// One item handed to the pipeline by a scheduler tick.
#[derive(Clone, Debug)]
pub struct ExptEvalItem {
    pub expt_id: i64,
    pub eval_set_version_id: i64,
    pub item_id: i64,
    pub state: ItemRunState,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TokenCost {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl AddAssign for TokenCost {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ItemEvalOutcome {
    pub status: ItemRunState,
    pub cost: TokenCost,
}

struct TurnOutcome {
    error: Option<String>,
    cost: TokenCost,
}

/// What the evaluators of one turn see.
#[derive(Clone, Copy)]
struct TurnContext<'a> {
    expt: &'a Experiment,
    event: &'a ExptScheduleEvent,
    turn_result: &'a ExptTurnResult,
    turn: &'a Turn,
    target_output: &'a EvalTargetOutputData,
    log_id: &'a str,
}

struct EvaluatorRunSummary {
    error: Option<String>,
    cost: TokenCost,
}

pub struct ItemEvaluator {
    db: Arc<dyn ExptDatabase>,
    results: Arc<ExptResultService>,
    targets: Arc<EvalTargetService>,
    registry: Arc<EvaluatorRegistry>,
    config: Arc<dyn ConfigProvider>,
    id_gen: Arc<dyn IdGenerator>,
}

impl ItemEvaluator {
    pub fn new(
        db: Arc<dyn ExptDatabase>,
        results: Arc<ExptResultService>,
        targets: Arc<EvalTargetService>,
        registry: Arc<EvaluatorRegistry>,
        config: Arc<dyn ConfigProvider>,
        id_gen: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            db,
            results,
            targets,
            registry,
            config,
            id_gen,
        }
    }

    /// Runs the unfinished turns of `item`. Target and evaluator failures fail the turn and are
    /// recorded; only store errors are returned.
    #[instrument(skip_all, fields(expt_id = %item.expt_id, item_id = %item.item_id, expt_run_id = %event.expt_run_id, state = %item.state))]
    pub async fn eval(
        &self,
        expt: &Experiment,
        event: &ExptScheduleEvent,
        item: &ExptEvalItem,
        data: Option<&EvaluationSetItem>,
    ) -> Result<ItemEvalOutcome, Error> {
        let log_id = new_log_id();
        let mut cost = TokenCost::default();
        let mut errors = Vec::new();

        match data {
            None => errors.push(format!(
                "item {} not found in evaluation set version {}",
                item.item_id, item.eval_set_version_id
            )),
            Some(data) => {
                let turn_results = self
                    .db
                    .get_item_turn_results(expt.space_id, expt.id, item.item_id)
                    .await?;
                for turn_result in turn_results {
                    if turn_result.status == ItemRunState::Success {
                        continue;
                    }
                    let outcome = match data.turns.iter().find(|t| t.id == turn_result.turn_id) {
                        Some(turn) => {
                            self.eval_turn(expt, event, turn_result, turn, &log_id)
                                .await?
                        }
                        None => {
                            let message = format!("turn {} not found in item", turn_result.turn_id);
                            self.finish_turn(turn_result, Some(message), TokenCost::default())
                                .await?
                        }
                    };
                    cost += outcome.cost;
                    errors.extend(outcome.error);
                }
            }
        }

        let status = if errors.is_empty() {
            ItemRunState::Success
        } else {
            ItemRunState::Fail
        };
        if let Some(mut row) = self
            .db
            .get_item_results(expt.space_id, expt.id, &[item.item_id])
            .await?
            .pop()
        {
            row.status = status;
            row.err_msg = errors.join("; ");
            row.log_id.clone_from(&log_id);
            self.db.update_item_result(&row).await?;
        }
        self.results
            .update_run_logs_status(
                expt.space_id,
                expt.id,
                event.expt_run_id,
                &[item.item_id],
                status,
            )
            .await?;

        metrics::counter!(
            METRIC_ITEM_EVAL_TOTAL,
            "space_id" => expt.space_id.to_string(),
            "status" => status.to_string(),
        )
        .increment(1);
        tracing::debug!(%status, "Evaluated item");
        Ok(ItemEvalOutcome { status, cost })
    }

    async fn eval_turn(
        &self,
        expt: &Experiment,
        event: &ExptScheduleEvent,
        mut turn_result: ExptTurnResult,
        turn: &Turn,
        log_id: &str,
    ) -> Result<TurnOutcome, Error> {
        turn_result.status = ItemRunState::Processing;
        turn_result.log_id = log_id.to_string();
        turn_result.err_msg.clear();
        self.db.update_turn_result(&turn_result).await?;

        let trace_id = new_trace_id();
        let mut cost = TokenCost::default();
        let target_output = match self
            .execute_target(expt, event, &turn_result, turn, &trace_id)
            .await?
        {
            None => EvalTargetOutputData::default(),
            Some(record) => {
                turn_result.target_result_id = record.id;
                if let Some(usage) = record.output.eval_target_usage {
                    cost += TokenCost {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    };
                }
                if record.status != EvalTargetRunStatus::Success {
                    let message = record
                        .output
                        .eval_target_run_error
                        .map_or_else(|| "target run failed".to_string(), |e| e.message);
                    return self
                        .finish_turn(turn_result, Some(format!("target: {message}")), cost)
                        .await;
                }
                record.output
            }
        };

        let concur = expt
            .eval_conf
            .connector_conf
            .evaluators_conf
            .as_ref()
            .and_then(|c| c.evaluator_concur_num)
            .unwrap_or_else(|| {
                self.config
                    .get_expt_exec_conf(expt.space_id)
                    .item_eval_conf
                    .evaluator_concur_num
            })
            .max(1);
        let ctx = TurnContext {
            expt,
            event,
            turn_result: &turn_result,
            turn,
            target_output: &target_output,
            log_id,
        };
        let pending: Vec<_> = expt
            .evaluators
            .iter()
            .map(|evaluator| self.run_evaluator(&ctx, evaluator))
            .collect();
        let runs: Vec<Result<EvaluatorRunSummary, Error>> = stream::iter(pending)
            .buffer_unordered(concur)
            .collect()
            .await;

        let mut failures = Vec::new();
        for run in runs {
            let run = run?;
            cost += run.cost;
            failures.extend(run.error);
        }
        let error = (!failures.is_empty()).then(|| failures.join("; "));
        self.finish_turn(turn_result, error, cost).await
    }

    async fn finish_turn(
        &self,
        mut turn_result: ExptTurnResult,
        error: Option<String>,
        cost: TokenCost,
    ) -> Result<TurnOutcome, Error> {
        turn_result.status = if error.is_some() {
            ItemRunState::Fail
        } else {
            ItemRunState::Success
        };
        turn_result.err_msg = error.clone().unwrap_or_default();
        self.db.update_turn_result(&turn_result).await?;
        Ok(TurnOutcome { error, cost })
    }

    /// Runs and records the target for one turn. Returns `None` when the experiment has no
    /// executable target.
    async fn execute_target(
        &self,
        expt: &Experiment,
        event: &ExptScheduleEvent,
        turn_result: &ExptTurnResult,
        turn: &Turn,
        trace_id: &str,
    ) -> Result<Option<EvalTargetRecord>, Error> {
        let Some(target) = expt
            .target
            .as_ref()
            .filter(|t| t.eval_target_type == EvalTargetType::LoopPrompt)
        else {
            return Ok(None);
        };
        let version = target.eval_target_version.as_ref();
        let input = build_target_input(&expt.eval_conf.connector_conf, turn);
        let param = ExecuteEvalTargetParam {
            target_id: target.id,
            source_target_id: target.source_target_id.clone(),
            source_target_version: version
                .map(|v| v.source_target_version.clone())
                .unwrap_or_default(),
            input: input.clone(),
            target_type: target.eval_target_type,
        };
        let (output, status) = match self.targets.execute(expt.space_id, &param).await {
            Ok(executed) => executed,
            Err(e) => (
                EvalTargetOutputData {
                    eval_target_run_error: Some(EvalTargetRunError {
                        code: e.error_code(),
                        message: e.to_string(),
                    }),
                    ..Default::default()
                },
                EvalTargetRunStatus::Fail,
            ),
        };
        let record = EvalTargetRecord {
            id: self.id_gen.gen_id()?,
            space_id: expt.space_id,
            target_id: target.id,
            target_version_id: version.map_or(0, |v| v.id),
            experiment_run_id: event.expt_run_id,
            item_id: turn_result.item_id,
            turn_id: turn_result.turn_id,
            trace_id: trace_id.to_string(),
            input,
            output,
            status,
            created_at: Some(Utc::now()),
        };
        self.db.create_target_record(&record).await?;
        Ok(Some(record))
    }

    async fn run_evaluator(
        &self,
        ctx: &TurnContext<'_>,
        evaluator: &Evaluator,
    ) -> Result<EvaluatorRunSummary, Error> {
        let TurnContext {
            expt,
            event,
            turn_result,
            turn,
            target_output,
            log_id,
        } = *ctx;
        let Some(evaluator_version_id) = evaluator.evaluator_version_id() else {
            return Ok(EvaluatorRunSummary {
                error: Some(format!("evaluator {} has no version", evaluator.id)),
                cost: TokenCost::default(),
            });
        };
        let input = build_evaluator_input(
            &expt.eval_conf.connector_conf,
            evaluator_version_id,
            turn,
            target_output,
        );
        let request = RunEvaluatorRequest {
            space_id: expt.space_id,
            user_id: event.session.user_id.clone(),
            input: input.clone(),
        };
        let outcome = match self.registry.run(evaluator, &request).await {
            Ok(outcome) => outcome,
            Err(e) => EvaluatorRunOutcome {
                output: EvaluatorOutputData {
                    evaluator_run_error: Some(EvaluatorRunError {
                        code: e.error_code(),
                        message: e.to_string(),
                    }),
                    ..Default::default()
                },
                status: EvaluatorRunStatus::Fail,
                trace_id: new_trace_id(),
            },
        };

        let (record_id, ref_id) = self.id_gen.gen_id_pair()?;
        let now = Utc::now();
        let record = EvaluatorRecord {
            id: record_id,
            space_id: expt.space_id,
            experiment_id: expt.id,
            experiment_run_id: event.expt_run_id,
            item_id: turn_result.item_id,
            turn_id: turn_result.turn_id,
            evaluator_version_id,
            trace_id: outcome.trace_id,
            log_id: log_id.to_string(),
            evaluator_input_data: input,
            evaluator_output_data: outcome.output,
            status: outcome.status,
            created_by: event.session.user_id.clone(),
            updated_by: event.session.user_id.clone(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        let turn_ref = ExptTurnEvaluatorResultRef {
            id: ref_id,
            space_id: expt.space_id,
            expt_id: expt.id,
            expt_turn_result_id: turn_result.id,
            item_id: turn_result.item_id,
            turn_id: turn_result.turn_id,
            evaluator_id: evaluator.id,
            evaluator_version_id,
            evaluator_result_id: record_id,
        };
        self.results.save_evaluator_result(&record, &turn_ref).await?;

        let output = &record.evaluator_output_data;
        let cost = output
            .evaluator_usage
            .map(|u| TokenCost {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();
        let error = match record.status {
            EvaluatorRunStatus::Success => None,
            _ => Some(format!(
                "evaluator {}: {}",
                evaluator.name,
                output
                    .evaluator_run_error
                    .as_ref()
                    .map_or("run failed", |e| e.message.as_str())
            )),
        };
        Ok(EvaluatorRunSummary { error, cost })
    }
}

fn turn_fields(turn: &Turn) -> HashMap<String, Content> {
    turn.field_data_list
        .iter()
        .filter_map(|f| f.content.clone().map(|c| (f.name.clone(), c)))
        .collect()
}

/// Copies mapped fields into `out`. A constant `value` wins over `from_field`; unresolved
/// fields are left out.
fn apply_adapter(
    adapter: &FieldAdapter,
    lookup: impl Fn(&str) -> Option<Content>,
    out: &mut HashMap<String, Content>,
) {
    for conf in &adapter.field_confs {
        let content = match &conf.value {
            Some(value) => Some(Content::text(value.clone())),
            None => lookup(&conf.from_field),
        };
        if let Some(content) = content {
            out.insert(conf.field_name.clone(), content);
        }
    }
}

/// Target input for one turn. Without a target ingress every turn field is passed through.
pub fn build_target_input(connector: &ConnectorConf, turn: &Turn) -> EvalTargetInputData {
    let mut input = EvalTargetInputData::default();
    match connector
        .target_conf
        .as_ref()
        .and_then(|c| c.ingress_conf.as_ref())
    {
        Some(ingress) => {
            apply_adapter(
                &ingress.eval_set_adapter,
                |name| turn.get_field(name).cloned(),
                &mut input.input_fields,
            );
            let runtime_param = ingress
                .custom_conf
                .iter()
                .flat_map(|c| &c.field_confs)
                .find(|c| c.field_name == BUILTIN_RUNTIME_PARAM_FIELD)
                .and_then(|c| c.value.clone());
            if let Some(raw) = runtime_param {
                input
                    .ext
                    .insert(BUILTIN_RUNTIME_PARAM_FIELD.to_string(), raw);
            }
        }
        None => input.input_fields = turn_fields(turn),
    }
    input
}

/// Evaluator input for one turn. Without an ingress for the evaluator, every turn field and
/// every target output field is passed through, target outputs winning on name clashes.
pub fn build_evaluator_input(
    connector: &ConnectorConf,
    evaluator_version_id: i64,
    turn: &Turn,
    target_output: &EvalTargetOutputData,
) -> EvaluatorInputData {
    let mut input = EvaluatorInputData::default();
    match connector
        .evaluators_conf
        .as_ref()
        .and_then(|c| c.get_evaluator_conf(evaluator_version_id))
        .and_then(|c| c.ingress_conf.as_ref())
    {
        Some(ingress) => {
            if let Some(adapter) = &ingress.eval_set_adapter {
                apply_adapter(
                    adapter,
                    |name| turn.get_field(name).cloned(),
                    &mut input.input_fields,
                );
            }
            if let Some(adapter) = &ingress.target_adapter {
                apply_adapter(
                    adapter,
                    |name| target_output.output_fields.get(name).cloned(),
                    &mut input.input_fields,
                );
            }
        }
        None => {
            input.input_fields = turn_fields(turn);
            input.input_fields.extend(
                target_output
                    .output_fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::entity::{
        ACTUAL_OUTPUT_FIELD, EvaluatorConf, EvaluatorIngressConf, EvaluatorsConf, FieldConf,
        FieldData, TargetConf, TargetIngressConf,
    };

    fn turn() -> Turn {
        Turn {
            id: 1,
            field_data_list: vec![
                FieldData {
                    key: "k1".to_string(),
                    name: "question".to_string(),
                    content: Some(Content::text("2+2?")),
                },
                FieldData {
                    key: "k2".to_string(),
                    name: "reference".to_string(),
                    content: Some(Content::text("4")),
                },
            ],
        }
    }

    fn field(field_name: &str, from_field: &str, value: Option<&str>) -> FieldConf {
        FieldConf {
            field_name: field_name.to_string(),
            from_field: from_field.to_string(),
            value: value.map(str::to_string),
        }
    }

    fn output(text: &str) -> EvalTargetOutputData {
        EvalTargetOutputData {
            output_fields: HashMap::from([(ACTUAL_OUTPUT_FIELD.to_string(), Content::text(text))]),
            ..Default::default()
        }
    }

    #[test]
    fn test_target_input_without_ingress_passes_every_field() {
        let input = build_target_input(&ConnectorConf::default(), &turn());
        assert_eq!(input.input_fields.len(), 2);
        assert_eq!(
            input.input_fields.get("question").and_then(|c| c.text.as_deref()),
            Some("2+2?")
        );
        assert!(input.ext.is_empty());
    }

    #[test]
    fn test_target_input_applies_adapter_and_runtime_param() {
        let connector = ConnectorConf {
            target_conf: Some(TargetConf {
                target_version_id: 2,
                ingress_conf: Some(TargetIngressConf {
                    eval_set_adapter: FieldAdapter {
                        field_confs: vec![
                            field("q", "question", None),
                            field("style", "", Some("terse")),
                            field("missing", "nope", None),
                        ],
                    },
                    custom_conf: Some(FieldAdapter {
                        field_confs: vec![field(
                            BUILTIN_RUNTIME_PARAM_FIELD,
                            "",
                            Some(r#"{"model_config": {"model_id": 3}}"#),
                        )],
                    }),
                }),
            }),
            evaluators_conf: None,
        };
        let input = build_target_input(&connector, &turn());
        let mut keys: Vec<&str> = input.input_fields.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["q", "style"]);
        assert_eq!(
            input.input_fields.get("style").and_then(|c| c.text.as_deref()),
            Some("terse")
        );
        assert_eq!(
            input.ext.get(BUILTIN_RUNTIME_PARAM_FIELD).map(String::as_str),
            Some(r#"{"model_config": {"model_id": 3}}"#)
        );
    }

    #[test]
    fn test_evaluator_input_defaults_to_turn_and_target_fields() {
        let input = build_evaluator_input(&ConnectorConf::default(), 50, &turn(), &output("4"));
        assert_eq!(input.input_fields.len(), 3);
        assert_eq!(
            input
                .input_fields
                .get(ACTUAL_OUTPUT_FIELD)
                .and_then(|c| c.text.as_deref()),
            Some("4")
        );
    }

    #[test]
    fn test_evaluator_input_uses_its_own_ingress() {
        let connector = ConnectorConf {
            target_conf: None,
            evaluators_conf: Some(EvaluatorsConf {
                evaluator_concur_num: None,
                evaluator_conf: vec![EvaluatorConf {
                    evaluator_version_id: 50,
                    ingress_conf: Some(EvaluatorIngressConf {
                        eval_set_adapter: Some(FieldAdapter {
                            field_confs: vec![field("input", "question", None)],
                        }),
                        target_adapter: Some(FieldAdapter {
                            field_confs: vec![field("output", ACTUAL_OUTPUT_FIELD, None)],
                        }),
                    }),
                }],
            }),
        };
        let input = build_evaluator_input(&connector, 50, &turn(), &output("4"));
        let mut keys: Vec<&str> = input.input_fields.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["input", "output"]);

        // Another evaluator version falls back to passing everything.
        let input = build_evaluator_input(&connector, 51, &turn(), &output("4"));
        assert_eq!(input.input_fields.len(), 3);
    }

    #[test]
    fn test_token_cost_accumulates() {
        let mut cost = TokenCost::default();
        cost += TokenCost {
            input_tokens: 3,
            output_tokens: 1,
        };
        cost += TokenCost {
            input_tokens: 2,
            output_tokens: 5,
        };
        assert_eq!(
            cost,
            TokenCost {
                input_tokens: 5,
                output_tokens: 6,
            }
        );
    }
}
