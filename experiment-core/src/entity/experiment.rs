use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::aggregate::ExptAggregateResult;
use super::dataset::{EvaluationSet, EvaluationSetVersion};
use super::evaluator::Evaluator;
use super::run::ExptStats;
use super::target::{EvalTarget, EvalTargetType};

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ExptStatus {
    #[default]
    Unknown,
    Pending,
    Processing,
    Success,
    Failed,
    Terminated,
    SystemTerminated,
    Draining,
}

impl ExptStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ExptStatus::Success
                | ExptStatus::Failed
                | ExptStatus::Terminated
                | ExptStatus::SystemTerminated
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, ExptStatus::Processing | ExptStatus::Draining)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ExptType {
    #[default]
    Offline,
    Online,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum SourceType {
    #[default]
    Evaluation,
    AutoTask,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum CreditCost {
    #[default]
    Normal,
    Free,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct EvaluatorVersionRef {
    pub evaluator_id: i64,
    pub evaluator_version_id: i64,
}

/// Maps a field the consumer expects (`field_name`) to where its value comes from.
/// `value` is a constant that wins over `from_field` when present.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldConf {
    pub field_name: String,
    pub from_field: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldAdapter {
    pub field_confs: Vec<FieldConf>,
}

/// Field name inside `TargetIngressConf::custom_conf` carrying runtime parameter JSON.
pub const BUILTIN_RUNTIME_PARAM_FIELD: &str = "builtin_runtime_param";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TargetIngressConf {
    pub eval_set_adapter: FieldAdapter,
    #[serde(default)]
    pub custom_conf: Option<FieldAdapter>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TargetConf {
    pub target_version_id: i64,
    #[serde(default)]
    pub ingress_conf: Option<TargetIngressConf>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorIngressConf {
    #[serde(default)]
    pub eval_set_adapter: Option<FieldAdapter>,
    #[serde(default)]
    pub target_adapter: Option<FieldAdapter>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorConf {
    pub evaluator_version_id: i64,
    #[serde(default)]
    pub ingress_conf: Option<EvaluatorIngressConf>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorsConf {
    #[serde(default)]
    pub evaluator_concur_num: Option<usize>,
    pub evaluator_conf: Vec<EvaluatorConf>,
}

impl EvaluatorsConf {
    pub fn get_evaluator_conf(&self, evaluator_version_id: i64) -> Option<&EvaluatorConf> {
        self.evaluator_conf
            .iter()
            .find(|conf| conf.evaluator_version_id == evaluator_version_id)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ConnectorConf {
    #[serde(default)]
    pub target_conf: Option<TargetConf>,
    #[serde(default)]
    pub evaluators_conf: Option<EvaluatorsConf>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptEvalConf {
    pub connector_conf: ConnectorConf,
    #[serde(default)]
    pub item_concur_num: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Experiment {
    pub id: i64,
    pub space_id: i64,
    pub name: String,
    pub description: String,
    pub eval_set_id: i64,
    pub eval_set_version_id: i64,
    pub target_id: Option<i64>,
    pub target_version_id: Option<i64>,
    pub target_type: Option<EvalTargetType>,
    pub evaluator_version_refs: Vec<EvaluatorVersionRef>,
    pub eval_conf: ExptEvalConf,
    pub expt_type: ExptType,
    pub source_type: SourceType,
    pub source_id: String,
    pub status: ExptStatus,
    pub status_message: String,
    pub latest_run_id: i64,
    pub credit_cost: CreditCost,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    /// Milliseconds the experiment may stay running before the scheduler kills it.
    /// 0 disables the check.
    pub max_alive_time: i64,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted: bool,

    // Joined on read by `MGetDetail`; never persisted.
    #[serde(skip)]
    pub eval_set: Option<EvaluationSet>,
    #[serde(skip)]
    pub eval_set_version: Option<EvaluationSetVersion>,
    #[serde(skip)]
    pub target: Option<EvalTarget>,
    #[serde(skip)]
    pub evaluators: Vec<Evaluator>,
    #[serde(skip)]
    pub stats: Option<ExptStats>,
    #[serde(skip)]
    pub aggregate_result: Option<ExptAggregateResult>,
}

impl Experiment {
    pub fn evaluator_version_ids(&self) -> Vec<i64> {
        self.evaluator_version_refs
            .iter()
            .map(|r| r.evaluator_version_id)
            .collect()
    }

    pub fn is_online(&self) -> bool {
        self.expt_type == ExptType::Online
    }
}

/// Partial update of an experiment. `None` leaves the column untouched.
#[derive(Clone, Debug, Default)]
pub struct ExperimentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ExptStatus>,
    pub status_message: Option<String>,
    pub latest_run_id: Option<i64>,
    pub credit_cost: Option<CreditCost>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ExptListFilter {
    pub fuzzy_name: Option<String>,
    pub statuses: Vec<ExptStatus>,
    pub expt_type: Option<ExptType>,
    pub eval_set_ids: Vec<i64>,
    pub created_by: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub page_num: usize,
    pub page_size: usize,
}

impl Page {
    pub fn new(page_num: usize, page_size: usize) -> Self {
        Self {
            page_num: page_num.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page_num - 1) * self.page_size
    }
}

/// Where a read goes. Reads within the latest-write window of an experiment use `Primary`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReadConsistency {
    #[default]
    Replica,
    Primary,
}
