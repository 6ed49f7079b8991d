use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::content::{Content, Message};
use super::evaluator::ArgsSchema;

/// Name of the single output field produced by prompt targets.
pub const ACTUAL_OUTPUT_FIELD: &str = "actual_output";

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum EvalTargetType {
    #[default]
    LoopPrompt,
    /// Outputs are ingested from traces; the engine never executes these targets.
    Trace,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum EvalTargetRunStatus {
    #[default]
    Unknown,
    Success,
    Fail,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct LoopPrompt {
    pub prompt_id: i64,
    pub version: String,
    #[serde(default)]
    pub prompt_key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalTargetVersion {
    pub id: i64,
    pub space_id: i64,
    pub target_id: i64,
    pub source_target_version: String,
    pub eval_target_type: EvalTargetType,
    #[serde(default)]
    pub input_schema: Vec<ArgsSchema>,
    #[serde(default)]
    pub output_schema: Vec<ArgsSchema>,
    #[serde(default)]
    pub prompt: Option<LoopPrompt>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalTarget {
    pub id: i64,
    pub space_id: i64,
    pub source_target_id: String,
    pub eval_target_type: EvalTargetType,
    pub eval_target_version: Option<EvalTargetVersion>,
}

impl EvalTarget {
    pub fn output_schema(&self) -> &[ArgsSchema] {
        self.eval_target_version
            .as_ref()
            .map(|v| v.output_schema.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalTargetInputData {
    #[serde(default)]
    pub history_messages: Vec<Message>,
    #[serde(default)]
    pub input_fields: HashMap<String, Content>,
    #[serde(default)]
    pub ext: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EvalTargetUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalTargetRunError {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalTargetOutputData {
    #[serde(default)]
    pub output_fields: HashMap<String, Content>,
    #[serde(default)]
    pub eval_target_usage: Option<EvalTargetUsage>,
    #[serde(default)]
    pub eval_target_run_error: Option<EvalTargetRunError>,
    #[serde(default)]
    pub time_consuming_ms: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecuteEvalTargetParam {
    pub target_id: i64,
    pub source_target_id: String,
    pub source_target_version: String,
    pub input: EvalTargetInputData,
    pub target_type: EvalTargetType,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalTargetRecord {
    pub id: i64,
    pub space_id: i64,
    pub target_id: i64,
    pub target_version_id: i64,
    pub experiment_run_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub trace_id: String,
    pub input: EvalTargetInputData,
    pub output: EvalTargetOutputData,
    pub status: EvalTargetRunStatus,
    pub created_at: Option<DateTime<Utc>>,
}
