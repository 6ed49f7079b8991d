use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::content::{Content, ContentType, Message, TokenUsage, Tool};

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum EvaluatorType {
    #[default]
    Prompt,
    Code,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ParseType {
    #[default]
    Content,
    FunctionCall,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum EvaluatorRunStatus {
    #[default]
    Unknown,
    Success,
    Fail,
}

/// Schema of one named input or output field.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ArgsSchema {
    pub key: String,
    pub support_content_types: Vec<ContentType>,
    /// JSON Schema (as a string) applied to text content.
    #[serde(default)]
    pub json_schema: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ModelConfig {
    pub model_id: i64,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PromptEvaluatorVersion {
    pub id: i64,
    pub evaluator_id: i64,
    pub space_id: i64,
    pub version: String,
    pub message_list: Vec<Message>,
    #[serde(default)]
    pub model_config: Option<ModelConfig>,
    #[serde(default)]
    pub prompt_template_key: String,
    /// Populated by `PreHandle` from configuration.
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub prompt_suffix: String,
    #[serde(default)]
    pub parse_type: ParseType,
    #[serde(default)]
    pub input_schemas: Vec<ArgsSchema>,
    #[serde(default)]
    pub output_schemas: Vec<ArgsSchema>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Evaluator {
    pub id: i64,
    pub space_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub evaluator_type: EvaluatorType,
    #[serde(default)]
    pub prompt_evaluator_version: Option<PromptEvaluatorVersion>,
}

impl Evaluator {
    pub fn evaluator_version_id(&self) -> Option<i64> {
        self.prompt_evaluator_version.as_ref().map(|v| v.id)
    }

    pub fn version(&self) -> Option<&str> {
        self.prompt_evaluator_version
            .as_ref()
            .map(|v| v.version.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorInputData {
    #[serde(default)]
    pub history_messages: Vec<Message>,
    #[serde(default)]
    pub input_fields: HashMap<String, Content>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Correction {
    pub score: Option<f64>,
    #[serde(default)]
    pub explain: String,
    #[serde(default)]
    pub updated_by: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorResult {
    pub score: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub correction: Option<Correction>,
}

impl EvaluatorResult {
    /// A human correction overrides the model's score.
    pub fn effective_score(&self) -> Option<f64> {
        match &self.correction {
            Some(Correction {
                score: Some(score), ..
            }) => Some(*score),
            _ => self.score,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EvaluatorUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl From<TokenUsage> for EvaluatorUsage {
    fn from(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorRunError {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorOutputData {
    #[serde(default)]
    pub evaluator_result: Option<EvaluatorResult>,
    #[serde(default)]
    pub evaluator_usage: Option<EvaluatorUsage>,
    #[serde(default)]
    pub evaluator_run_error: Option<EvaluatorRunError>,
    #[serde(default)]
    pub time_consuming_ms: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorRecord {
    pub id: i64,
    pub space_id: i64,
    pub experiment_id: i64,
    pub experiment_run_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub evaluator_version_id: i64,
    pub trace_id: String,
    pub log_id: String,
    pub evaluator_input_data: EvaluatorInputData,
    pub evaluator_output_data: EvaluatorOutputData,
    pub status: EvaluatorRunStatus,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EvaluatorRecord {
    pub fn effective_score(&self) -> Option<f64> {
        self.evaluator_output_data
            .evaluator_result
            .as_ref()
            .and_then(EvaluatorResult::effective_score)
    }
}
