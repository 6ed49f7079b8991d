use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum AggregatorType {
    Average,
    Sum,
    Max,
    Min,
    Count,
    Distribution,
    OptionDistribution,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum AggregateDataType {
    Double,
    ScoreDistribution,
    OptionDistribution,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ScoreDistributionItem {
    /// Score rendered with two decimals, or the tail bucket label.
    pub score: String,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ScoreDistribution {
    pub items: Vec<ScoreDistributionItem>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OptionDistributionItem {
    /// Tag value id, as a string.
    pub option: String,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct OptionDistribution {
    pub items: Vec<OptionDistributionItem>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AggregateData {
    pub data_type: AggregateDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_distribution: Option<ScoreDistribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_distribution: Option<OptionDistribution>,
}

impl AggregateData {
    pub fn double(value: f64) -> Self {
        Self {
            data_type: AggregateDataType::Double,
            value: Some(value),
            score_distribution: None,
            option_distribution: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AggregatorResult {
    pub aggregator_type: AggregatorType,
    pub data: AggregateData,
}

/// Serialized form stored in `ExptAggrResult::aggr_result`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AggregateResult {
    pub aggregator_results: Vec<AggregatorResult>,
}

impl AggregateResult {
    pub fn average(&self) -> Option<f64> {
        self.aggregator_results
            .iter()
            .find(|r| r.aggregator_type == AggregatorType::Average)
            .and_then(|r| r.data.value)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum FieldType {
    #[default]
    EvaluatorScore,
    Annotation,
}

/// One persisted aggregate row, keyed by `(expt_id, field_type, field_key)`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptAggrResult {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub field_type: FieldType,
    pub field_key: String,
    /// Denormalized mean, used for sorting experiments by score.
    pub score: f64,
    /// JSON encoded `AggregateResult`.
    pub aggr_result: String,
    pub version: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorAggregateResult {
    pub evaluator_version_id: i64,
    pub name: Option<String>,
    pub version: Option<String>,
    pub aggregator_results: Vec<AggregatorResult>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AnnotationAggregateResult {
    pub tag_key_id: i64,
    pub name: Option<String>,
    pub aggregator_results: Vec<AggregatorResult>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptAggregateResult {
    pub experiment_id: i64,
    pub evaluator_results: HashMap<i64, EvaluatorAggregateResult>,
    pub annotation_results: HashMap<i64, AnnotationAggregateResult>,
}
