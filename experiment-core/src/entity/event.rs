use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::Display;

use super::aggregate::FieldType;
use super::evaluator::Correction;
use super::run::ExptRunMode;

/// Ext key set on the `Append` event published by `Finish`.
pub const EXT_KEY_FINISH: &str = "finish";

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Session {
    pub user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptScheduleEvent {
    pub space_id: i64,
    pub expt_id: i64,
    pub expt_run_id: i64,
    pub expt_run_mode: ExptRunMode,
    pub session: Session,
    #[serde(default)]
    pub ext: HashMap<String, String>,
    /// Unix seconds at which the run was requested.
    pub created_at: i64,
}

impl ExptScheduleEvent {
    pub fn is_finish(&self) -> bool {
        self.ext.get(EXT_KEY_FINISH).is_some_and(|v| v == "true")
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum CalculateMode {
    #[default]
    CreateAllFields,
    UpdateSpecificField,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SpecificField {
    pub field_type: FieldType,
    pub field_key: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptAggrCalculateEvent {
    pub space_id: i64,
    pub expt_id: i64,
    pub calculate_mode: CalculateMode,
    #[serde(default)]
    pub specific_field: Option<SpecificField>,
    pub create_time: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorRecordCorrectionEvent {
    pub space_id: i64,
    pub evaluator_record_id: i64,
    pub evaluator_version_id: i64,
    pub experiment_id: i64,
    pub correction: Correction,
    pub updated_by: String,
}
