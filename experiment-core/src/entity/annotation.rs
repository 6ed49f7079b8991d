use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum TagContentType {
    #[default]
    ContinuousNumber,
    Boolean,
    Categorical,
    FreeText,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TagValue {
    pub tag_value_id: i64,
    pub tag_value_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TagInfo {
    pub tag_key_id: i64,
    pub tag_key_name: String,
    pub content_type: TagContentType,
    #[serde(default)]
    pub tag_values: Vec<TagValue>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AnnotateData {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub text_value: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AnnotateRecord {
    pub id: i64,
    pub space_id: i64,
    pub tag_key_id: i64,
    pub experiment_id: i64,
    /// Selected option for boolean and categorical tags.
    #[serde(default)]
    pub tag_value_id: Option<i64>,
    pub annotate_data: AnnotateData,
    pub created_by: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptTurnAnnotateRecordRef {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub tag_key_id: i64,
    pub annotate_record_id: i64,
}
