use serde::{Deserialize, Serialize};

use super::content::{Content, ContentType};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldSchema {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub text_schema: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluationSetSchema {
    pub field_schemas: Vec<FieldSchema>,
}

impl EvaluationSetSchema {
    pub fn has_field(&self, name: &str) -> bool {
        self.field_schemas.iter().any(|f| f.name == name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluationSetVersion {
    pub id: i64,
    pub eval_set_id: i64,
    pub version: String,
    pub item_count: i64,
    #[serde(default)]
    pub evaluation_set_schema: Option<EvaluationSetSchema>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluationSet {
    pub id: i64,
    pub space_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Draft (latest editable) version of the set; online experiments write into it.
    #[serde(default)]
    pub evaluation_set_version: Option<EvaluationSetVersion>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldData {
    pub key: String,
    pub name: String,
    pub content: Option<Content>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Turn {
    pub id: i64,
    pub field_data_list: Vec<FieldData>,
}

impl Turn {
    pub fn get_field(&self, name: &str) -> Option<&Content> {
        self.field_data_list
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.content.as_ref())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluationSetItem {
    /// Row id of this item within the version.
    pub id: i64,
    /// Stable id across versions; this is what experiments key results on.
    pub item_id: i64,
    pub eval_set_id: i64,
    pub turns: Vec<Turn>,
}

#[derive(Clone, Debug, Default)]
pub struct ListEvaluationSetItemsParam {
    pub space_id: i64,
    pub eval_set_id: i64,
    pub version_id: i64,
    pub page_token: Option<String>,
    pub page_size: usize,
}

#[derive(Clone, Debug, Default)]
pub struct EvaluationSetItemPage {
    pub items: Vec<EvaluationSetItem>,
    pub total: i64,
    pub next_page_token: Option<String>,
}
