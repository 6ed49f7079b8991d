use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Audio,
    MultiPart,
    /// Placeholder inside a multipart template. `text` names the input field whose parts are
    /// spliced in.
    MultiPartVariable,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum FieldDisplayFormat {
    #[default]
    PlainText,
    Markdown,
    JSON,
    Code,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Image {
    pub name: Option<String>,
    pub url: Option<String>,
    pub uri: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Content {
    pub content_type: ContentType,
    #[serde(default)]
    pub format: Option<FieldDisplayFormat>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<Image>,
    #[serde(default)]
    pub multi_part: Option<Vec<Content>>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            format: Some(FieldDisplayFormat::Markdown),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn multi_part(parts: Vec<Content>) -> Self {
        Self {
            content_type: ContentType::MultiPart,
            multi_part: Some(parts),
            ..Default::default()
        }
    }

    pub fn multi_part_variable(name: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::MultiPartVariable,
            text: Some(name.into()),
            ..Default::default()
        }
    }

    /// String form used when substituting the content into a text template.
    /// Multipart content contributes its text parts in order; media parts contribute nothing.
    pub fn to_template_string(&self) -> String {
        match self.content_type {
            ContentType::Text => self.text.clone().unwrap_or_default(),
            ContentType::MultiPart => self
                .multi_part
                .iter()
                .flatten()
                .map(Content::to_template_string)
                .collect::<Vec<_>>()
                .join(""),
            ContentType::Image | ContentType::Audio | ContentType::MultiPartVariable => {
                String::new()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum Role {
    #[default]
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub ext: HashMap<String, String>,
}

impl Message {
    pub fn new(role: Role, content: Content) -> Self {
        Self {
            role,
            content: Some(content),
            ext: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments, as a string.
    #[serde(default)]
    pub parameters: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ToolType {
    #[default]
    Function,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Tool {
    #[serde(default)]
    pub tool_type: ToolType,
    pub function: Function,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ToolCall {
    pub index: i64,
    pub id: String,
    #[serde(default)]
    pub tool_type: ToolType,
    pub function_call: Option<FunctionCall>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}
