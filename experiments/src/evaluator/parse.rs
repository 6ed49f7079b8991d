//! Extraction of `(score, reason)` from a model reply.

use experiment_core::entity::{EvaluatorResult, Tool, ToolCall};
use experiment_core::error::{Error, ErrorDetails};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::json_repair::repair_json;

lazy_static! {
    static ref SCORE_REASON_FRAGMENT: Regex = {
        #[expect(clippy::expect_used)]
        Regex::new(
            r#"\{(?s:.*?"score"\s*:\s*(?:"([\d.]+)"|([\d.]+)).*?"reason"\s*:\s*"((?:[^"\\]|\\.)*)".*?)\}"#,
        )
        .expect("Failed to compile score/reason regex")
    };
}

/// Parses a text reply: raw JSON, then repaired JSON, then every regex-located fragment.
pub fn parse_content(content: &str) -> Result<EvaluatorResult, Error> {
    if let Some(result) = serde_json::from_str::<Value>(content)
        .ok()
        .and_then(|v| score_and_reason(&v))
    {
        return Ok(result);
    }
    if let Some(result) = serde_json::from_str::<Value>(&repair_json(content))
        .ok()
        .and_then(|v| score_and_reason(&v))
    {
        return Ok(result);
    }
    for caps in SCORE_REASON_FRAGMENT.captures_iter(content) {
        let Some(score) = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        else {
            continue;
        };
        let raw_reason = caps.get(3).map_or("", |m| m.as_str());
        // Unescape through the JSON string grammar, falling back to the raw capture.
        let reason = serde_json::from_str::<String>(&format!("\"{raw_reason}\""))
            .unwrap_or_else(|_| raw_reason.to_string());
        if !reason.is_empty() {
            return Ok(EvaluatorResult {
                score: Some(score),
                reasoning: reason,
                correction: None,
            });
        }
    }
    Err(Error::new(ErrorDetails::InvalidOutputFromModel {
        message: format!("no score and reason found in `{content}`"),
    }))
}

/// Parses the first tool call's arguments, guided by the tool's parameter schema.
pub fn parse_function_call(
    tool_calls: &[ToolCall],
    tool: Option<&Tool>,
) -> Result<EvaluatorResult, Error> {
    let Some(call) = tool_calls.first() else {
        return Err(Error::new(ErrorDetails::LlmToolCallFail {
            message: "model returned no tool calls".to_string(),
        }));
    };
    let arguments = call
        .function_call
        .as_ref()
        .and_then(|f| f.arguments.as_deref())
        .unwrap_or_default();
    let args: Value = serde_json::from_str(&repair_json(arguments)).map_err(|e| {
        Error::new(ErrorDetails::InvalidOutputFromModel {
            message: format!("tool call arguments are not JSON: {e}"),
        })
    })?;

    if let Some(schema) = tool.and_then(parameter_schema) {
        let missing: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter(|key| args.get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::new(ErrorDetails::InvalidOutputFromModel {
                message: format!("tool call arguments miss required keys {missing:?}"),
            }));
        }
    }

    let score = args.get("score").and_then(coerce_score).ok_or_else(|| {
        Error::new(ErrorDetails::InvalidOutputFromModel {
            message: format!("tool call score is not a number: `{arguments}`"),
        })
    })?;
    let reason = args.get("reason").and_then(Value::as_str).ok_or_else(|| {
        Error::new(ErrorDetails::InvalidOutputFromModel {
            message: format!("tool call reason is not a string: `{arguments}`"),
        })
    })?;
    Ok(EvaluatorResult {
        score: Some(score),
        reasoning: reason.to_string(),
        correction: None,
    })
}

fn parameter_schema(tool: &Tool) -> Option<Value> {
    if tool.function.parameters.is_empty() {
        return None;
    }
    match serde_json::from_str(&tool.function.parameters) {
        Ok(schema) => Some(schema),
        Err(e) => {
            tracing::warn!(tool = %tool.function.name, "Ignoring unparseable tool schema: {e}");
            None
        }
    }
}

fn coerce_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn score_and_reason(value: &Value) -> Option<EvaluatorResult> {
    let score = value.get("score").and_then(coerce_score)?;
    let reason = value.get("reason").and_then(Value::as_str)?;
    if reason.is_empty() {
        return None;
    }
    Some(EvaluatorResult {
        score: Some(score),
        reasoning: reason.to_string(),
        correction: None,
    })
}
