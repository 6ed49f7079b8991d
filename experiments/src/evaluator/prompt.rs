use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use experiment_core::config::{ConfigProvider, DEFAULT_MAPPING_KEY};
use experiment_core::entity::{
    ArgsSchema, Content, ContentType, Evaluator, EvaluatorResult, EvaluatorRunError,
    EvaluatorRunStatus, EvaluatorType, EvaluatorUsage, ParseType, ToolChoice,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::observability::{METRIC_EVALUATOR_RUN_LATENCY, METRIC_EVALUATOR_RUN_TOTAL};
use experiment_core::rpc::{LlmCallParam, LlmProvider, Scenario};
use experiment_core::utils::id::new_trace_id;
use serde_json::Value;
use tracing::Instrument;
use tracing::field::Empty;

use super::parse::{parse_content, parse_function_call};
use super::render::render_messages;
use super::{EvaluatorRunOutcome, EvaluatorSourceService, RunEvaluatorRequest};

/// LLM-as-judge evaluator driven by a prompt template.
pub struct PromptEvaluatorService {
    llm: Arc<dyn LlmProvider>,
    config: Arc<dyn ConfigProvider>,
}

impl PromptEvaluatorService {
    pub fn new(llm: Arc<dyn LlmProvider>, config: Arc<dyn ConfigProvider>) -> Self {
        Self { llm, config }
    }

    async fn evaluate(
        &self,
        evaluator: &Evaluator,
        request: &RunEvaluatorRequest,
        usage: &mut Option<EvaluatorUsage>,
    ) -> Result<EvaluatorResult, Error> {
        let version = evaluator.prompt_evaluator_version.as_ref().ok_or_else(|| {
            Error::new(ErrorDetails::InvalidParam {
                message: format!("evaluator {} has no prompt version", evaluator.id),
            })
        })?;
        if version.message_list.is_empty() {
            return Err(Error::new(ErrorDetails::InvalidParam {
                message: format!("evaluator version {} has no messages", version.id),
            }));
        }
        let model_config = version.model_config.clone().ok_or_else(|| {
            Error::new(ErrorDetails::InvalidParam {
                message: format!("evaluator version {} has no model config", version.id),
            })
        })?;
        validate_input_fields(&version.input_schemas, &request.input.input_fields)?;

        let messages = tracing::info_span!("render_template", otel.name = "render_template")
            .in_scope(|| {
                render_messages(
                    &version.message_list,
                    &request.input.input_fields,
                    &version.prompt_suffix,
                )
            });

        let function_call = version.parse_type == ParseType::FunctionCall;
        let param = LlmCallParam {
            space_id: request.space_id,
            evaluator_version_id: version.id,
            user_id: request.user_id.clone(),
            scenario: Scenario::EvalEvaluator,
            messages,
            model_config,
            tools: if function_call {
                version.tools.clone()
            } else {
                Vec::new()
            },
            tool_choice: function_call.then_some(ToolChoice::Required),
        };
        let call_span = tracing::info_span!(
            "model_call",
            otel.name = "model_call",
            model_id = param.model_config.model_id,
            input_tokens = Empty,
            output_tokens = Empty,
        );
        let reply = self.llm.call(param).instrument(call_span.clone()).await?;
        if let Some(token_usage) = reply.token_usage {
            call_span.record("input_tokens", token_usage.input_tokens);
            call_span.record("output_tokens", token_usage.output_tokens);
            *usage = Some(token_usage.into());
        }

        let parse_span = tracing::info_span!(
            "parse_output",
            otel.name = "parse_output",
            parse_type = %version.parse_type,
        );
        parse_span.in_scope(|| match version.parse_type {
            ParseType::Content => {
                let content = reply
                    .content
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| Error::new(ErrorDetails::LlmOutputEmpty))?;
                parse_content(content)
            }
            ParseType::FunctionCall => {
                parse_function_call(&reply.tool_calls, version.tools.first())
            }
        })
    }
}

#[async_trait]
impl EvaluatorSourceService for PromptEvaluatorService {
    fn evaluator_type(&self) -> EvaluatorType {
        EvaluatorType::Prompt
    }

    fn pre_handle(&self, evaluator: &mut Evaluator) {
        let Some(version) = evaluator.prompt_evaluator_version.as_mut() else {
            return;
        };

        let tool_conf = self.config.get_evaluator_tool_conf();
        let tool = self
            .config
            .get_evaluator_tool_mapping()
            .get(&version.prompt_template_key)
            .and_then(|tool_key| tool_conf.get(tool_key))
            .or_else(|| tool_conf.get(DEFAULT_MAPPING_KEY))
            .cloned();
        if let Some(tool) = tool {
            version.tools = vec![tool];
        }

        let suffix_mapping = self.config.get_evaluator_prompt_suffix_mapping();
        let model_key = version
            .model_config
            .as_ref()
            .map(|m| m.model_id.to_string())
            .unwrap_or_default();
        let (suffix_key, parse_type) = match suffix_mapping.get(&model_key) {
            Some(mapping) => (mapping.suffix_key.as_str(), mapping.parse_type),
            None => (DEFAULT_MAPPING_KEY, ParseType::Content),
        };
        version.parse_type = parse_type;
        version.prompt_suffix = self
            .config
            .get_evaluator_prompt_suffix()
            .get(suffix_key)
            .cloned()
            .unwrap_or_default();
    }

    async fn run(
        &self,
        evaluator: &Evaluator,
        request: &RunEvaluatorRequest,
    ) -> EvaluatorRunOutcome {
        let trace_id = new_trace_id();
        let model_id = evaluator
            .prompt_evaluator_version
            .as_ref()
            .and_then(|v| v.model_config.as_ref())
            .map(|m| m.model_id)
            .unwrap_or_default();
        let span = tracing::info_span!(
            "evaluator",
            otel.name = "evaluator",
            trace_id = %trace_id,
            space_id = request.space_id,
            evaluator_id = evaluator.id,
            evaluator_version_id = evaluator.evaluator_version_id().unwrap_or_default(),
            input_fields = request.input.input_fields.len(),
            score = Empty,
            error = Empty,
        );

        let started = Instant::now();
        let mut usage = None;
        let result = self
            .evaluate(evaluator, request, &mut usage)
            .instrument(span.clone())
            .await;
        let elapsed = started.elapsed();

        let mut outcome = EvaluatorRunOutcome {
            trace_id,
            ..Default::default()
        };
        outcome.output.evaluator_usage = usage;
        outcome.output.time_consuming_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        match result {
            Ok(result) => {
                if let Some(score) = result.score {
                    span.record("score", score);
                }
                outcome.output.evaluator_result = Some(result);
                outcome.status = EvaluatorRunStatus::Success;
            }
            Err(e) => {
                span.record("error", tracing::field::display(&e));
                outcome.output.evaluator_run_error = Some(EvaluatorRunError {
                    code: e.error_code(),
                    message: e.to_string(),
                });
                outcome.status = EvaluatorRunStatus::Fail;
            }
        }

        let is_error = outcome.status == EvaluatorRunStatus::Fail;
        metrics::counter!(
            METRIC_EVALUATOR_RUN_TOTAL,
            "space_id" => request.space_id.to_string(),
            "model_id" => model_id.to_string(),
            "is_error" => is_error.to_string(),
        )
        .increment(1);
        metrics::histogram!(
            METRIC_EVALUATOR_RUN_LATENCY,
            "space_id" => request.space_id.to_string(),
            "model_id" => model_id.to_string(),
            "is_error" => is_error.to_string(),
        )
        .record(elapsed.as_secs_f64());
        outcome
    }
}

/// Checks each provided input against its schema: the content type must be supported, and
/// text must satisfy the JSON Schema when one is declared. Absent inputs are not checked.
fn validate_input_fields(
    schemas: &[ArgsSchema],
    fields: &HashMap<String, Content>,
) -> Result<(), Error> {
    for schema in schemas {
        let Some(content) = fields.get(&schema.key) else {
            continue;
        };
        if !schema.support_content_types.is_empty()
            && !schema.support_content_types.contains(&content.content_type)
        {
            return Err(Error::new(ErrorDetails::InvalidParam {
                message: format!(
                    "input field `{}` has content type {}, expected one of {:?}",
                    schema.key, content.content_type, schema.support_content_types
                ),
            }));
        }
        if content.content_type != ContentType::Text {
            continue;
        }
        let Some(raw_schema) = schema.json_schema.as_deref().filter(|s| !s.trim().is_empty())
        else {
            continue;
        };
        let json_schema: Value = serde_json::from_str(raw_schema).map_err(|e| {
            Error::new(ErrorDetails::InvalidParam {
                message: format!("input field `{}` has an invalid JSON Schema: {e}", schema.key),
            })
        })?;
        let validator = jsonschema::validator_for(&json_schema).map_err(|e| {
            Error::new(ErrorDetails::InvalidParam {
                message: format!("input field `{}` has an invalid JSON Schema: {e}", schema.key),
            })
        })?;
        let text = content.text.as_deref().unwrap_or_default();
        let expects_string = json_schema.get("type").and_then(Value::as_str) == Some("string");
        let instance = if expects_string {
            Value::String(text.to_string())
        } else {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        };
        if let Err(e) = validator.validate(&instance) {
            return Err(Error::new(ErrorDetails::InvalidParam {
                message: format!("input field `{}` does not match its schema: {e}", schema.key),
            }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::config::{EngineConfig, PromptSuffixMapping, SwappableConfigProvider};
    use experiment_core::entity::{
        EvaluatorInputData, Function, FunctionCall, Message, ModelConfig, PromptEvaluatorVersion,
        Role, TokenUsage, Tool, ToolCall,
    };
    use experiment_core::rpc::ReplyItem;
    use experiment_core::test_helpers::ScriptedLlmProvider;

    fn evaluator(template_key: &str, model_id: i64) -> Evaluator {
        Evaluator {
            id: 9,
            space_id: 1,
            name: "correctness".to_string(),
            evaluator_type: EvaluatorType::Prompt,
            prompt_evaluator_version: Some(PromptEvaluatorVersion {
                id: 90,
                evaluator_id: 9,
                space_id: 1,
                version: "v1".to_string(),
                message_list: vec![
                    Message::new(Role::System, Content::text("You grade answers.")),
                    Message::new(
                        Role::User,
                        Content::text("Q: {{input}}\nA: {{actual_output}}"),
                    ),
                ],
                model_config: Some(ModelConfig {
                    model_id,
                    ..Default::default()
                }),
                prompt_template_key: template_key.to_string(),
                input_schemas: vec![ArgsSchema {
                    key: "input".to_string(),
                    support_content_types: vec![ContentType::Text],
                    json_schema: Some(r#"{"type": "string"}"#.to_string()),
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn tool(name: &str) -> Tool {
        Tool {
            function: Function {
                name: name.to_string(),
                parameters: r#"{"type":"object","required":["score","reason"]}"#.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config() -> Arc<SwappableConfigProvider> {
        let mut config = EngineConfig::default();
        config
            .evaluator_tool_conf
            .insert(DEFAULT_MAPPING_KEY.to_string(), tool("default_grade"));
        config
            .evaluator_tool_conf
            .insert("strict".to_string(), tool("strict_grade"));
        config
            .evaluator_tool_mapping
            .insert("strict_template".to_string(), "strict".to_string());
        config
            .evaluator_prompt_suffix
            .insert(DEFAULT_MAPPING_KEY.to_string(), " Reply in JSON.".to_string());
        config
            .evaluator_prompt_suffix
            .insert("tool".to_string(), " Call the tool.".to_string());
        config.evaluator_prompt_suffix_mapping.insert(
            "77".to_string(),
            PromptSuffixMapping {
                suffix_key: "tool".to_string(),
                parse_type: ParseType::FunctionCall,
            },
        );
        Arc::new(SwappableConfigProvider::new(config))
    }

    fn request() -> RunEvaluatorRequest {
        RunEvaluatorRequest {
            space_id: 1,
            user_id: "u".to_string(),
            input: EvaluatorInputData {
                history_messages: Vec::new(),
                input_fields: [
                    ("input".to_string(), Content::text("capital of France?")),
                    ("actual_output".to_string(), Content::text("Paris")),
                ]
                .into_iter()
                .collect(),
            },
        }
    }

    #[test]
    fn test_pre_handle_selects_tool_suffix_and_parse_type() {
        let service = PromptEvaluatorService::new(
            Arc::new(ScriptedLlmProvider::with_content("")),
            config(),
        );

        let mut mapped = evaluator("strict_template", 77);
        service.pre_handle(&mut mapped);
        let version = mapped.prompt_evaluator_version.unwrap();
        assert_eq!(version.tools[0].function.name, "strict_grade");
        assert_eq!(version.parse_type, ParseType::FunctionCall);
        assert_eq!(version.prompt_suffix, " Call the tool.");

        let mut fallback = evaluator("unknown_template", 1);
        service.pre_handle(&mut fallback);
        let version = fallback.prompt_evaluator_version.unwrap();
        assert_eq!(version.tools[0].function.name, "default_grade");
        assert_eq!(version.parse_type, ParseType::Content);
        assert_eq!(version.prompt_suffix, " Reply in JSON.");
    }

    #[tokio::test]
    async fn test_content_run_renders_and_parses() {
        let llm = Arc::new(ScriptedLlmProvider::new(Ok(ReplyItem {
            content: Some("```json\n{\"score\":0.9,\"reason\":\"ok\"}\n```".to_string()),
            token_usage: Some(TokenUsage {
                input_tokens: 12,
                output_tokens: 5,
            }),
            ..Default::default()
        })));
        let service = PromptEvaluatorService::new(llm.clone(), config());
        let mut prepared = evaluator("t", 1);
        service.pre_handle(&mut prepared);

        let outcome = service.run(&prepared, &request()).await;
        assert_eq!(outcome.status, EvaluatorRunStatus::Success);
        assert!(!outcome.trace_id.is_empty());
        let result = outcome.output.evaluator_result.unwrap();
        assert_eq!(result.score, Some(0.9));
        assert_eq!(result.reasoning, "ok");
        assert_eq!(
            outcome.output.evaluator_usage,
            Some(EvaluatorUsage {
                input_tokens: 12,
                output_tokens: 5
            })
        );

        let calls = llm.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_choice, None);
        assert!(calls[0].tools.is_empty());
        assert_eq!(
            calls[0].messages[0]
                .content
                .as_ref()
                .and_then(|c| c.text.as_deref()),
            Some("You grade answers. Reply in JSON.")
        );
        assert_eq!(
            calls[0].messages[1]
                .content
                .as_ref()
                .and_then(|c| c.text.as_deref()),
            Some("Q: capital of France?\nA: Paris")
        );
    }

    #[tokio::test]
    async fn test_function_call_run_requires_tool() {
        let llm = Arc::new(ScriptedLlmProvider::new(Ok(ReplyItem {
            tool_calls: vec![ToolCall {
                index: 0,
                id: "c".to_string(),
                function_call: Some(FunctionCall {
                    name: "strict_grade".to_string(),
                    arguments: Some("{\"score\":0.8,\"reason\":\"fine\"}".to_string()),
                }),
                ..Default::default()
            }],
            ..Default::default()
        })));
        llm.push_reply(Ok(ReplyItem::default())).await;
        let service = PromptEvaluatorService::new(llm.clone(), config());
        let mut prepared = evaluator("strict_template", 77);
        service.pre_handle(&mut prepared);

        // First reply carries no tool calls.
        let failed = service.run(&prepared, &request()).await;
        assert_eq!(failed.status, EvaluatorRunStatus::Fail);
        let run_error = failed.output.evaluator_run_error.unwrap();
        assert_eq!(
            run_error.code,
            ErrorDetails::LlmToolCallFail {
                message: String::new()
            }
            .error_code()
        );

        let outcome = service.run(&prepared, &request()).await;
        assert_eq!(outcome.status, EvaluatorRunStatus::Success);
        assert_eq!(
            outcome.output.evaluator_result.unwrap().score,
            Some(0.8)
        );
        let calls = llm.calls().await;
        assert_eq!(calls[1].tool_choice, Some(ToolChoice::Required));
        assert_eq!(calls[1].tools[0].function.name, "strict_grade");
    }

    #[tokio::test]
    async fn test_input_schema_violation_is_captured() {
        let llm = Arc::new(ScriptedLlmProvider::with_content("{}"));
        let service = PromptEvaluatorService::new(llm.clone(), config());
        let mut request = request();
        request.input.input_fields.insert(
            "input".to_string(),
            Content {
                content_type: ContentType::Image,
                ..Default::default()
            },
        );

        let outcome = service.run(&evaluator("t", 1), &request).await;
        assert_eq!(outcome.status, EvaluatorRunStatus::Fail);
        assert!(
            outcome
                .output
                .evaluator_run_error
                .unwrap()
                .message
                .contains("content type Image")
        );
        assert!(llm.calls().await.is_empty(), "no model call after a validation failure");

        let err = service
            .debug(&evaluator("t", 1), &request)
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::EvaluatorRun { .. }));
    }

    #[tokio::test]
    async fn test_empty_content_reports_llm_output_empty() {
        let service = PromptEvaluatorService::new(
            Arc::new(ScriptedLlmProvider::with_content("  ")),
            config(),
        );
        let outcome = service.run(&evaluator("t", 1), &request()).await;
        assert_eq!(
            outcome.output.evaluator_run_error.map(|e| e.code),
            Some(ErrorDetails::LlmOutputEmpty.error_code())
        );
    }
}
