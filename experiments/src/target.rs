//! Evaluation targets backed by versioned prompts.

use std::sync::Arc;
use std::time::Instant;

use experiment_core::db::ExptDatabase;
use experiment_core::entity::{
    ACTUAL_OUTPUT_FIELD, ArgsSchema, Content, ContentType, EvalTarget, EvalTargetOutputData,
    EvalTargetRunError, EvalTargetRunStatus, EvalTargetType, EvalTargetUsage, EvalTargetVersion,
    ExecuteEvalTargetParam, FieldDisplayFormat, LoopPrompt, ModelConfig,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::observability::METRIC_TARGET_EXECUTE_TOTAL;
use experiment_core::rpc::{ExecutePromptParam, PromptRpc, VariableVal};
use experiment_core::utils::id::IdGenerator;
use serde::Deserialize;
use tracing::instrument;

const STRING_SCHEMA: &str = r#"{"type": "string"}"#;

/// Runtime parameters accepted by prompt targets.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PromptRuntimeParam {
    #[serde(default)]
    model_config: Option<ModelConfig>,
}

pub struct EvalTargetService {
    prompts: Arc<dyn PromptRpc>,
    db: Arc<dyn ExptDatabase>,
    id_gen: Arc<dyn IdGenerator>,
}

fn parse_prompt_id(source_target_id: &str) -> Result<i64, Error> {
    source_target_id.parse().map_err(|_| {
        Error::new(ErrorDetails::InvalidParam {
            message: format!("source target id `{source_target_id}` is not a prompt id"),
        })
    })
}

impl EvalTargetService {
    pub fn new(
        prompts: Arc<dyn PromptRpc>,
        db: Arc<dyn ExptDatabase>,
        id_gen: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            prompts,
            db,
            id_gen,
        }
    }

    /// Runs the target on one turn's input. Only a malformed source id is returned as an
    /// error; execution failures are reported in the output's run error.
    #[instrument(skip_all, fields(space_id = %space_id, source_target_id = %param.source_target_id))]
    pub async fn execute(
        &self,
        space_id: i64,
        param: &ExecuteEvalTargetParam,
    ) -> Result<(EvalTargetOutputData, EvalTargetRunStatus), Error> {
        if param.target_type == EvalTargetType::Trace {
            return Ok((EvalTargetOutputData::default(), EvalTargetRunStatus::Success));
        }
        let prompt_id = parse_prompt_id(&param.source_target_id)?;
        let mut variables: Vec<VariableVal> = param
            .input
            .input_fields
            .iter()
            .map(|(key, content)| VariableVal {
                key: key.clone(),
                value: content.to_template_string(),
            })
            .collect();
        variables.sort_by(|a, b| a.key.cmp(&b.key));

        let started = Instant::now();
        let result = self
            .prompts
            .execute_prompt(ExecutePromptParam {
                space_id,
                prompt_id,
                prompt_version: param.source_target_version.clone(),
                variables,
                history_messages: param.input.history_messages.clone(),
            })
            .await;
        let mut output = EvalTargetOutputData {
            time_consuming_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            ..Default::default()
        };

        let status = match result {
            Ok(result) => {
                let field = match result.content {
                    Some(content) => Content::markdown(content),
                    None => Content {
                        content_type: ContentType::Text,
                        format: Some(FieldDisplayFormat::JSON),
                        text: Some(serde_json::to_string(&result.tool_calls)?),
                        ..Default::default()
                    },
                };
                output
                    .output_fields
                    .insert(ACTUAL_OUTPUT_FIELD.to_string(), field);
                output.eval_target_usage = result.token_usage.map(|u| EvalTargetUsage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                });
                EvalTargetRunStatus::Success
            }
            Err(e) => {
                output.eval_target_run_error = Some(EvalTargetRunError {
                    code: e.error_code(),
                    message: e.to_string(),
                });
                EvalTargetRunStatus::Fail
            }
        };
        metrics::counter!(
            METRIC_TARGET_EXECUTE_TOTAL,
            "space_id" => space_id.to_string(),
            "is_error" => (status == EvalTargetRunStatus::Fail).to_string(),
        )
        .increment(1);
        Ok((output, status))
    }

    /// Builds (without persisting) a target from a prompt version. The input schema lists the
    /// template variables as strings; the output is the single `actual_output` field.
    pub async fn build_by_source(
        &self,
        space_id: i64,
        source_target_id: &str,
        source_target_version: &str,
    ) -> Result<EvalTarget, Error> {
        let prompt_id = parse_prompt_id(source_target_id)?;
        let prompt = self
            .prompts
            .get_prompt(space_id, prompt_id, source_target_version)
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("prompt {prompt_id} version {source_target_version}"),
                })
            })?;
        let input_schema = prompt
            .variables
            .iter()
            .map(|variable| ArgsSchema {
                key: variable.clone(),
                support_content_types: vec![ContentType::Text],
                json_schema: Some(STRING_SCHEMA.to_string()),
            })
            .collect();
        let output_schema = vec![ArgsSchema {
            key: ACTUAL_OUTPUT_FIELD.to_string(),
            support_content_types: vec![ContentType::Text, ContentType::MultiPart],
            json_schema: Some(STRING_SCHEMA.to_string()),
        }];
        Ok(EvalTarget {
            id: 0,
            space_id,
            source_target_id: source_target_id.to_string(),
            eval_target_type: EvalTargetType::LoopPrompt,
            eval_target_version: Some(EvalTargetVersion {
                id: 0,
                space_id,
                target_id: 0,
                source_target_version: source_target_version.to_string(),
                eval_target_type: EvalTargetType::LoopPrompt,
                input_schema,
                output_schema,
                prompt: Some(LoopPrompt {
                    prompt_id,
                    version: prompt.version,
                    prompt_key: prompt.prompt_key,
                    name: prompt.name,
                    description: prompt.description,
                }),
                created_at: None,
            }),
        })
    }

    /// Returns the stored target for this source version, creating it on first use.
    #[instrument(skip_all, fields(space_id = %space_id, source_target_id = %source_target_id))]
    pub async fn create_or_get_by_source(
        &self,
        space_id: i64,
        source_target_id: &str,
        source_target_version: &str,
    ) -> Result<EvalTarget, Error> {
        if let Some(existing) = self
            .db
            .get_eval_target_by_source(
                space_id,
                source_target_id,
                source_target_version,
                EvalTargetType::LoopPrompt,
            )
            .await?
        {
            return Ok(existing);
        }
        let mut target = self
            .build_by_source(space_id, source_target_id, source_target_version)
            .await?;
        let (new_target_id, new_version_id) = self.id_gen.gen_id_pair()?;
        target.id = new_target_id;
        if let Some(version) = target.eval_target_version.as_mut() {
            version.id = new_version_id;
            version.target_id = new_target_id;
        }
        let (target_id, version_id) = self.db.create_eval_target(&target).await?;
        target.id = target_id;
        if let Some(version) = target.eval_target_version.as_mut() {
            version.id = version_id;
            version.target_id = target_id;
        }
        Ok(target)
    }

    pub async fn get_by_version_id(
        &self,
        space_id: i64,
        version_id: i64,
    ) -> Result<Option<EvalTarget>, Error> {
        self.db.get_eval_target_version(space_id, version_id).await
    }

    pub async fn batch_get_by_version_ids(
        &self,
        space_id: i64,
        version_ids: &[i64],
    ) -> Result<Vec<EvalTarget>, Error> {
        self.db
            .batch_get_eval_target_versions(space_id, version_ids)
            .await
    }

    /// Refreshes the prompt name, key and description of each target from the prompt service.
    /// Targets whose prompt is gone keep their stored info.
    pub async fn pack_source_info(&self, space_id: i64, targets: &mut [EvalTarget]) {
        for target in targets {
            let Some(prompt) = target
                .eval_target_version
                .as_mut()
                .and_then(|v| v.prompt.as_mut())
            else {
                continue;
            };
            match self
                .prompts
                .get_prompt(space_id, prompt.prompt_id, &prompt.version)
                .await
            {
                Ok(Some(info)) => {
                    prompt.name = info.name;
                    prompt.prompt_key = info.prompt_key;
                    prompt.description = info.description;
                }
                Ok(None) => {
                    tracing::warn!(prompt_id = prompt.prompt_id, "Prompt of eval target not found");
                }
                Err(e) => {
                    e.log_at_level(
                        "Failed to pack eval target source info: ",
                        tracing::Level::WARN,
                    );
                }
            }
        }
    }

    /// Checks the runtime parameter JSON carried by the target connector.
    pub fn validate_runtime_param(target_type: EvalTargetType, raw: &str) -> Result<(), Error> {
        if raw.trim().is_empty() {
            return Ok(());
        }
        match target_type {
            EvalTargetType::LoopPrompt => {
                let param: PromptRuntimeParam = serde_json::from_str(raw).map_err(|e| {
                    Error::new(ErrorDetails::InvalidParam {
                        message: format!("invalid runtime param: {e}"),
                    })
                })?;
                match param.model_config {
                    Some(model_config) if model_config.model_id <= 0 => {
                        Err(Error::new(ErrorDetails::InvalidParam {
                            message: format!(
                                "runtime param model id {} is invalid",
                                model_config.model_id
                            ),
                        }))
                    }
                    _ => Ok(()),
                }
            }
            EvalTargetType::Trace => Err(Error::new(ErrorDetails::InvalidParam {
                message: "trace targets take no runtime param".to_string(),
            })),
        }
    }
}
