use std::collections::HashMap;

use experiment_core::entity::{
    BUILTIN_RUNTIME_PARAM_FIELD, CreditCost, EvalTargetType, Experiment, FieldAdapter, Session,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::rpc::{AuditParam, AuditStatus, CheckBenefitParam};
use tracing::instrument;

use super::ExptManager;
use crate::target::EvalTargetService;

#[derive(Clone, Copy, Debug, Default)]
pub struct CheckRunOptions {
    /// Deduct the run's benefit. Only applies to offline experiments.
    pub check_benefit: bool,
}

fn validate_fail(message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::ExperimentValidateFail {
        message: message.into(),
    })
}

impl ExptManager {
    /// Validates a packed experiment (see `pack_tuple`) before it is created or run.
    /// Stops at the first failing check.
    #[instrument(skip_all, fields(space_id = %expt.space_id, expt_id = %expt.id))]
    pub async fn check_run(
        &self,
        expt: &mut Experiment,
        session: &Session,
        options: CheckRunOptions,
    ) -> Result<(), Error> {
        self.check_expt(expt).await?;
        check_target(expt)?;
        check_eval_set(expt)?;
        check_evaluators(expt)?;
        check_connector(expt)?;
        if options.check_benefit && !expt.is_online() {
            self.check_benefit(expt, session).await?;
        }
        Ok(())
    }

    async fn check_expt(&self, expt: &Experiment) -> Result<(), Error> {
        let audit_data = HashMap::from([
            ("name".to_string(), expt.name.clone()),
            ("description".to_string(), expt.description.clone()),
        ]);
        let record = match self
            .audit
            .audit(AuditParam {
                object_id: expt.id,
                audit_data,
                re_submit: false,
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                // Audit outages must not block experiments.
                e.log_at_level("Skipping unavailable audit: ", tracing::Level::WARN);
                return Ok(());
            }
        };
        match record.audit_status {
            AuditStatus::Approved => Ok(()),
            AuditStatus::Rejected => Err(Error::new(ErrorDetails::RiskContentDetected {
                message: record
                    .failed_reason
                    .unwrap_or_else(|| "experiment name or description rejected".to_string()),
            })),
        }
    }

    async fn check_benefit(&self, expt: &mut Experiment, session: &Session) -> Result<(), Error> {
        if expt.credit_cost == CreditCost::Free {
            return Ok(());
        }
        let result = self
            .benefit
            .check_and_deduct_eval_benefit(CheckBenefitParam {
                connector_uid: session.user_id.clone(),
                space_id: expt.space_id,
                expt_id: expt.id,
            })
            .await?;
        if let Some(reason) = result.deny_reason {
            return Err(Error::new(ErrorDetails::BenefitDenied {
                reason: reason.to_string(),
            }));
        }
        if result.is_free == Some(true) {
            expt.credit_cost = CreditCost::Free;
        }
        Ok(())
    }
}

fn check_target(expt: &Experiment) -> Result<(), Error> {
    if expt.is_online() {
        return Ok(());
    }
    if expt.target_id.is_none() || expt.target_version_id.is_none() || expt.target.is_none() {
        return Err(validate_fail(format!(
            "experiment {} has no evaluation target",
            expt.name
        )));
    }
    Ok(())
}

fn check_eval_set(expt: &Experiment) -> Result<(), Error> {
    if expt.is_online() {
        if expt.eval_set.is_none() {
            return Err(validate_fail(format!(
                "evaluation set {} not found",
                expt.eval_set_id
            )));
        }
        return Ok(());
    }
    match &expt.eval_set_version {
        Some(version) if version.item_count > 0 => Ok(()),
        Some(_) => Err(validate_fail(format!(
            "evaluation set version {} has no items",
            expt.eval_set_version_id
        ))),
        None => Err(validate_fail(format!(
            "evaluation set version {} not found",
            expt.eval_set_version_id
        ))),
    }
}

fn check_evaluators(expt: &Experiment) -> Result<(), Error> {
    let refs = expt.evaluator_version_refs.len();
    if refs == 0 || refs != expt.evaluators.len() {
        return Err(validate_fail(format!(
            "experiment references {refs} evaluator versions but {} were found",
            expt.evaluators.len()
        )));
    }
    Ok(())
}

fn check_adapter(
    adapter: &FieldAdapter,
    available: impl Fn(&str) -> bool,
    upstream: &str,
) -> Result<(), Error> {
    for conf in &adapter.field_confs {
        if conf.value.is_some() {
            continue;
        }
        if !available(&conf.from_field) {
            return Err(validate_fail(format!(
                "field `{}` mapped to `{}` does not exist in the {upstream}",
                conf.from_field, conf.field_name
            )));
        }
    }
    Ok(())
}

fn check_connector(expt: &Experiment) -> Result<(), Error> {
    let schema = expt
        .eval_set_version
        .as_ref()
        .and_then(|v| v.evaluation_set_schema.clone())
        .unwrap_or_default();
    let in_eval_set = |name: &str| schema.has_field(name);
    let connector = &expt.eval_conf.connector_conf;
    let target_type = expt.target_type.unwrap_or_default();

    if let Some(ingress) = connector
        .target_conf
        .as_ref()
        .and_then(|c| c.ingress_conf.as_ref())
    {
        check_adapter(&ingress.eval_set_adapter, in_eval_set, "evaluation set")?;
        let runtime_param = ingress
            .custom_conf
            .iter()
            .flat_map(|c| &c.field_confs)
            .find(|c| c.field_name == BUILTIN_RUNTIME_PARAM_FIELD)
            .and_then(|c| c.value.as_deref());
        if let Some(raw) = runtime_param {
            EvalTargetService::validate_runtime_param(target_type, raw)?;
        }
    }

    let skip_target_adapter = expt.is_online() || target_type == EvalTargetType::Trace;
    let output_schema = expt.target.as_ref().map(|t| t.output_schema()).unwrap_or_default();
    let in_target_output = |name: &str| output_schema.iter().any(|s| s.key == name);
    for conf in connector
        .evaluators_conf
        .iter()
        .flat_map(|c| &c.evaluator_conf)
    {
        let Some(ingress) = &conf.ingress_conf else {
            continue;
        };
        if let Some(adapter) = &ingress.eval_set_adapter {
            check_adapter(adapter, in_eval_set, "evaluation set")?;
        }
        if let Some(adapter) = &ingress.target_adapter
            && !skip_target_adapter
        {
            check_adapter(adapter, in_target_output, "target output")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::entity::{
        ArgsSchema, ConnectorConf, EvalTarget, EvalTargetVersion, EvaluationSet,
        EvaluationSetSchema, EvaluationSetVersion, Evaluator, EvaluatorConf, EvaluatorIngressConf, EvaluatorsConf,
        EvaluatorVersionRef, ExptEvalConf, ExptType, FieldConf, FieldSchema, TargetConf,
        TargetIngressConf,
    };

    fn adapter(pairs: &[(&str, &str)]) -> FieldAdapter {
        FieldAdapter {
            field_confs: pairs
                .iter()
                .map(|(field_name, from_field)| FieldConf {
                    field_name: (*field_name).to_string(),
                    from_field: (*from_field).to_string(),
                    value: None,
                })
                .collect(),
        }
    }

    fn packed() -> Experiment {
        Experiment {
            name: "e".to_string(),
            target_id: Some(1),
            target_version_id: Some(2),
            target: Some(EvalTarget {
                id: 1,
                eval_target_version: Some(EvalTargetVersion {
                    id: 2,
                    output_schema: vec![ArgsSchema {
                        key: "actual_output".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }),
            eval_set_version: Some(EvaluationSetVersion {
                item_count: 2,
                evaluation_set_schema: Some(EvaluationSetSchema {
                    field_schemas: vec![FieldSchema {
                        name: "question".to_string(),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            evaluator_version_refs: vec![EvaluatorVersionRef {
                evaluator_id: 5,
                evaluator_version_id: 50,
            }],
            evaluators: vec![Evaluator::default()],
            eval_conf: ExptEvalConf {
                connector_conf: ConnectorConf {
                    target_conf: Some(TargetConf {
                        target_version_id: 2,
                        ingress_conf: Some(TargetIngressConf {
                            eval_set_adapter: adapter(&[("q", "question")]),
                            custom_conf: None,
                        }),
                    }),
                    evaluators_conf: Some(EvaluatorsConf {
                        evaluator_concur_num: None,
                        evaluator_conf: vec![EvaluatorConf {
                            evaluator_version_id: 50,
                            ingress_conf: Some(EvaluatorIngressConf {
                                eval_set_adapter: Some(adapter(&[("input", "question")])),
                                target_adapter: Some(adapter(&[("output", "actual_output")])),
                            }),
                        }],
                    }),
                },
                item_concur_num: None,
            },
            ..Default::default()
        }
    }

    fn is_validate_fail(result: Result<(), Error>) -> bool {
        matches!(
            result.map_err(|e| e.get_owned_details()),
            Err(ErrorDetails::ExperimentValidateFail { .. })
        )
    }

    #[test]
    fn test_valid_tuple_passes() {
        let expt = packed();
        check_target(&expt).unwrap();
        check_eval_set(&expt).unwrap();
        check_evaluators(&expt).unwrap();
        check_connector(&expt).unwrap();
    }

    #[test]
    fn test_empty_eval_set_version_fails() {
        let mut expt = packed();
        if let Some(version) = expt.eval_set_version.as_mut() {
            version.item_count = 0;
        }
        assert!(is_validate_fail(check_eval_set(&expt)));

        expt.expt_type = ExptType::Online;
        assert!(is_validate_fail(check_eval_set(&expt)));
        expt.eval_set = Some(EvaluationSet::default());
        check_eval_set(&expt).unwrap();
    }

    #[test]
    fn test_missing_target_fails_unless_online() {
        let mut expt = packed();
        expt.target = None;
        assert!(is_validate_fail(check_target(&expt)));
        expt.expt_type = ExptType::Online;
        check_target(&expt).unwrap();
    }

    #[test]
    fn test_evaluator_count_mismatch_fails() {
        let mut expt = packed();
        expt.evaluators.clear();
        assert!(is_validate_fail(check_evaluators(&expt)));
    }

    #[test]
    fn test_unknown_adapter_fields_fail() {
        let mut expt = packed();
        if let Some(ingress) = expt
            .eval_conf
            .connector_conf
            .target_conf
            .as_mut()
            .and_then(|c| c.ingress_conf.as_mut())
        {
            ingress.eval_set_adapter = adapter(&[("q", "answer")]);
        }
        assert!(is_validate_fail(check_connector(&expt)));

        let mut expt = packed();
        if let Some(conf) = expt
            .eval_conf
            .connector_conf
            .evaluators_conf
            .as_mut()
            .and_then(|c| c.evaluator_conf.first_mut())
        {
            conf.ingress_conf = Some(EvaluatorIngressConf {
                eval_set_adapter: None,
                target_adapter: Some(adapter(&[("output", "missing")])),
            });
        }
        assert!(is_validate_fail(check_connector(&expt)));
        // Trace targets produce no output schema to check against.
        expt.target_type = Some(EvalTargetType::Trace);
        check_connector(&expt).unwrap();
    }

    #[test]
    fn test_runtime_param_is_validated() {
        let mut expt = packed();
        if let Some(ingress) = expt
            .eval_conf
            .connector_conf
            .target_conf
            .as_mut()
            .and_then(|c| c.ingress_conf.as_mut())
        {
            ingress.custom_conf = Some(FieldAdapter {
                field_confs: vec![FieldConf {
                    field_name: BUILTIN_RUNTIME_PARAM_FIELD.to_string(),
                    from_field: String::new(),
                    value: Some(r#"{"model_config": {"model_id": 0}}"#.to_string()),
                }],
            });
        }
        let err = check_connector(&expt).unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidParam { .. }
        ));
    }
}
