use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::entity::ExptStatus;

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We arc `ErrorDetails` per the `clippy::result_large_err` lint, as well as to make it cloneable
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    /// Builds an error without logging it.
    /// Used for errors that are expected on the happy path (e.g. a repeated idempotent action)
    /// and would otherwise flood the logs.
    pub fn new_silent(details: ErrorDetails) -> Self {
        Error(Arc::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(&self) -> ErrorDetails {
        self.0.as_ref().clone()
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        self.0.log_at_level(prefix, level);
    }

    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }

    pub fn error_code(&self) -> i32 {
        self.0.error_code()
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    ActionRepeated {
        key: String,
    },
    AggrResultVersionConflict {
        expt_id: i64,
        field_key: String,
        version: i64,
    },
    BenefitDenied {
        reason: String,
    },
    CommonInternal {
        message: String,
    },
    CommonRpc {
        service: String,
        message: String,
    },
    Config {
        message: String,
    },
    EvaluatorNotExist {
        evaluator_id: i64,
    },
    EvaluatorQpsLimit {
        message: String,
    },
    EvaluatorRun {
        code: i32,
        message: String,
    },
    EvaluatorVersionNotFound {
        evaluator_version_id: i64,
    },
    ExperimentNameExisted {
        name: String,
    },
    ExperimentRunningCountLimit {
        limit: usize,
    },
    ExperimentRunningExisted {
        expt_id: i64,
    },
    ExperimentStatusNotAllowed {
        expt_id: i64,
        status: ExptStatus,
    },
    ExperimentValidateFail {
        message: String,
    },
    InvalidOutputFromModel {
        message: String,
    },
    InvalidParam {
        message: String,
    },
    LlmOutputEmpty,
    LlmToolCallFail {
        message: String,
    },
    LockHeld {
        key: String,
    },
    ResourceNotFound {
        message: String,
    },
    RiskContentDetected {
        message: String,
    },
    RunEvaluatorFail {
        message: String,
    },
    Serialization {
        message: String,
    },
    ValkeyConnection {
        message: String,
    },
    ValkeyQuery {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::ActionRepeated { .. } => tracing::Level::INFO,
            ErrorDetails::AggrResultVersionConflict { .. } => tracing::Level::WARN,
            ErrorDetails::BenefitDenied { .. } => tracing::Level::WARN,
            ErrorDetails::CommonInternal { .. } => tracing::Level::ERROR,
            ErrorDetails::CommonRpc { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::EvaluatorNotExist { .. } => tracing::Level::WARN,
            ErrorDetails::EvaluatorQpsLimit { .. } => tracing::Level::WARN,
            ErrorDetails::EvaluatorRun { .. } => tracing::Level::WARN,
            ErrorDetails::EvaluatorVersionNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::ExperimentNameExisted { .. } => tracing::Level::WARN,
            ErrorDetails::ExperimentRunningCountLimit { .. } => tracing::Level::WARN,
            ErrorDetails::ExperimentRunningExisted { .. } => tracing::Level::WARN,
            ErrorDetails::ExperimentStatusNotAllowed { .. } => tracing::Level::WARN,
            ErrorDetails::ExperimentValidateFail { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidOutputFromModel { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidParam { .. } => tracing::Level::WARN,
            ErrorDetails::LlmOutputEmpty => tracing::Level::WARN,
            ErrorDetails::LlmToolCallFail { .. } => tracing::Level::WARN,
            ErrorDetails::LockHeld { .. } => tracing::Level::DEBUG,
            ErrorDetails::ResourceNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::RiskContentDetected { .. } => tracing::Level::WARN,
            ErrorDetails::RunEvaluatorFail { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::ValkeyConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::ValkeyQuery { .. } => tracing::Level::ERROR,
        }
    }

    /// Stable numeric code surfaced in `EvaluatorRunError` and to API callers.
    pub fn error_code(&self) -> i32 {
        match self {
            ErrorDetails::CommonInternal { .. } => 601_000_001,
            ErrorDetails::CommonRpc { .. } => 601_000_002,
            ErrorDetails::InvalidParam { .. } => 601_000_003,
            ErrorDetails::ResourceNotFound { .. } => 601_000_004,
            ErrorDetails::Config { .. } => 601_000_005,
            ErrorDetails::Serialization { .. } => 601_000_006,
            ErrorDetails::ValkeyConnection { .. } => 601_000_007,
            ErrorDetails::ValkeyQuery { .. } => 601_000_008,
            ErrorDetails::ActionRepeated { .. } => 601_000_009,
            ErrorDetails::LockHeld { .. } => 601_000_010,
            ErrorDetails::ExperimentValidateFail { .. } => 601_204_001,
            ErrorDetails::RiskContentDetected { .. } => 601_204_002,
            ErrorDetails::ExperimentRunningCountLimit { .. } => 601_204_003,
            ErrorDetails::ExperimentRunningExisted { .. } => 601_204_004,
            ErrorDetails::ExperimentNameExisted { .. } => 601_204_005,
            ErrorDetails::ExperimentStatusNotAllowed { .. } => 601_204_006,
            ErrorDetails::AggrResultVersionConflict { .. } => 601_204_007,
            ErrorDetails::BenefitDenied { .. } => 601_204_008,
            ErrorDetails::EvaluatorQpsLimit { .. } => 601_205_001,
            ErrorDetails::EvaluatorVersionNotFound { .. } => 601_205_002,
            ErrorDetails::EvaluatorNotExist { .. } => 601_205_003,
            ErrorDetails::LlmOutputEmpty => 601_205_004,
            ErrorDetails::LlmToolCallFail { .. } => 601_205_005,
            ErrorDetails::InvalidOutputFromModel { .. } => 601_205_006,
            ErrorDetails::RunEvaluatorFail { .. } => 601_205_007,
            ErrorDetails::EvaluatorRun { code, .. } => *code,
        }
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        match level {
            tracing::Level::ERROR => tracing::error!("{prefix}{self}"),
            tracing::Level::WARN => tracing::warn!("{prefix}{self}"),
            tracing::Level::INFO => tracing::info!("{prefix}{self}"),
            tracing::Level::DEBUG => tracing::debug!("{prefix}{self}"),
            tracing::Level::TRACE => tracing::trace!("{prefix}{self}"),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        self.log_at_level("", self.level());
    }

    /// Whether the operation that produced this error may succeed if redelivered.
    /// Bus consumers use this to decide between nacking and dropping a message.
    pub fn is_retryable(&self) -> bool {
        match &self {
            ErrorDetails::ActionRepeated { .. } => false,
            ErrorDetails::BenefitDenied { .. } => false,
            ErrorDetails::Config { .. } => false,
            ErrorDetails::ExperimentNameExisted { .. } => false,
            ErrorDetails::ExperimentRunningCountLimit { .. } => false,
            ErrorDetails::ExperimentRunningExisted { .. } => false,
            ErrorDetails::ExperimentStatusNotAllowed { .. } => false,
            ErrorDetails::ExperimentValidateFail { .. } => false,
            ErrorDetails::InvalidParam { .. } => false,
            ErrorDetails::ResourceNotFound { .. } => false,
            ErrorDetails::RiskContentDetected { .. } => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::ActionRepeated { key } => {
                write!(f, "Action already performed for idempotency key `{key}`")
            }
            ErrorDetails::AggrResultVersionConflict {
                expt_id,
                field_key,
                version,
            } => write!(
                f,
                "Aggregate result for experiment {expt_id} field `{field_key}` was updated concurrently (expected version {version})"
            ),
            ErrorDetails::BenefitDenied { reason } => {
                write!(f, "Benefit check denied the experiment: {reason}")
            }
            ErrorDetails::CommonInternal { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::CommonRpc { service, message } => {
                write!(f, "Error calling `{service}`: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "Config error: {message}"),
            ErrorDetails::EvaluatorNotExist { evaluator_id } => {
                write!(f, "Evaluator {evaluator_id} does not exist")
            }
            ErrorDetails::EvaluatorQpsLimit { message } => {
                write!(f, "Evaluator QPS limit reached: {message}")
            }
            ErrorDetails::EvaluatorRun { code, message } => {
                write!(f, "Evaluator run failed with code {code}: {message}")
            }
            ErrorDetails::EvaluatorVersionNotFound {
                evaluator_version_id,
            } => write!(f, "Evaluator version {evaluator_version_id} not found"),
            ErrorDetails::ExperimentNameExisted { name } => {
                write!(f, "Experiment name `{name}` already exists")
            }
            ErrorDetails::ExperimentRunningCountLimit { limit } => {
                write!(f, "ExperimentRunningCountLimit(max limit: {limit})")
            }
            ErrorDetails::ExperimentRunningExisted { expt_id } => {
                write!(f, "Experiment {expt_id} already has a running run")
            }
            ErrorDetails::ExperimentStatusNotAllowed { expt_id, status } => {
                write!(
                    f,
                    "Operation not allowed for experiment {expt_id} in status {status}"
                )
            }
            ErrorDetails::ExperimentValidateFail { message } => {
                write!(f, "Experiment validation failed: {message}")
            }
            ErrorDetails::InvalidOutputFromModel { message } => {
                write!(f, "Invalid output from model: {message}")
            }
            ErrorDetails::InvalidParam { message } => write!(f, "Invalid parameter: {message}"),
            ErrorDetails::LlmOutputEmpty => write!(f, "Model returned an empty output"),
            ErrorDetails::LlmToolCallFail { message } => {
                write!(f, "Model tool call failed: {message}")
            }
            ErrorDetails::LockHeld { key } => write!(f, "Lock `{key}` is held by another owner"),
            ErrorDetails::ResourceNotFound { message } => {
                write!(f, "Resource not found: {message}")
            }
            ErrorDetails::RiskContentDetected { message } => {
                write!(f, "Risky content detected: {message}")
            }
            ErrorDetails::RunEvaluatorFail { message } => {
                write!(f, "Failed to run evaluator: {message}")
            }
            ErrorDetails::Serialization { message } => write!(f, "Serialization error: {message}"),
            ErrorDetails::ValkeyConnection { message } => {
                write!(f, "Valkey connection error: {message}")
            }
            ErrorDetails::ValkeyQuery { message } => write!(f, "Valkey query error: {message}"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::new(ErrorDetails::ValkeyQuery {
            message: err.to_string(),
        })
    }
}
