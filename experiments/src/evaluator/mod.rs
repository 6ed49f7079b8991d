//! Evaluator runtime. Each evaluator type has an `EvaluatorSourceService`; callers go through
//! `EvaluatorRegistry`, which applies `pre_handle` to a copy of the evaluator before running it.

pub mod json_repair;
pub mod parse;
pub mod prompt;
pub mod render;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use experiment_core::entity::{
    Evaluator, EvaluatorInputData, EvaluatorOutputData, EvaluatorRunStatus, EvaluatorType,
};
use experiment_core::error::{Error, ErrorDetails};

pub use prompt::PromptEvaluatorService;

#[derive(Clone, Debug, Default)]
pub struct RunEvaluatorRequest {
    pub space_id: i64,
    pub user_id: String,
    pub input: EvaluatorInputData,
}

#[derive(Clone, Debug, Default)]
pub struct EvaluatorRunOutcome {
    pub output: EvaluatorOutputData,
    pub status: EvaluatorRunStatus,
    pub trace_id: String,
}

#[async_trait]
pub trait EvaluatorSourceService: Send + Sync {
    fn evaluator_type(&self) -> EvaluatorType;

    /// Fills the configuration-derived parts of the evaluator (tools, suffix, parse type).
    fn pre_handle(&self, evaluator: &mut Evaluator);

    /// Never fails: errors are reported through `output.evaluator_run_error` and `Fail` status.
    async fn run(&self, evaluator: &Evaluator, request: &RunEvaluatorRequest)
    -> EvaluatorRunOutcome;

    /// Like `run`, but a run error is returned as `EvaluatorRun`.
    async fn debug(
        &self,
        evaluator: &Evaluator,
        request: &RunEvaluatorRequest,
    ) -> Result<EvaluatorOutputData, Error> {
        let outcome = self.run(evaluator, request).await;
        match outcome.output.evaluator_run_error {
            Some(run_error) => Err(Error::new(ErrorDetails::EvaluatorRun {
                code: run_error.code,
                message: run_error.message,
            })),
            None => Ok(outcome.output),
        }
    }
}

#[derive(Default)]
pub struct EvaluatorRegistry {
    services: HashMap<EvaluatorType, Arc<dyn EvaluatorSourceService>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_service(mut self, service: Arc<dyn EvaluatorSourceService>) -> Self {
        self.services.insert(service.evaluator_type(), service);
        self
    }

    pub fn get(
        &self,
        evaluator_type: EvaluatorType,
    ) -> Result<&Arc<dyn EvaluatorSourceService>, Error> {
        self.services.get(&evaluator_type).ok_or_else(|| {
            Error::new(ErrorDetails::RunEvaluatorFail {
                message: format!("no runtime registered for {evaluator_type} evaluators"),
            })
        })
    }

    /// Returns the evaluator as it will be run.
    pub fn prepare(&self, evaluator: &Evaluator) -> Result<Evaluator, Error> {
        let service = self.get(evaluator.evaluator_type)?;
        let mut prepared = evaluator.clone();
        service.pre_handle(&mut prepared);
        Ok(prepared)
    }

    pub async fn run(
        &self,
        evaluator: &Evaluator,
        request: &RunEvaluatorRequest,
    ) -> Result<EvaluatorRunOutcome, Error> {
        let service = self.get(evaluator.evaluator_type)?;
        let prepared = self.prepare(evaluator)?;
        Ok(service.run(&prepared, request).await)
    }

    pub async fn debug(
        &self,
        evaluator: &Evaluator,
        request: &RunEvaluatorRequest,
    ) -> Result<EvaluatorOutputData, Error> {
        let service = self.get(evaluator.evaluator_type)?;
        let prepared = self.prepare(evaluator)?;
        service.debug(&prepared, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unregistered_type_is_rejected() {
        let registry = EvaluatorRegistry::new();
        let evaluator = Evaluator {
            evaluator_type: EvaluatorType::Code,
            ..Default::default()
        };
        let err = registry
            .run(&evaluator, &RunEvaluatorRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::RunEvaluatorFail { .. }
        ));
    }
}
