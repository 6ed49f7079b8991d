//! Bus consumers. Each handler returns the error of a failed delivery so the bus redelivers it.

use std::sync::Arc;

use experiment_core::bus::PublishedEvent;
use experiment_core::entity::{
    CalculateMode, EvaluatorRecordCorrectionEvent, ExptAggrCalculateEvent, ExptScheduleEvent,
    FieldType, SpecificField,
};
use experiment_core::error::Error;
use experiment_core::utils::now_unix;
use tracing::instrument;

use crate::aggregation::ExptAggrResultService;
use crate::scheduler::ExptSchedulerService;

pub struct ExptEventConsumer {
    scheduler: Arc<ExptSchedulerService>,
    aggr: Arc<ExptAggrResultService>,
}

impl ExptEventConsumer {
    pub fn new(scheduler: Arc<ExptSchedulerService>, aggr: Arc<ExptAggrResultService>) -> Self {
        Self { scheduler, aggr }
    }

    pub async fn handle(&self, event: &PublishedEvent) -> Result<(), Error> {
        match event {
            PublishedEvent::Schedule(event) => self.handle_schedule_event(event).await,
            PublishedEvent::AggrCalculate(event) => self.handle_aggr_calculate_event(event).await,
            PublishedEvent::RecordCorrection(event) => {
                self.handle_record_correction_event(event).await
            }
        }
    }

    pub async fn handle_schedule_event(&self, event: &ExptScheduleEvent) -> Result<(), Error> {
        self.scheduler.schedule(event).await
    }

    pub async fn handle_aggr_calculate_event(
        &self,
        event: &ExptAggrCalculateEvent,
    ) -> Result<(), Error> {
        self.aggr.calculate(event).await
    }

    /// Recomputes the aggregate of the corrected evaluator.
    #[instrument(skip_all, fields(space_id = %event.space_id, expt_id = %event.experiment_id, record_id = %event.evaluator_record_id))]
    pub async fn handle_record_correction_event(
        &self,
        event: &EvaluatorRecordCorrectionEvent,
    ) -> Result<(), Error> {
        self.aggr
            .calculate(&correction_to_calculate_event(event))
            .await
    }
}

fn correction_to_calculate_event(event: &EvaluatorRecordCorrectionEvent) -> ExptAggrCalculateEvent {
    ExptAggrCalculateEvent {
        space_id: event.space_id,
        expt_id: event.experiment_id,
        calculate_mode: CalculateMode::UpdateSpecificField,
        specific_field: Some(SpecificField {
            field_type: FieldType::EvaluatorScore,
            field_key: event.evaluator_version_id.to_string(),
        }),
        create_time: now_unix(),
    }
}
