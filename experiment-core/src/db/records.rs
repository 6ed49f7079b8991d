use async_trait::async_trait;

use crate::entity::{
    AnnotateRecord, Correction, EvalTarget, EvalTargetRecord, EvalTargetType, EvaluatorRecord,
    ExptTurnAnnotateRecordRef,
};
use crate::error::Error;

#[async_trait]
pub trait EvaluatorRecordQueries: Send + Sync {
    async fn create_evaluator_record(&self, record: &EvaluatorRecord) -> Result<(), Error>;

    async fn get_evaluator_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvaluatorRecord>, Error>;

    async fn batch_get_evaluator_records(
        &self,
        space_id: i64,
        record_ids: &[i64],
    ) -> Result<Vec<EvaluatorRecord>, Error>;

    async fn update_evaluator_record_correction(
        &self,
        space_id: i64,
        record_id: i64,
        correction: &Correction,
        updated_by: &str,
    ) -> Result<(), Error>;
}

#[async_trait]
pub trait EvalTargetQueries: Send + Sync {
    /// Persists the target and its version. If the same source version is already stored the
    /// existing ids are returned instead.
    async fn create_eval_target(&self, target: &EvalTarget) -> Result<(i64, i64), Error>;

    async fn get_eval_target_by_source(
        &self,
        space_id: i64,
        source_target_id: &str,
        source_target_version: &str,
        target_type: EvalTargetType,
    ) -> Result<Option<EvalTarget>, Error>;

    async fn get_eval_target_version(
        &self,
        space_id: i64,
        version_id: i64,
    ) -> Result<Option<EvalTarget>, Error>;

    async fn batch_get_eval_target_versions(
        &self,
        space_id: i64,
        version_ids: &[i64],
    ) -> Result<Vec<EvalTarget>, Error>;

    async fn create_target_record(&self, record: &EvalTargetRecord) -> Result<(), Error>;

    async fn get_target_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvalTargetRecord>, Error>;
}

#[async_trait]
pub trait AnnotationQueries: Send + Sync {
    async fn create_annotate_record(
        &self,
        record: &AnnotateRecord,
        turn_ref: &ExptTurnAnnotateRecordRef,
    ) -> Result<(), Error>;

    /// Distinct tag keys annotated on the experiment.
    async fn list_annotate_tag_key_ids(
        &self,
        space_id: i64,
        expt_id: i64,
    ) -> Result<Vec<i64>, Error>;

    async fn list_turn_annotate_refs(
        &self,
        space_id: i64,
        expt_id: i64,
        tag_key_id: i64,
    ) -> Result<Vec<ExptTurnAnnotateRecordRef>, Error>;

    async fn batch_get_annotate_records(
        &self,
        space_id: i64,
        record_ids: &[i64],
    ) -> Result<Vec<AnnotateRecord>, Error>;
}
