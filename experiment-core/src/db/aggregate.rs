use async_trait::async_trait;

use crate::entity::{ExptAggrResult, FieldType};
use crate::error::Error;

#[async_trait]
pub trait ExptAggrResultQueries: Send + Sync {
    /// Inserts rows; an existing row with the same `(expt_id, field_type, field_key)` has its
    /// payload replaced and keeps its version.
    async fn batch_create_aggr_results(&self, rows: &[ExptAggrResult]) -> Result<(), Error>;

    async fn get_aggr_result(
        &self,
        space_id: i64,
        expt_id: i64,
        field_type: FieldType,
        field_key: &str,
    ) -> Result<Option<ExptAggrResult>, Error>;

    async fn batch_get_aggr_results_by_expt_ids(
        &self,
        space_id: i64,
        expt_ids: &[i64],
    ) -> Result<Vec<ExptAggrResult>, Error>;

    /// Atomically increments the row's version and returns the new value.
    async fn update_and_get_latest_version(
        &self,
        space_id: i64,
        expt_id: i64,
        field_type: FieldType,
        field_key: &str,
    ) -> Result<i64, Error>;

    /// Writes the payload only if the stored version still equals `version`;
    /// otherwise fails with `AggrResultVersionConflict`.
    async fn update_aggr_result_by_version(
        &self,
        row: &ExptAggrResult,
        version: i64,
    ) -> Result<(), Error>;
}
