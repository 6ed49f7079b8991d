use async_trait::async_trait;

use crate::entity::{
    Experiment, ExperimentUpdate, ExptListFilter, ExptRunLog, Page, ReadConsistency,
};
use crate::error::Error;

#[async_trait]
pub trait ExperimentQueries: Send + Sync {
    /// Fails with `ExperimentNameExisted` if a live experiment in the space has the same name.
    async fn create_experiment(&self, expt: &Experiment) -> Result<(), Error>;

    async fn get_experiment(
        &self,
        space_id: i64,
        expt_id: i64,
        consistency: ReadConsistency,
    ) -> Result<Option<Experiment>, Error>;

    /// Missing ids are skipped; order follows `expt_ids`.
    async fn mget_experiments(
        &self,
        space_id: i64,
        expt_ids: &[i64],
        consistency: ReadConsistency,
    ) -> Result<Vec<Experiment>, Error>;

    async fn get_experiment_by_name(
        &self,
        space_id: i64,
        name: &str,
    ) -> Result<Option<Experiment>, Error>;

    /// Returns one page (newest first) and the total number of matches.
    async fn list_experiments(
        &self,
        space_id: i64,
        filter: &ExptListFilter,
        page: Page,
    ) -> Result<(Vec<Experiment>, i64), Error>;

    async fn update_experiment(
        &self,
        space_id: i64,
        expt_id: i64,
        update: &ExperimentUpdate,
    ) -> Result<(), Error>;

    /// Soft delete; the name becomes available again.
    async fn delete_experiment(&self, space_id: i64, expt_id: i64) -> Result<(), Error>;
}

#[async_trait]
pub trait ExptRunLogQueries: Send + Sync {
    async fn create_run_log(&self, run_log: &ExptRunLog) -> Result<(), Error>;

    async fn get_run_log(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
    ) -> Result<Option<ExptRunLog>, Error>;

    async fn update_run_log(&self, run_log: &ExptRunLog) -> Result<(), Error>;
}
