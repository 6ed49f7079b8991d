use async_trait::async_trait;

use crate::entity::{
    ExptItemResult, ExptItemResultRunLog, ExptStats, ExptTurnEvaluatorResultRef, ExptTurnResult,
    ItemRunState, ItemTurnId,
};
use crate::error::Error;

#[async_trait]
pub trait ExptItemResultQueries: Send + Sync {
    /// Inserts rows whose `(expt_id, item_id)` is not present yet. Returns the number inserted.
    async fn batch_create_nx_item_results(&self, results: &[ExptItemResult])
    -> Result<usize, Error>;

    async fn get_item_results(
        &self,
        space_id: i64,
        expt_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<ExptItemResult>, Error>;

    /// Pages rows ordered by `item_idx`, starting after `cursor`.
    async fn list_item_results(
        &self,
        space_id: i64,
        expt_id: i64,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ExptItemResult>, Error>;

    async fn update_item_results_status(
        &self,
        space_id: i64,
        expt_id: i64,
        item_ids: &[i64],
        status: ItemRunState,
    ) -> Result<(), Error>;

    async fn update_item_result(&self, result: &ExptItemResult) -> Result<(), Error>;

    async fn get_max_item_idx(&self, space_id: i64, expt_id: i64) -> Result<Option<i64>, Error>;

    /// Inserts run logs whose `(expt_id, expt_run_id, item_id)` is not present yet.
    async fn batch_create_nx_item_run_logs(
        &self,
        logs: &[ExptItemResultRunLog],
    ) -> Result<usize, Error>;

    /// Lists the run's item logs in any of `states`, ordered by item id, capped at `limit`.
    async fn scan_item_run_logs(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        states: &[ItemRunState],
        limit: Option<usize>,
    ) -> Result<Vec<ExptItemResultRunLog>, Error>;

    async fn update_item_run_logs_status(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        item_ids: &[i64],
        status: ItemRunState,
    ) -> Result<(), Error>;

    /// Moves each scanned log to `Processing` if its `status` and `updated_at` still match the
    /// scanned copy. Returns the item ids this call claimed; a log changed since the scan by a
    /// concurrent tick is skipped.
    async fn claim_item_run_logs(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        scanned: &[ExptItemResultRunLog],
    ) -> Result<Vec<i64>, Error>;

    async fn update_item_run_log(&self, log: &ExptItemResultRunLog) -> Result<(), Error>;
}

#[async_trait]
pub trait ExptTurnResultQueries: Send + Sync {
    /// Inserts rows whose `(expt_id, item_id, turn_id)` is not present yet.
    async fn batch_create_nx_turn_results(&self, results: &[ExptTurnResult])
    -> Result<usize, Error>;

    /// Pages rows ordered by id, starting after `cursor`.
    async fn list_turn_results(
        &self,
        space_id: i64,
        expt_id: i64,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ExptTurnResult>, Error>;

    /// Turns of one item, ordered by `turn_idx`.
    async fn get_item_turn_results(
        &self,
        space_id: i64,
        expt_id: i64,
        item_id: i64,
    ) -> Result<Vec<ExptTurnResult>, Error>;

    async fn update_turn_results_status(
        &self,
        space_id: i64,
        expt_id: i64,
        item_turn_ids: &[ItemTurnId],
        status: ItemRunState,
    ) -> Result<(), Error>;

    async fn update_turn_result(&self, result: &ExptTurnResult) -> Result<(), Error>;

    async fn batch_create_turn_evaluator_refs(
        &self,
        refs: &[ExptTurnEvaluatorResultRef],
    ) -> Result<(), Error>;

    async fn list_turn_evaluator_refs(
        &self,
        space_id: i64,
        expt_id: i64,
        evaluator_version_id: i64,
    ) -> Result<Vec<ExptTurnEvaluatorResultRef>, Error>;
}

#[async_trait]
pub trait ExptStatsQueries: Send + Sync {
    async fn create_stats(&self, stats: &ExptStats) -> Result<(), Error>;

    async fn get_stats(&self, space_id: i64, expt_id: i64) -> Result<Option<ExptStats>, Error>;

    async fn mget_stats(&self, space_id: i64, expt_ids: &[i64]) -> Result<Vec<ExptStats>, Error>;

    /// Overwrites the counters of an existing row (creating it if missing).
    async fn update_stats(&self, stats: &ExptStats) -> Result<(), Error>;

    /// Adds `pending_delta` to the pending turn counter.
    async fn incr_pending_turn_cnt(
        &self,
        space_id: i64,
        expt_id: i64,
        pending_delta: i64,
    ) -> Result<(), Error>;
}
