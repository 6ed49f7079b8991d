//! In-process backend for every engine store.
//!
//! All tables live behind one `tokio::sync::RwLock`, which makes each trait method atomic.
//! That is enough for the NX and optimistic-version semantics the engine relies on.

mod shared_state;

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

pub use shared_state::InMemorySharedState;

use crate::db::{
    AnnotationQueries, EvalTargetQueries, EvaluatorRecordQueries, ExperimentQueries,
    ExptAggrResultQueries, ExptItemResultQueries, ExptRunLogQueries, ExptStatsQueries,
    ExptTurnResultQueries, HealthCheckable,
};
use crate::entity::{
    AnnotateRecord, Correction, EvalTarget, EvalTargetRecord, EvalTargetType, EvaluatorRecord,
    Experiment, ExperimentUpdate, ExptAggrResult, ExptItemResult, ExptItemResultRunLog,
    ExptListFilter, ExptRunLog, ExptStats, ExptTurnAnnotateRecordRef, ExptTurnEvaluatorResultRef,
    ExptTurnResult, FieldType, ItemRunState, ItemTurnId, Page, ReadConsistency,
};
use crate::error::{Error, ErrorDetails};

type AggrKey = (i64, FieldType, String);

#[derive(Default)]
struct Tables {
    experiments: BTreeMap<i64, Experiment>,
    run_logs: HashMap<(i64, i64), ExptRunLog>,
    item_results: BTreeMap<(i64, i64), ExptItemResult>,
    item_run_logs: BTreeMap<(i64, i64, i64), ExptItemResultRunLog>,
    turn_results: BTreeMap<(i64, i64, i64), ExptTurnResult>,
    turn_evaluator_refs: Vec<ExptTurnEvaluatorResultRef>,
    stats: HashMap<i64, ExptStats>,
    aggr_results: HashMap<AggrKey, ExptAggrResult>,
    evaluator_records: HashMap<i64, EvaluatorRecord>,
    targets_by_version: BTreeMap<i64, EvalTarget>,
    target_records: HashMap<i64, EvalTargetRecord>,
    annotate_records: HashMap<i64, AnnotateRecord>,
    annotate_refs: Vec<ExptTurnAnnotateRecordRef>,
    next_target_id: i64,
}

#[derive(Default)]
pub struct InMemoryDatabase {
    tables: RwLock<Tables>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_filter(expt: &Experiment, filter: &ExptListFilter) -> bool {
    let ExptListFilter {
        fuzzy_name,
        statuses,
        expt_type,
        eval_set_ids,
        created_by,
    } = filter;
    fuzzy_name
        .as_ref()
        .is_none_or(|name| expt.name.contains(name.as_str()))
        && (statuses.is_empty() || statuses.contains(&expt.status))
        && expt_type.is_none_or(|t| t == expt.expt_type)
        && (eval_set_ids.is_empty() || eval_set_ids.contains(&expt.eval_set_id))
        && (created_by.is_empty() || created_by.contains(&expt.created_by))
}

#[async_trait]
impl HealthCheckable for InMemoryDatabase {
    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl ExperimentQueries for InMemoryDatabase {
    async fn create_experiment(&self, expt: &Experiment) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let name_taken = tables
            .experiments
            .values()
            .any(|e| e.space_id == expt.space_id && !e.deleted && e.name == expt.name);
        if name_taken {
            return Err(Error::new(ErrorDetails::ExperimentNameExisted {
                name: expt.name.clone(),
            }));
        }
        let mut row = expt.clone();
        let now = Utc::now();
        row.created_at = Some(now);
        row.updated_at = Some(now);
        tables.experiments.insert(row.id, row);
        Ok(())
    }

    async fn get_experiment(
        &self,
        space_id: i64,
        expt_id: i64,
        _consistency: ReadConsistency,
    ) -> Result<Option<Experiment>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .experiments
            .get(&expt_id)
            .filter(|e| e.space_id == space_id && !e.deleted)
            .cloned())
    }

    async fn mget_experiments(
        &self,
        space_id: i64,
        expt_ids: &[i64],
        _consistency: ReadConsistency,
    ) -> Result<Vec<Experiment>, Error> {
        let tables = self.tables.read().await;
        Ok(expt_ids
            .iter()
            .filter_map(|id| tables.experiments.get(id))
            .filter(|e| e.space_id == space_id && !e.deleted)
            .cloned()
            .collect())
    }

    async fn get_experiment_by_name(
        &self,
        space_id: i64,
        name: &str,
    ) -> Result<Option<Experiment>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .experiments
            .values()
            .find(|e| e.space_id == space_id && !e.deleted && e.name == name)
            .cloned())
    }

    async fn list_experiments(
        &self,
        space_id: i64,
        filter: &ExptListFilter,
        page: Page,
    ) -> Result<(Vec<Experiment>, i64), Error> {
        let tables = self.tables.read().await;
        let matched: Vec<&Experiment> = tables
            .experiments
            .values()
            .rev()
            .filter(|e| e.space_id == space_id && !e.deleted && matches_filter(e, filter))
            .collect();
        let total = matched.len() as i64;
        let rows = matched
            .into_iter()
            .skip(page.offset())
            .take(page.page_size)
            .cloned()
            .collect();
        Ok((rows, total))
    }

    async fn update_experiment(
        &self,
        space_id: i64,
        expt_id: i64,
        update: &ExperimentUpdate,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        if let Some(name) = &update.name {
            let name_taken = tables.experiments.values().any(|e| {
                e.space_id == space_id && !e.deleted && e.id != expt_id && &e.name == name
            });
            if name_taken {
                return Err(Error::new(ErrorDetails::ExperimentNameExisted {
                    name: name.clone(),
                }));
            }
        }
        let expt = tables
            .experiments
            .get_mut(&expt_id)
            .filter(|e| e.space_id == space_id && !e.deleted)
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("experiment {expt_id}"),
                })
            })?;
        let ExperimentUpdate {
            name,
            description,
            status,
            status_message,
            latest_run_id,
            credit_cost,
            start_at,
            end_at,
            updated_by,
        } = update;
        if let Some(name) = name {
            expt.name.clone_from(name);
        }
        if let Some(description) = description {
            expt.description.clone_from(description);
        }
        if let Some(status) = status {
            expt.status = *status;
        }
        if let Some(status_message) = status_message {
            expt.status_message.clone_from(status_message);
        }
        if let Some(latest_run_id) = latest_run_id {
            expt.latest_run_id = *latest_run_id;
        }
        if let Some(credit_cost) = credit_cost {
            expt.credit_cost = *credit_cost;
        }
        if start_at.is_some() {
            expt.start_at = *start_at;
        }
        if end_at.is_some() {
            expt.end_at = *end_at;
        }
        if let Some(updated_by) = updated_by {
            expt.updated_by.clone_from(updated_by);
        }
        expt.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn delete_experiment(&self, space_id: i64, expt_id: i64) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        if let Some(expt) = tables
            .experiments
            .get_mut(&expt_id)
            .filter(|e| e.space_id == space_id)
        {
            expt.deleted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl ExptRunLogQueries for InMemoryDatabase {
    async fn create_run_log(&self, run_log: &ExptRunLog) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let mut row = run_log.clone();
        row.created_at = Some(Utc::now());
        tables
            .run_logs
            .insert((run_log.expt_id, run_log.expt_run_id), row);
        Ok(())
    }

    async fn get_run_log(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
    ) -> Result<Option<ExptRunLog>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .run_logs
            .get(&(expt_id, expt_run_id))
            .filter(|r| r.space_id == space_id)
            .cloned())
    }

    async fn update_run_log(&self, run_log: &ExptRunLog) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let mut row = run_log.clone();
        row.updated_at = Some(Utc::now());
        tables
            .run_logs
            .insert((run_log.expt_id, run_log.expt_run_id), row);
        Ok(())
    }
}

#[async_trait]
impl ExptItemResultQueries for InMemoryDatabase {
    async fn batch_create_nx_item_results(
        &self,
        results: &[ExptItemResult],
    ) -> Result<usize, Error> {
        let mut tables = self.tables.write().await;
        let mut inserted = 0;
        for result in results {
            let key = (result.expt_id, result.item_id);
            if !tables.item_results.contains_key(&key) {
                tables.item_results.insert(key, result.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_item_results(
        &self,
        space_id: i64,
        expt_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<ExptItemResult>, Error> {
        let tables = self.tables.read().await;
        Ok(item_ids
            .iter()
            .filter_map(|item_id| tables.item_results.get(&(expt_id, *item_id)))
            .filter(|r| r.space_id == space_id)
            .cloned()
            .collect())
    }

    async fn list_item_results(
        &self,
        space_id: i64,
        expt_id: i64,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ExptItemResult>, Error> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ExptItemResult> = tables
            .item_results
            .range((expt_id, i64::MIN)..=(expt_id, i64::MAX))
            .map(|(_, r)| r)
            .filter(|r| r.space_id == space_id && r.item_idx > cursor)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.item_idx);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn update_item_results_status(
        &self,
        space_id: i64,
        expt_id: i64,
        item_ids: &[i64],
        status: ItemRunState,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        for item_id in item_ids {
            if let Some(row) = tables
                .item_results
                .get_mut(&(expt_id, *item_id))
                .filter(|r| r.space_id == space_id)
            {
                row.status = status;
            }
        }
        Ok(())
    }

    async fn update_item_result(&self, result: &ExptItemResult) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables
            .item_results
            .insert((result.expt_id, result.item_id), result.clone());
        Ok(())
    }

    async fn get_max_item_idx(&self, space_id: i64, expt_id: i64) -> Result<Option<i64>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .item_results
            .range((expt_id, i64::MIN)..=(expt_id, i64::MAX))
            .map(|(_, r)| r)
            .filter(|r| r.space_id == space_id)
            .map(|r| r.item_idx)
            .max())
    }

    async fn batch_create_nx_item_run_logs(
        &self,
        logs: &[ExptItemResultRunLog],
    ) -> Result<usize, Error> {
        let mut tables = self.tables.write().await;
        let mut inserted = 0;
        for log in logs {
            let key = (log.expt_id, log.expt_run_id, log.item_id);
            if !tables.item_run_logs.contains_key(&key) {
                let mut row = log.clone();
                row.updated_at = Some(Utc::now());
                tables.item_run_logs.insert(key, row);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn scan_item_run_logs(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        states: &[ItemRunState],
        limit: Option<usize>,
    ) -> Result<Vec<ExptItemResultRunLog>, Error> {
        let tables = self.tables.read().await;
        let rows = tables
            .item_run_logs
            .range((expt_id, expt_run_id, i64::MIN)..=(expt_id, expt_run_id, i64::MAX))
            .map(|(_, log)| log)
            .filter(|log| log.space_id == space_id && states.contains(&log.status))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn update_item_run_logs_status(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        item_ids: &[i64],
        status: ItemRunState,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        for item_id in item_ids {
            if let Some(log) = tables
                .item_run_logs
                .get_mut(&(expt_id, expt_run_id, *item_id))
                .filter(|log| log.space_id == space_id)
            {
                log.status = status;
                log.updated_at = Some(now);
            }
        }
        Ok(())
    }

    async fn claim_item_run_logs(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        scanned: &[ExptItemResultRunLog],
    ) -> Result<Vec<i64>, Error> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut claimed = Vec::with_capacity(scanned.len());
        for seen in scanned {
            let Some(log) = tables
                .item_run_logs
                .get_mut(&(expt_id, expt_run_id, seen.item_id))
                .filter(|log| log.space_id == space_id)
            else {
                continue;
            };
            if log.status != seen.status || log.updated_at != seen.updated_at {
                continue;
            }
            log.status = ItemRunState::Processing;
            log.updated_at = Some(now);
            claimed.push(seen.item_id);
        }
        Ok(claimed)
    }

    async fn update_item_run_log(&self, log: &ExptItemResultRunLog) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let mut row = log.clone();
        row.updated_at = Some(Utc::now());
        tables
            .item_run_logs
            .insert((log.expt_id, log.expt_run_id, log.item_id), row);
        Ok(())
    }
}

#[async_trait]
impl ExptTurnResultQueries for InMemoryDatabase {
    async fn batch_create_nx_turn_results(
        &self,
        results: &[ExptTurnResult],
    ) -> Result<usize, Error> {
        let mut tables = self.tables.write().await;
        let mut inserted = 0;
        for result in results {
            let key = (result.expt_id, result.item_id, result.turn_id);
            if !tables.turn_results.contains_key(&key) {
                tables.turn_results.insert(key, result.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_turn_results(
        &self,
        space_id: i64,
        expt_id: i64,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ExptTurnResult>, Error> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ExptTurnResult> = tables
            .turn_results
            .range((expt_id, i64::MIN, i64::MIN)..=(expt_id, i64::MAX, i64::MAX))
            .map(|(_, r)| r)
            .filter(|r| r.space_id == space_id && r.id > cursor)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_item_turn_results(
        &self,
        space_id: i64,
        expt_id: i64,
        item_id: i64,
    ) -> Result<Vec<ExptTurnResult>, Error> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ExptTurnResult> = tables
            .turn_results
            .range((expt_id, item_id, i64::MIN)..=(expt_id, item_id, i64::MAX))
            .map(|(_, r)| r)
            .filter(|r| r.space_id == space_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.turn_idx);
        Ok(rows)
    }

    async fn update_turn_results_status(
        &self,
        space_id: i64,
        expt_id: i64,
        item_turn_ids: &[ItemTurnId],
        status: ItemRunState,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        for id in item_turn_ids {
            if let Some(row) = tables
                .turn_results
                .get_mut(&(expt_id, id.item_id, id.turn_id))
                .filter(|r| r.space_id == space_id)
            {
                row.status = status;
            }
        }
        Ok(())
    }

    async fn update_turn_result(&self, result: &ExptTurnResult) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables.turn_results.insert(
            (result.expt_id, result.item_id, result.turn_id),
            result.clone(),
        );
        Ok(())
    }

    async fn batch_create_turn_evaluator_refs(
        &self,
        refs: &[ExptTurnEvaluatorResultRef],
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        for new_ref in refs {
            // A re-run of the turn points the ref at the newest record.
            tables.turn_evaluator_refs.retain(|r| {
                !(r.expt_id == new_ref.expt_id
                    && r.turn_id == new_ref.turn_id
                    && r.item_id == new_ref.item_id
                    && r.evaluator_version_id == new_ref.evaluator_version_id)
            });
            tables.turn_evaluator_refs.push(new_ref.clone());
        }
        Ok(())
    }

    async fn list_turn_evaluator_refs(
        &self,
        space_id: i64,
        expt_id: i64,
        evaluator_version_id: i64,
    ) -> Result<Vec<ExptTurnEvaluatorResultRef>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .turn_evaluator_refs
            .iter()
            .filter(|r| {
                r.space_id == space_id
                    && r.expt_id == expt_id
                    && r.evaluator_version_id == evaluator_version_id
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExptStatsQueries for InMemoryDatabase {
    async fn create_stats(&self, stats: &ExptStats) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables.stats.insert(stats.expt_id, stats.clone());
        Ok(())
    }

    async fn get_stats(&self, space_id: i64, expt_id: i64) -> Result<Option<ExptStats>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .stats
            .get(&expt_id)
            .filter(|s| s.space_id == space_id)
            .cloned())
    }

    async fn mget_stats(&self, space_id: i64, expt_ids: &[i64]) -> Result<Vec<ExptStats>, Error> {
        let tables = self.tables.read().await;
        Ok(expt_ids
            .iter()
            .filter_map(|id| tables.stats.get(id))
            .filter(|s| s.space_id == space_id)
            .cloned()
            .collect())
    }

    async fn update_stats(&self, stats: &ExptStats) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let mut row = stats.clone();
        if let Some(existing) = tables.stats.get(&stats.expt_id) {
            row.id = existing.id;
        }
        row.updated_at = Some(Utc::now());
        tables.stats.insert(stats.expt_id, row);
        Ok(())
    }

    async fn incr_pending_turn_cnt(
        &self,
        space_id: i64,
        expt_id: i64,
        pending_delta: i64,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let row = tables.stats.entry(expt_id).or_insert_with(|| ExptStats {
            space_id,
            expt_id,
            ..Default::default()
        });
        row.pending_turn_cnt += pending_delta;
        row.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl ExptAggrResultQueries for InMemoryDatabase {
    async fn batch_create_aggr_results(&self, rows: &[ExptAggrResult]) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        for row in rows {
            let key = (row.expt_id, row.field_type, row.field_key.clone());
            match tables.aggr_results.get_mut(&key) {
                Some(existing) => {
                    existing.score = row.score;
                    existing.aggr_result.clone_from(&row.aggr_result);
                    existing.updated_at = Some(now);
                }
                None => {
                    let mut new_row = row.clone();
                    new_row.created_at = Some(now);
                    new_row.updated_at = Some(now);
                    tables.aggr_results.insert(key, new_row);
                }
            }
        }
        Ok(())
    }

    async fn get_aggr_result(
        &self,
        space_id: i64,
        expt_id: i64,
        field_type: FieldType,
        field_key: &str,
    ) -> Result<Option<ExptAggrResult>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .aggr_results
            .get(&(expt_id, field_type, field_key.to_string()))
            .filter(|r| r.space_id == space_id)
            .cloned())
    }

    async fn batch_get_aggr_results_by_expt_ids(
        &self,
        space_id: i64,
        expt_ids: &[i64],
    ) -> Result<Vec<ExptAggrResult>, Error> {
        let tables = self.tables.read().await;
        let wanted: HashSet<i64> = expt_ids.iter().copied().collect();
        let mut rows: Vec<ExptAggrResult> = tables
            .aggr_results
            .values()
            .filter(|r| r.space_id == space_id && wanted.contains(&r.expt_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.expt_id, &a.field_key).cmp(&(b.expt_id, &b.field_key)));
        Ok(rows)
    }

    async fn update_and_get_latest_version(
        &self,
        space_id: i64,
        expt_id: i64,
        field_type: FieldType,
        field_key: &str,
    ) -> Result<i64, Error> {
        let mut tables = self.tables.write().await;
        let row = tables
            .aggr_results
            .get_mut(&(expt_id, field_type, field_key.to_string()))
            .filter(|r| r.space_id == space_id)
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("aggregate result {expt_id}/{field_type}/{field_key}"),
                })
            })?;
        row.version += 1;
        Ok(row.version)
    }

    async fn update_aggr_result_by_version(
        &self,
        row: &ExptAggrResult,
        version: i64,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .aggr_results
            .get_mut(&(row.expt_id, row.field_type, row.field_key.clone()))
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!(
                        "aggregate result {}/{}/{}",
                        row.expt_id, row.field_type, row.field_key
                    ),
                })
            })?;
        if existing.version != version {
            return Err(Error::new(ErrorDetails::AggrResultVersionConflict {
                expt_id: row.expt_id,
                field_key: row.field_key.clone(),
                version,
            }));
        }
        existing.score = row.score;
        existing.aggr_result.clone_from(&row.aggr_result);
        existing.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl EvaluatorRecordQueries for InMemoryDatabase {
    async fn create_evaluator_record(&self, record: &EvaluatorRecord) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let mut row = record.clone();
        let now = Utc::now();
        row.created_at = Some(now);
        row.updated_at = Some(now);
        tables.evaluator_records.insert(record.id, row);
        Ok(())
    }

    async fn get_evaluator_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvaluatorRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .evaluator_records
            .get(&record_id)
            .filter(|r| r.space_id == space_id)
            .cloned())
    }

    async fn batch_get_evaluator_records(
        &self,
        space_id: i64,
        record_ids: &[i64],
    ) -> Result<Vec<EvaluatorRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(record_ids
            .iter()
            .filter_map(|id| tables.evaluator_records.get(id))
            .filter(|r| r.space_id == space_id)
            .cloned()
            .collect())
    }

    async fn update_evaluator_record_correction(
        &self,
        space_id: i64,
        record_id: i64,
        correction: &Correction,
        updated_by: &str,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let record = tables
            .evaluator_records
            .get_mut(&record_id)
            .filter(|r| r.space_id == space_id)
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("evaluator record {record_id}"),
                })
            })?;
        let result = record
            .evaluator_output_data
            .evaluator_result
            .get_or_insert_with(Default::default);
        result.correction = Some(correction.clone());
        record.updated_by = updated_by.to_string();
        record.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl EvalTargetQueries for InMemoryDatabase {
    async fn create_eval_target(&self, target: &EvalTarget) -> Result<(i64, i64), Error> {
        let mut tables = self.tables.write().await;
        let version = target.eval_target_version.as_ref().ok_or_else(|| {
            Error::new(ErrorDetails::InvalidParam {
                message: "eval target has no version".to_string(),
            })
        })?;
        if let Some(existing) = tables.targets_by_version.values().find(|t| {
            t.space_id == target.space_id
                && t.source_target_id == target.source_target_id
                && t.eval_target_type == target.eval_target_type
                && t.eval_target_version
                    .as_ref()
                    .is_some_and(|v| v.source_target_version == version.source_target_version)
        }) {
            let version_id = existing.eval_target_version.as_ref().map_or(0, |v| v.id);
            return Ok((existing.id, version_id));
        }
        // Reuse the target id across versions of the same source.
        let target_id = tables
            .targets_by_version
            .values()
            .find(|t| {
                t.space_id == target.space_id
                    && t.source_target_id == target.source_target_id
                    && t.eval_target_type == target.eval_target_type
            })
            .map(|t| t.id);
        let target_id = match target_id {
            Some(id) => id,
            None if target.id != 0 => target.id,
            None => {
                tables.next_target_id += 1;
                tables.next_target_id
            }
        };
        let mut row = target.clone();
        row.id = target_id;
        let mut version_row = version.clone();
        version_row.target_id = target_id;
        version_row.created_at = Some(Utc::now());
        let version_id = version_row.id;
        row.eval_target_version = Some(version_row);
        tables.targets_by_version.insert(version_id, row);
        Ok((target_id, version_id))
    }

    async fn get_eval_target_by_source(
        &self,
        space_id: i64,
        source_target_id: &str,
        source_target_version: &str,
        target_type: EvalTargetType,
    ) -> Result<Option<EvalTarget>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .targets_by_version
            .values()
            .find(|t| {
                t.space_id == space_id
                    && t.source_target_id == source_target_id
                    && t.eval_target_type == target_type
                    && t.eval_target_version
                        .as_ref()
                        .is_some_and(|v| v.source_target_version == source_target_version)
            })
            .cloned())
    }

    async fn get_eval_target_version(
        &self,
        space_id: i64,
        version_id: i64,
    ) -> Result<Option<EvalTarget>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .targets_by_version
            .get(&version_id)
            .filter(|t| t.space_id == space_id)
            .cloned())
    }

    async fn batch_get_eval_target_versions(
        &self,
        space_id: i64,
        version_ids: &[i64],
    ) -> Result<Vec<EvalTarget>, Error> {
        let tables = self.tables.read().await;
        Ok(version_ids
            .iter()
            .filter_map(|id| tables.targets_by_version.get(id))
            .filter(|t| t.space_id == space_id)
            .cloned()
            .collect())
    }

    async fn create_target_record(&self, record: &EvalTargetRecord) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let mut row = record.clone();
        row.created_at = Some(Utc::now());
        tables.target_records.insert(record.id, row);
        Ok(())
    }

    async fn get_target_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvalTargetRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .target_records
            .get(&record_id)
            .filter(|r| r.space_id == space_id)
            .cloned())
    }
}

#[async_trait]
impl AnnotationQueries for InMemoryDatabase {
    async fn create_annotate_record(
        &self,
        record: &AnnotateRecord,
        turn_ref: &ExptTurnAnnotateRecordRef,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables.annotate_records.insert(record.id, record.clone());
        tables.annotate_refs.retain(|r| {
            !(r.expt_id == turn_ref.expt_id
                && r.item_id == turn_ref.item_id
                && r.turn_id == turn_ref.turn_id
                && r.tag_key_id == turn_ref.tag_key_id)
        });
        tables.annotate_refs.push(turn_ref.clone());
        Ok(())
    }

    async fn list_annotate_tag_key_ids(
        &self,
        space_id: i64,
        expt_id: i64,
    ) -> Result<Vec<i64>, Error> {
        let tables = self.tables.read().await;
        let mut ids: Vec<i64> = tables
            .annotate_refs
            .iter()
            .filter(|r| r.space_id == space_id && r.expt_id == expt_id)
            .map(|r| r.tag_key_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn list_turn_annotate_refs(
        &self,
        space_id: i64,
        expt_id: i64,
        tag_key_id: i64,
    ) -> Result<Vec<ExptTurnAnnotateRecordRef>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .annotate_refs
            .iter()
            .filter(|r| {
                r.space_id == space_id && r.expt_id == expt_id && r.tag_key_id == tag_key_id
            })
            .cloned()
            .collect())
    }

    async fn batch_get_annotate_records(
        &self,
        space_id: i64,
        record_ids: &[i64],
    ) -> Result<Vec<AnnotateRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(record_ids
            .iter()
            .filter_map(|id| tables.annotate_records.get(id))
            .filter(|r| r.space_id == space_id)
            .cloned()
            .collect())
    }
}
