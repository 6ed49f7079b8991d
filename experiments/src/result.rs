//! Writes of item, turn and evaluator results, and the stats derived from them.

use std::sync::Arc;
use std::time::Duration;

use experiment_core::bus::ExptEventPublisher;
use experiment_core::db::ExptDatabase;
use experiment_core::entity::{
    Correction, EvaluationSetItem, EvaluatorRecord, EvaluatorRecordCorrectionEvent,
    ExptCalculateStats, ExptItemResult, ExptItemResultRunLog, ExptStats,
    ExptTurnEvaluatorResultRef, ExptTurnResult, ItemRunState, ItemTurnId, Session,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::utils::id::IdGenerator;
use tracing::instrument;

pub const STATS_PAGE_SIZE: usize = 100;
pub const STATS_PAGE_INTERVAL: Duration = Duration::from_millis(30);
pub const STATS_MAX_LOOPS: usize = 10_000;

/// Fresh `Queueing` rows for items entering an experiment run.
#[derive(Clone, Debug, Default)]
pub struct QueueingRows {
    pub items: Vec<ExptItemResult>,
    pub turns: Vec<ExptTurnResult>,
    pub run_logs: Vec<ExptItemResultRunLog>,
}

/// Builds item, turn and run-log rows for `items`, numbering them from `start_idx`.
pub fn queueing_rows(
    space_id: i64,
    expt_id: i64,
    expt_run_id: i64,
    items: &[&EvaluationSetItem],
    start_idx: i64,
    id_gen: &dyn IdGenerator,
) -> Result<QueueingRows, Error> {
    let turn_cnt: usize = items.iter().map(|item| item.turns.len()).sum();
    let mut ids = id_gen.gen_multi_ids(items.len() * 2 + turn_cnt)?.into_iter();
    let mut next_id = || {
        ids.next().ok_or_else(|| {
            Error::new(ErrorDetails::CommonInternal {
                message: "id generator returned too few ids".to_string(),
            })
        })
    };
    let mut rows = QueueingRows::default();
    for (item_idx, item) in (start_idx..).zip(items) {
        rows.items.push(ExptItemResult {
            id: next_id()?,
            space_id,
            expt_id,
            item_id: item.item_id,
            item_idx,
            status: ItemRunState::Queueing,
            ..Default::default()
        });
        rows.run_logs.push(ExptItemResultRunLog {
            id: next_id()?,
            space_id,
            expt_id,
            expt_run_id,
            item_id: item.item_id,
            status: ItemRunState::Queueing,
            ..Default::default()
        });
        for (turn_idx, turn) in (0..).zip(&item.turns) {
            rows.turns.push(ExptTurnResult {
                id: next_id()?,
                space_id,
                expt_id,
                item_id: item.item_id,
                turn_id: turn.id,
                turn_idx,
                status: ItemRunState::Queueing,
                ..Default::default()
            });
        }
    }
    Ok(rows)
}

pub struct ExptResultService {
    db: Arc<dyn ExptDatabase>,
    publisher: Arc<dyn ExptEventPublisher>,
}

impl ExptResultService {
    pub fn new(db: Arc<dyn ExptDatabase>, publisher: Arc<dyn ExptEventPublisher>) -> Self {
        Self { db, publisher }
    }

    /// Inserts the rows that do not exist yet and returns how many turn rows were new.
    pub async fn create_nx(&self, rows: &QueueingRows) -> Result<usize, Error> {
        self.db.batch_create_nx_item_results(&rows.items).await?;
        let inserted = self.db.batch_create_nx_turn_results(&rows.turns).await?;
        self.db.batch_create_nx_item_run_logs(&rows.run_logs).await?;
        Ok(inserted)
    }

    pub async fn update_items_status(
        &self,
        space_id: i64,
        expt_id: i64,
        item_ids: &[i64],
        status: ItemRunState,
    ) -> Result<(), Error> {
        if item_ids.is_empty() {
            return Ok(());
        }
        self.db
            .update_item_results_status(space_id, expt_id, item_ids, status)
            .await
    }

    pub async fn update_turns_status(
        &self,
        space_id: i64,
        expt_id: i64,
        item_turn_ids: &[ItemTurnId],
        status: ItemRunState,
    ) -> Result<(), Error> {
        if item_turn_ids.is_empty() {
            return Ok(());
        }
        self.db
            .update_turn_results_status(space_id, expt_id, item_turn_ids, status)
            .await
    }

    pub async fn update_run_logs_status(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        item_ids: &[i64],
        status: ItemRunState,
    ) -> Result<(), Error> {
        if item_ids.is_empty() {
            return Ok(());
        }
        self.db
            .update_item_run_logs_status(space_id, expt_id, expt_run_id, item_ids, status)
            .await
    }

    /// Claims scanned run logs for dispatch. Returns the item ids this caller now owns.
    pub async fn claim_run_logs(
        &self,
        space_id: i64,
        expt_id: i64,
        expt_run_id: i64,
        scanned: &[ExptItemResultRunLog],
    ) -> Result<Vec<i64>, Error> {
        if scanned.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .claim_item_run_logs(space_id, expt_id, expt_run_id, scanned)
            .await
    }

    /// Persists one evaluator run and points the turn at it.
    pub async fn save_evaluator_result(
        &self,
        record: &EvaluatorRecord,
        turn_ref: &ExptTurnEvaluatorResultRef,
    ) -> Result<(), Error> {
        self.db.create_evaluator_record(record).await?;
        self.db
            .batch_create_turn_evaluator_refs(std::slice::from_ref(turn_ref))
            .await
    }

    /// Counts turn states by paging over every turn result of the experiment.
    /// Pages are spaced out to keep the scan off the hot path of the store.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id))]
    pub async fn calculate_stats(
        &self,
        space_id: i64,
        expt_id: i64,
    ) -> Result<ExptCalculateStats, Error> {
        let mut stats = ExptCalculateStats::default();
        let mut cursor = 0;
        for page in 0..STATS_MAX_LOOPS {
            if page > 0 {
                tokio::time::sleep(STATS_PAGE_INTERVAL).await;
            }
            let turns = self
                .db
                .list_turn_results(space_id, expt_id, cursor, STATS_PAGE_SIZE)
                .await?;
            for turn in &turns {
                stats.record(turn.status);
            }
            match turns.last() {
                Some(last) if turns.len() >= STATS_PAGE_SIZE => cursor = last.id,
                _ => return Ok(stats),
            }
        }
        tracing::warn!("Turn result scan hit the loop limit; stats may be partial");
        Ok(stats)
    }

    /// Ids of the experiment's turns whose state matches `filter`, in row order.
    pub async fn list_turn_ids(
        &self,
        space_id: i64,
        expt_id: i64,
        filter: impl Fn(ItemRunState) -> bool,
    ) -> Result<Vec<ItemTurnId>, Error> {
        let mut ids = Vec::new();
        let mut cursor = 0;
        for _ in 0..STATS_MAX_LOOPS {
            let turns = self
                .db
                .list_turn_results(space_id, expt_id, cursor, STATS_PAGE_SIZE)
                .await?;
            ids.extend(
                turns
                    .iter()
                    .filter(|t| filter(t.status))
                    .map(|t| ItemTurnId {
                        item_id: t.item_id,
                        turn_id: t.turn_id,
                    }),
            );
            match turns.last() {
                Some(last) if turns.len() >= STATS_PAGE_SIZE => cursor = last.id,
                _ => break,
            }
        }
        Ok(ids)
    }

    /// Recomputes the stats row from turn results, keeping the token counters.
    pub async fn recompute_stats(&self, space_id: i64, expt_id: i64) -> Result<ExptStats, Error> {
        let calculated = self.calculate_stats(space_id, expt_id).await?;
        let mut stats = self
            .db
            .get_stats(space_id, expt_id)
            .await?
            .unwrap_or_else(|| ExptStats {
                space_id,
                expt_id,
                ..Default::default()
            });
        stats.pending_turn_cnt = calculated.pending_turn_cnt;
        stats.processing_turn_cnt = calculated.processing_turn_cnt;
        stats.success_turn_cnt = calculated.success_turn_cnt;
        stats.fail_turn_cnt = calculated.fail_turn_cnt;
        stats.terminated_turn_cnt = calculated.terminated_turn_cnt;
        self.db.update_stats(&stats).await?;
        Ok(stats)
    }

    pub async fn add_token_cost(
        &self,
        space_id: i64,
        expt_id: i64,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<(), Error> {
        if input_tokens == 0 && output_tokens == 0 {
            return Ok(());
        }
        let mut stats = self
            .db
            .get_stats(space_id, expt_id)
            .await?
            .unwrap_or_else(|| ExptStats {
                space_id,
                expt_id,
                ..Default::default()
            });
        stats.input_token_cost += input_tokens;
        stats.output_token_cost += output_tokens;
        self.db.update_stats(&stats).await
    }

    /// Stores a human correction on an evaluator record and announces it so the
    /// experiment's aggregate for that evaluator is recomputed.
    #[instrument(skip_all, fields(space_id = %space_id, record_id = %record_id, user_id = %session.user_id))]
    pub async fn correct_evaluator_record(
        &self,
        space_id: i64,
        record_id: i64,
        correction: Correction,
        session: &Session,
    ) -> Result<(), Error> {
        let record = self
            .db
            .get_evaluator_record(space_id, record_id)
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("evaluator record {record_id}"),
                })
            })?;
        let correction = Correction {
            updated_by: session.user_id.clone(),
            ..correction
        };
        self.db
            .update_evaluator_record_correction(space_id, record_id, &correction, &session.user_id)
            .await?;
        self.publisher
            .publish_record_correction_event(
                &EvaluatorRecordCorrectionEvent {
                    space_id,
                    evaluator_record_id: record_id,
                    evaluator_version_id: record.evaluator_version_id,
                    experiment_id: record.experiment_id,
                    correction,
                    updated_by: session.user_id.clone(),
                },
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::bus::{InMemoryEventBus, PublishedEvent};
    use experiment_core::db::memory::InMemoryDatabase;
    use experiment_core::db::{EvaluatorRecordQueries, ExptStatsQueries, ExptTurnResultQueries};
    use experiment_core::entity::Turn;
    use experiment_core::utils::id::SequentialIdGenerator;

    fn turn(id: i64, status: ItemRunState) -> ExptTurnResult {
        ExptTurnResult {
            id,
            space_id: 1,
            expt_id: 7,
            item_id: id,
            turn_id: id,
            status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_calculate_stats_pages_through_all_turns() {
        let db = Arc::new(InMemoryDatabase::new());
        let turns: Vec<ExptTurnResult> = (1..=250)
            .map(|id| {
                let status = match id % 5 {
                    0 => ItemRunState::Fail,
                    1 => ItemRunState::Queueing,
                    2 => ItemRunState::Processing,
                    3 => ItemRunState::Terminal,
                    _ => ItemRunState::Success,
                };
                turn(id, status)
            })
            .collect();
        db.batch_create_nx_turn_results(&turns).await.unwrap();
        let service = ExptResultService::new(db.clone(), Arc::new(InMemoryEventBus::new()));

        let stats = service.calculate_stats(1, 7).await.unwrap();
        assert_eq!(
            stats,
            ExptCalculateStats {
                pending_turn_cnt: 50,
                processing_turn_cnt: 50,
                success_turn_cnt: 50,
                fail_turn_cnt: 50,
                terminated_turn_cnt: 50,
            }
        );

        service.add_token_cost(1, 7, 10, 4).await.unwrap();
        let stored = service.recompute_stats(1, 7).await.unwrap();
        assert_eq!(stored.fail_turn_cnt, 50);
        assert_eq!(stored.input_token_cost, 10);
        assert_eq!(
            db.get_stats(1, 7).await.unwrap().unwrap().success_turn_cnt,
            50
        );
    }

    #[tokio::test]
    async fn test_queueing_rows_are_created_once() {
        let db = Arc::new(InMemoryDatabase::new());
        let service = ExptResultService::new(db.clone(), Arc::new(InMemoryEventBus::new()));
        let items = [
            EvaluationSetItem {
                item_id: 100,
                turns: vec![Turn { id: 1, ..Default::default() }],
                ..Default::default()
            },
            EvaluationSetItem {
                item_id: 200,
                turns: vec![
                    Turn { id: 2, ..Default::default() },
                    Turn { id: 3, ..Default::default() },
                ],
                ..Default::default()
            },
        ];
        let refs: Vec<&EvaluationSetItem> = items.iter().collect();
        let rows = queueing_rows(1, 7, 70, &refs, 5, &SequentialIdGenerator::new(1)).unwrap();
        assert_eq!(rows.items.len(), 2);
        assert_eq!(rows.run_logs.len(), 2);
        assert_eq!(rows.turns.len(), 3);
        assert_eq!(rows.items[1].item_idx, 6);
        assert_eq!(rows.turns[2].turn_idx, 1);

        assert_eq!(service.create_nx(&rows).await.unwrap(), 3);
        assert_eq!(service.create_nx(&rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_correction_publishes_event() {
        let db = Arc::new(InMemoryDatabase::new());
        db.create_evaluator_record(&EvaluatorRecord {
            id: 3,
            space_id: 1,
            experiment_id: 7,
            evaluator_version_id: 70,
            ..Default::default()
        })
        .await
        .unwrap();
        let bus = Arc::new(InMemoryEventBus::new());
        let service = ExptResultService::new(db.clone(), bus.clone());

        service
            .correct_evaluator_record(
                1,
                3,
                Correction {
                    score: Some(0.5),
                    explain: "half right".to_string(),
                    updated_by: String::new(),
                },
                &Session::new("reviewer"),
            )
            .await
            .unwrap();

        let record = db.get_evaluator_record(1, 3).await.unwrap().unwrap();
        assert_eq!(record.effective_score(), Some(0.5));
        let deliveries = bus.drain().await;
        assert_eq!(deliveries.len(), 1);
        let PublishedEvent::RecordCorrection(event) = &deliveries[0].event else {
            panic!("expected a correction event, got {:?}", deliveries[0].event);
        };
        assert_eq!(event.evaluator_version_id, 70);
        assert_eq!(event.correction.updated_by, "reviewer");

        let err = service
            .correct_evaluator_record(1, 404, Correction::default(), &Session::new("reviewer"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::ResourceNotFound { .. }
        ));
    }
}
