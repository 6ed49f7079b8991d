//! Experiment-level aggregates over evaluator scores and annotations.
//!
//! Rows are keyed by `(expt_id, field_type, field_key)`: `field_key` is the evaluator version id
//! for `EvaluatorScore` fields and the tag key id for `Annotation` fields. Updates recompute a
//! field from scratch and write under optimistic concurrency on the row's `version`.

pub mod aggregator;

use std::collections::HashMap;
use std::sync::Arc;

use experiment_core::db::ExptDatabase;
use experiment_core::entity::{
    AggregateResult, AnnotationAggregateResult, CalculateMode, EvaluatorAggregateResult,
    ExptAggrCalculateEvent, ExptAggrResult, ExptAggregateResult, FieldType, ReadConsistency,
    TagInfo,
};
use experiment_core::error::{Error, ErrorDetails};
use experiment_core::observability::METRIC_AGGR_CALCULATE_TOTAL;
use experiment_core::rpc::{EvaluatorService, TagService};
use experiment_core::utils::id::IdGenerator;
use tracing::instrument;

pub use aggregator::{AggregatorGroup, BasicAggregator, DistributionAggregator};

#[derive(Clone, Debug)]
pub struct UpdateExptAggrResultParam {
    pub space_id: i64,
    pub experiment_id: i64,
    pub field_type: FieldType,
    pub field_key: String,
}

/// A freshly computed field, ready to be persisted.
struct ComputedField {
    field_type: FieldType,
    field_key: String,
    result: AggregateResult,
}

pub struct ExptAggrResultService {
    db: Arc<dyn ExptDatabase>,
    evaluators: Arc<dyn EvaluatorService>,
    tags: Arc<dyn TagService>,
    id_gen: Arc<dyn IdGenerator>,
}

fn emit_calculate_metric(mode: &'static str, space_id: i64, result: &Result<(), Error>) {
    metrics::counter!(
        METRIC_AGGR_CALCULATE_TOTAL,
        "mode" => mode,
        "space_id" => space_id.to_string(),
        "is_error" => result.is_err().to_string(),
    )
    .increment(1);
}

impl ExptAggrResultService {
    pub fn new(
        db: Arc<dyn ExptDatabase>,
        evaluators: Arc<dyn EvaluatorService>,
        tags: Arc<dyn TagService>,
        id_gen: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            db,
            evaluators,
            tags,
            id_gen,
        }
    }

    /// Entry point of the aggregate calculation consumer.
    pub async fn calculate(&self, event: &ExptAggrCalculateEvent) -> Result<(), Error> {
        match (event.calculate_mode, &event.specific_field) {
            (CalculateMode::CreateAllFields, _) => {
                self.create_expt_aggr_result(event.space_id, event.expt_id)
                    .await
            }
            (CalculateMode::UpdateSpecificField, Some(field)) => {
                self.update_expt_aggr_result(&UpdateExptAggrResultParam {
                    space_id: event.space_id,
                    experiment_id: event.expt_id,
                    field_type: field.field_type,
                    field_key: field.field_key.clone(),
                })
                .await
            }
            (CalculateMode::UpdateSpecificField, None) => {
                Err(Error::new(ErrorDetails::InvalidParam {
                    message: format!(
                        "update event for experiment {} carries no field",
                        event.expt_id
                    ),
                }))
            }
        }
    }

    /// Computes and persists every field of the experiment. Fields without refs are skipped.
    #[instrument(skip_all, fields(space_id = %space_id, expt_id = %expt_id))]
    pub async fn create_expt_aggr_result(&self, space_id: i64, expt_id: i64) -> Result<(), Error> {
        let result = self.create_all_fields(space_id, expt_id).await;
        emit_calculate_metric("create", space_id, &result);
        result
    }

    async fn create_all_fields(&self, space_id: i64, expt_id: i64) -> Result<(), Error> {
        let expt = self
            .db
            .get_experiment(space_id, expt_id, ReadConsistency::Primary)
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::ResourceNotFound {
                    message: format!("experiment {expt_id}"),
                })
            })?;

        let mut computed = Vec::new();
        for evaluator_version_id in expt.evaluator_version_ids() {
            if let Some(field) = self
                .compute_evaluator_field(space_id, expt_id, evaluator_version_id)
                .await?
            {
                computed.push(field);
            }
        }
        let tag_key_ids = self.db.list_annotate_tag_key_ids(space_id, expt_id).await?;
        if !tag_key_ids.is_empty() {
            let tags = self.tags.batch_get_tags(space_id, &tag_key_ids).await?;
            for tag in &tags {
                if let Some(field) = self.compute_annotation_field(space_id, expt_id, tag).await? {
                    computed.push(field);
                }
            }
        }
        if computed.is_empty() {
            tracing::debug!("No score refs yet, skipping aggregate creation");
            return Ok(());
        }

        let ids = self.id_gen.gen_multi_ids(computed.len())?;
        let rows = computed
            .into_iter()
            .zip(ids)
            .map(|(field, id)| to_row(space_id, expt_id, id, field))
            .collect::<Result<Vec<_>, Error>>()?;
        self.db.batch_create_aggr_results(&rows).await
    }

    /// Recomputes one field after a correction or a late annotation.
    #[instrument(skip_all, fields(space_id = %param.space_id, expt_id = %param.experiment_id, field_key = %param.field_key))]
    pub async fn update_expt_aggr_result(
        &self,
        param: &UpdateExptAggrResultParam,
    ) -> Result<(), Error> {
        let result = self.update_field(param).await;
        emit_calculate_metric("update", param.space_id, &result);
        result
    }

    async fn update_field(&self, param: &UpdateExptAggrResultParam) -> Result<(), Error> {
        let UpdateExptAggrResultParam {
            space_id,
            experiment_id,
            field_type,
            field_key,
        } = param;
        let (space_id, expt_id, field_type) = (*space_id, *experiment_id, *field_type);
        let field_id: i64 = field_key.parse().map_err(|_| {
            Error::new(ErrorDetails::InvalidParam {
                message: format!("invalid {field_type} field key `{field_key}`"),
            })
        })?;

        let existing = self
            .db
            .get_aggr_result(space_id, expt_id, field_type, field_key)
            .await?;
        if existing.is_none() {
            let expt = self
                .db
                .get_experiment(space_id, expt_id, ReadConsistency::Primary)
                .await?;
            let finished = expt.is_some_and(|e| e.status.is_finished());
            if !finished {
                // The creation pass at experiment completion will pick this field up.
                tracing::debug!("Aggregate row absent for running experiment, ignoring update");
                return Ok(());
            }
            return Err(Error::new(ErrorDetails::ResourceNotFound {
                message: format!("aggregate result {expt_id}/{field_type}/{field_key}"),
            }));
        }

        let version = self
            .db
            .update_and_get_latest_version(space_id, expt_id, field_type, field_key)
            .await?;
        let computed = match field_type {
            FieldType::EvaluatorScore => {
                self.compute_evaluator_field(space_id, expt_id, field_id)
                    .await?
            }
            FieldType::Annotation => {
                let tags = self.tags.batch_get_tags(space_id, &[field_id]).await?;
                let tag = tags.into_iter().next().ok_or_else(|| {
                    Error::new(ErrorDetails::ResourceNotFound {
                        message: format!("tag {field_id}"),
                    })
                })?;
                self.compute_annotation_field(space_id, expt_id, &tag)
                    .await?
            }
        };
        let Some(field) = computed else {
            return Ok(());
        };
        let row = to_row(space_id, expt_id, 0, field)?;
        self.db.update_aggr_result_by_version(&row, version).await
    }

    async fn compute_evaluator_field(
        &self,
        space_id: i64,
        expt_id: i64,
        evaluator_version_id: i64,
    ) -> Result<Option<ComputedField>, Error> {
        let refs = self
            .db
            .list_turn_evaluator_refs(space_id, expt_id, evaluator_version_id)
            .await?;
        if refs.is_empty() {
            return Ok(None);
        }
        let record_ids: Vec<i64> = refs.iter().map(|r| r.evaluator_result_id).collect();
        let records = self
            .db
            .batch_get_evaluator_records(space_id, &record_ids)
            .await?;
        let mut group = AggregatorGroup::for_evaluator_scores();
        for score in records.iter().filter_map(|r| r.effective_score()) {
            group.append_score(score);
        }
        Ok(Some(ComputedField {
            field_type: FieldType::EvaluatorScore,
            field_key: evaluator_version_id.to_string(),
            result: group.result(),
        }))
    }

    async fn compute_annotation_field(
        &self,
        space_id: i64,
        expt_id: i64,
        tag: &TagInfo,
    ) -> Result<Option<ComputedField>, Error> {
        let Some(mut group) = AggregatorGroup::for_tag(tag.content_type) else {
            return Ok(None);
        };
        let refs = self
            .db
            .list_turn_annotate_refs(space_id, expt_id, tag.tag_key_id)
            .await?;
        if refs.is_empty() {
            return Ok(None);
        }
        let record_ids: Vec<i64> = refs.iter().map(|r| r.annotate_record_id).collect();
        let records = self
            .db
            .batch_get_annotate_records(space_id, &record_ids)
            .await?;
        for record in &records {
            if let Some(score) = record.annotate_data.score {
                group.append_score(score);
            }
            if let Some(tag_value_id) = record.tag_value_id {
                group.append_option(tag_value_id);
            }
        }
        Ok(Some(ComputedField {
            field_type: FieldType::Annotation,
            field_key: tag.tag_key_id.to_string(),
            result: group.result(),
        }))
    }

    /// Aggregates of several experiments, joined with evaluator and tag metadata.
    #[instrument(skip_all, fields(space_id = %space_id))]
    pub async fn batch_get_expt_aggr_result_by_experiment_ids(
        &self,
        space_id: i64,
        expt_ids: &[i64],
    ) -> Result<HashMap<i64, ExptAggregateResult>, Error> {
        let rows = self
            .db
            .batch_get_aggr_results_by_expt_ids(space_id, expt_ids)
            .await?;
        if rows.is_empty() {
            return Ok(HashMap::new());
        }

        let mut evaluator_version_ids = Vec::new();
        let mut tag_key_ids = Vec::new();
        for row in &rows {
            let Ok(id) = row.field_key.parse::<i64>() else {
                continue;
            };
            match row.field_type {
                FieldType::EvaluatorScore => evaluator_version_ids.push(id),
                FieldType::Annotation => tag_key_ids.push(id),
            }
        }
        evaluator_version_ids.sort_unstable();
        evaluator_version_ids.dedup();
        tag_key_ids.sort_unstable();
        tag_key_ids.dedup();

        let evaluators: HashMap<i64, (String, String)> = if evaluator_version_ids.is_empty() {
            HashMap::new()
        } else {
            self.evaluators
                .batch_get_evaluators_by_version_ids(space_id, &evaluator_version_ids)
                .await?
                .into_iter()
                .filter_map(|e| {
                    let version_id = e.evaluator_version_id()?;
                    let version = e.version().unwrap_or_default().to_string();
                    Some((version_id, (e.name, version)))
                })
                .collect()
        };
        let tag_names: HashMap<i64, String> = if tag_key_ids.is_empty() {
            HashMap::new()
        } else {
            self.tags
                .batch_get_tags(space_id, &tag_key_ids)
                .await?
                .into_iter()
                .map(|t| (t.tag_key_id, t.tag_key_name))
                .collect()
        };

        let mut results: HashMap<i64, ExptAggregateResult> = HashMap::new();
        for row in rows {
            let Ok(field_id) = row.field_key.parse::<i64>() else {
                tracing::warn!(
                    field_key = %row.field_key,
                    "Skipping aggregate row with malformed field key"
                );
                continue;
            };
            let aggregate: AggregateResult = serde_json::from_str(&row.aggr_result)?;
            let entry = results
                .entry(row.expt_id)
                .or_insert_with(|| ExptAggregateResult {
                    experiment_id: row.expt_id,
                    ..Default::default()
                });
            match row.field_type {
                FieldType::EvaluatorScore => {
                    let meta = evaluators.get(&field_id);
                    entry.evaluator_results.insert(
                        field_id,
                        EvaluatorAggregateResult {
                            evaluator_version_id: field_id,
                            name: meta.map(|(name, _)| name.clone()),
                            version: meta.map(|(_, version)| version.clone()),
                            aggregator_results: aggregate.aggregator_results,
                        },
                    );
                }
                FieldType::Annotation => {
                    entry.annotation_results.insert(
                        field_id,
                        AnnotationAggregateResult {
                            tag_key_id: field_id,
                            name: tag_names.get(&field_id).cloned(),
                            aggregator_results: aggregate.aggregator_results,
                        },
                    );
                }
            }
        }
        Ok(results)
    }
}

fn to_row(
    space_id: i64,
    expt_id: i64,
    id: i64,
    field: ComputedField,
) -> Result<ExptAggrResult, Error> {
    Ok(ExptAggrResult {
        id,
        space_id,
        expt_id,
        field_type: field.field_type,
        field_key: field.field_key,
        score: field.result.average().unwrap_or_default(),
        aggr_result: serde_json::to_string(&field.result)?,
        version: 0,
        created_at: None,
        updated_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::db::memory::InMemoryDatabase;
    use experiment_core::db::{
        AnnotationQueries, EvaluatorRecordQueries, ExperimentQueries, ExptAggrResultQueries,
        ExptTurnResultQueries,
    };
    use experiment_core::entity::{
        AnnotateData, AnnotateRecord, Correction, Evaluator, EvaluatorOutputData, EvaluatorRecord,
        EvaluatorResult, EvaluatorVersionRef, Experiment, ExperimentUpdate, ExptStatus,
        ExptTurnAnnotateRecordRef, ExptTurnEvaluatorResultRef, PromptEvaluatorVersion,
        TagContentType,
    };
    use experiment_core::test_helpers::{FakeEvaluatorService, FakeTagService};
    use experiment_core::utils::id::SequentialIdGenerator;

    const SPACE: i64 = 1;
    const EXPT: i64 = 100;
    const EVALUATOR_VERSION: i64 = 500;

    async fn setup(scores: &[Option<f64>]) -> (Arc<InMemoryDatabase>, ExptAggrResultService) {
        let db = Arc::new(InMemoryDatabase::new());
        db.create_experiment(&Experiment {
            id: EXPT,
            space_id: SPACE,
            name: "aggr".to_string(),
            status: ExptStatus::Processing,
            evaluator_version_refs: vec![EvaluatorVersionRef {
                evaluator_id: 50,
                evaluator_version_id: EVALUATOR_VERSION,
            }],
            ..Default::default()
        })
        .await
        .unwrap();
        for (idx, score) in scores.iter().enumerate() {
            let idx = idx as i64;
            db.create_evaluator_record(&EvaluatorRecord {
                id: 1000 + idx,
                space_id: SPACE,
                experiment_id: EXPT,
                evaluator_version_id: EVALUATOR_VERSION,
                evaluator_output_data: EvaluatorOutputData {
                    evaluator_result: score.map(|score| EvaluatorResult {
                        score: Some(score),
                        reasoning: "r".to_string(),
                        correction: None,
                    }),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
            db.batch_create_turn_evaluator_refs(&[ExptTurnEvaluatorResultRef {
                id: 2000 + idx,
                space_id: SPACE,
                expt_id: EXPT,
                item_id: idx,
                turn_id: idx,
                evaluator_version_id: EVALUATOR_VERSION,
                evaluator_result_id: 1000 + idx,
                ..Default::default()
            }])
            .await
            .unwrap();
        }
        let evaluators = FakeEvaluatorService::new(vec![Evaluator {
            id: 50,
            space_id: SPACE,
            name: "relevance".to_string(),
            prompt_evaluator_version: Some(PromptEvaluatorVersion {
                id: EVALUATOR_VERSION,
                version: "v1".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let tags = FakeTagService::new(vec![TagInfo {
            tag_key_id: 77,
            tag_key_name: "helpful".to_string(),
            content_type: TagContentType::Boolean,
            tag_values: Vec::new(),
        }]);
        let service = ExptAggrResultService::new(
            db.clone(),
            Arc::new(evaluators),
            Arc::new(tags),
            Arc::new(SequentialIdGenerator::new(1)),
        );
        (db, service)
    }

    #[tokio::test]
    async fn test_create_skips_unscored_records() {
        let (db, service) = setup(&[Some(1.0), Some(0.5), None]).await;
        service.create_expt_aggr_result(SPACE, EXPT).await.unwrap();

        let row = db
            .get_aggr_result(SPACE, EXPT, FieldType::EvaluatorScore, "500")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.version, 0);
        assert!((row.score - 0.75).abs() < 1e-9);
        let aggregate: AggregateResult = serde_json::from_str(&row.aggr_result).unwrap();
        let sum = aggregate
            .aggregator_results
            .iter()
            .find(|r| r.aggregator_type == experiment_core::entity::AggregatorType::Sum)
            .and_then(|r| r.data.value);
        assert_eq!(sum, Some(1.5));
    }

    #[tokio::test]
    async fn test_create_without_refs_is_noop() {
        let (db, service) = setup(&[]).await;
        service.create_expt_aggr_result(SPACE, EXPT).await.unwrap();
        let rows = db
            .batch_get_aggr_results_by_expt_ids(SPACE, &[EXPT])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_update_uses_correction_score() {
        let (db, service) = setup(&[Some(1.0), Some(0.0)]).await;
        service.create_expt_aggr_result(SPACE, EXPT).await.unwrap();
        db.update_evaluator_record_correction(
            SPACE,
            1001,
            &Correction {
                score: Some(1.0),
                explain: "actually fine".to_string(),
                updated_by: "reviewer".to_string(),
            },
            "reviewer",
        )
        .await
        .unwrap();

        let param = UpdateExptAggrResultParam {
            space_id: SPACE,
            experiment_id: EXPT,
            field_type: FieldType::EvaluatorScore,
            field_key: EVALUATOR_VERSION.to_string(),
        };
        service.update_expt_aggr_result(&param).await.unwrap();
        let row = db
            .get_aggr_result(SPACE, EXPT, FieldType::EvaluatorScore, "500")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.version, 1);
        assert!((row.score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_without_row() {
        let (db, service) = setup(&[Some(1.0)]).await;
        let param = UpdateExptAggrResultParam {
            space_id: SPACE,
            experiment_id: EXPT,
            field_type: FieldType::EvaluatorScore,
            field_key: EVALUATOR_VERSION.to_string(),
        };
        // Running experiment: the completion pass will create the row.
        service.update_expt_aggr_result(&param).await.unwrap();

        db.update_experiment(
            SPACE,
            EXPT,
            &ExperimentUpdate {
                status: Some(ExptStatus::Success),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = service.update_expt_aggr_result(&param).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::ResourceNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_update_rejects_malformed_field_key() {
        let (_db, service) = setup(&[Some(1.0)]).await;
        let err = service
            .update_expt_aggr_result(&UpdateExptAggrResultParam {
                space_id: SPACE,
                experiment_id: EXPT,
                field_type: FieldType::Annotation,
                field_key: "not-an-id".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidParam { .. }));
    }

    #[tokio::test]
    async fn test_batch_get_joins_metadata() {
        let (db, service) = setup(&[Some(0.2)]).await;
        for (idx, tag_value_id) in [(0, 1), (1, 1), (2, 2)] {
            db.create_annotate_record(
                &AnnotateRecord {
                    id: 3000 + idx,
                    space_id: SPACE,
                    tag_key_id: 77,
                    experiment_id: EXPT,
                    tag_value_id: Some(tag_value_id),
                    annotate_data: AnnotateData::default(),
                    created_by: "u".to_string(),
                },
                &ExptTurnAnnotateRecordRef {
                    id: 4000 + idx,
                    space_id: SPACE,
                    expt_id: EXPT,
                    item_id: idx,
                    turn_id: idx,
                    tag_key_id: 77,
                    annotate_record_id: 3000 + idx,
                },
            )
            .await
            .unwrap();
        }
        service.create_expt_aggr_result(SPACE, EXPT).await.unwrap();

        let results = service
            .batch_get_expt_aggr_result_by_experiment_ids(SPACE, &[EXPT])
            .await
            .unwrap();
        let expt = &results[&EXPT];
        let evaluator = &expt.evaluator_results[&EVALUATOR_VERSION];
        assert_eq!(evaluator.name.as_deref(), Some("relevance"));
        assert_eq!(evaluator.version.as_deref(), Some("v1"));
        let annotation = &expt.annotation_results[&77];
        assert_eq!(annotation.name.as_deref(), Some("helpful"));
        let options = annotation.aggregator_results[0]
            .data
            .option_distribution
            .clone()
            .unwrap();
        assert_eq!(options.items[0].option, "1");
        assert_eq!(options.items[0].count, 2);
    }
}
