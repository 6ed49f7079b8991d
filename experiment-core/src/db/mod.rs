//! Store contracts owned by the experiment engine, one trait per concern.
//!
//! `memory` provides a complete in-process backend; `valkey` implements the
//! shared-state stores (quota ledger, idempotency markers, mutexes) that must be
//! coordinated across engine replicas.

use async_trait::async_trait;

use crate::error::Error;

pub mod aggregate;
pub mod experiment;
pub mod memory;
pub mod records;
pub mod results;
pub mod shared_state;
pub mod valkey;

pub use aggregate::*;
pub use experiment::*;
pub use records::*;
pub use results::*;
pub use shared_state::*;

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}

/// Every store the engine persists to. A single backend may implement all of them.
pub trait ExptDatabase:
    ExperimentQueries
    + ExptRunLogQueries
    + ExptItemResultQueries
    + ExptTurnResultQueries
    + ExptStatsQueries
    + ExptAggrResultQueries
    + EvaluatorRecordQueries
    + EvalTargetQueries
    + AnnotationQueries
    + Send
    + Sync
{
}

impl<T> ExptDatabase for T where
    T: ExperimentQueries
        + ExptRunLogQueries
        + ExptItemResultQueries
        + ExptTurnResultQueries
        + ExptStatsQueries
        + ExptAggrResultQueries
        + EvaluatorRecordQueries
        + EvalTargetQueries
        + AnnotationQueries
        + Send
        + Sync
{
}
