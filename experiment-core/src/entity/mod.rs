//! Domain types shared by the stores, the collaborator contracts and the engine.

pub mod aggregate;
pub mod annotation;
pub mod content;
pub mod dataset;
pub mod evaluator;
pub mod event;
pub mod experiment;
pub mod run;
pub mod target;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use aggregate::*;
pub use annotation::*;
pub use content::*;
pub use dataset::*;
pub use evaluator::*;
pub use event::*;
pub use experiment::*;
pub use run::*;
pub use target::*;

/// Per-workspace ledger of running experiments: `expt_id -> started_at` (unix seconds).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct QuotaSpaceExpt {
    pub expt_id_to_start_at: HashMap<i64, i64>,
}
