use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ExptRunMode {
    #[default]
    Submit,
    FailRetry,
    Append,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum RunLogStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// State shared by items, turns and per-run item logs.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
pub enum ItemRunState {
    #[default]
    Queueing,
    Processing,
    Success,
    Fail,
    Terminal,
}

impl ItemRunState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ItemRunState::Success | ItemRunState::Fail | ItemRunState::Terminal
        )
    }

    pub fn needs_retry(self) -> bool {
        matches!(self, ItemRunState::Fail | ItemRunState::Terminal)
    }
}

pub type TurnRunState = ItemRunState;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptRunLog {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub expt_run_id: i64,
    pub mode: ExptRunMode,
    pub status: RunLogStatus,
    pub pending_cnt: i64,
    pub processing_cnt: i64,
    pub success_cnt: i64,
    pub fail_cnt: i64,
    pub terminated_cnt: i64,
    pub created_by: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptItemResult {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub item_id: i64,
    pub item_idx: i64,
    pub status: ItemRunState,
    pub err_msg: String,
    pub log_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptTurnResult {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub turn_idx: i64,
    pub status: TurnRunState,
    pub target_result_id: i64,
    pub err_msg: String,
    pub log_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptItemResultRunLog {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub expt_run_id: i64,
    pub item_id: i64,
    pub status: ItemRunState,
    pub err_msg: String,
    pub log_id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ItemTurnId {
    pub item_id: i64,
    pub turn_id: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptTurnEvaluatorResultRef {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub expt_turn_result_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub evaluator_id: i64,
    pub evaluator_version_id: i64,
    pub evaluator_result_id: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptStats {
    pub id: i64,
    pub space_id: i64,
    pub expt_id: i64,
    pub pending_turn_cnt: i64,
    pub processing_turn_cnt: i64,
    pub success_turn_cnt: i64,
    pub fail_turn_cnt: i64,
    pub terminated_turn_cnt: i64,
    pub input_token_cost: i64,
    pub output_token_cost: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Turn counters derived by paging over an experiment's turn results.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExptCalculateStats {
    pub pending_turn_cnt: i64,
    pub processing_turn_cnt: i64,
    pub success_turn_cnt: i64,
    pub fail_turn_cnt: i64,
    pub terminated_turn_cnt: i64,
}

impl ExptCalculateStats {
    pub fn record(&mut self, state: TurnRunState) {
        match state {
            ItemRunState::Queueing => self.pending_turn_cnt += 1,
            ItemRunState::Processing => self.processing_turn_cnt += 1,
            ItemRunState::Success => self.success_turn_cnt += 1,
            ItemRunState::Fail => self.fail_turn_cnt += 1,
            ItemRunState::Terminal => self.terminated_turn_cnt += 1,
        }
    }

    /// Work still outstanding: queued or in flight.
    pub fn incomplete_turn_cnt(&self) -> i64 {
        self.pending_turn_cnt + self.processing_turn_cnt
    }
}
