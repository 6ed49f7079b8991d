//! Contracts of the remote services the engine calls into.
//!
//! Implementations live outside this workspace (RPC clients); `crate::test_helpers`
//! provides deterministic fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::entity::{
    EvaluationSet, EvaluationSetItem, EvaluationSetItemPage, EvaluationSetVersion, Evaluator,
    ListEvaluationSetItemsParam, Message, ModelConfig, TagInfo, TokenUsage, Tool, ToolCall,
    ToolChoice,
};
use crate::error::Error;

#[async_trait]
pub trait EvaluationSetService: Send + Sync {
    async fn get_evaluation_set(
        &self,
        space_id: i64,
        eval_set_id: i64,
    ) -> Result<Option<EvaluationSet>, Error>;

    /// Returns the version together with its owning set.
    async fn get_evaluation_set_version(
        &self,
        space_id: i64,
        version_id: i64,
    ) -> Result<Option<(EvaluationSetVersion, EvaluationSet)>, Error>;

    async fn list_evaluation_set_items(
        &self,
        param: &ListEvaluationSetItemsParam,
    ) -> Result<EvaluationSetItemPage, Error>;

    async fn batch_get_evaluation_set_items(
        &self,
        space_id: i64,
        eval_set_id: i64,
        version_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<EvaluationSetItem>, Error>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromptTemplateInfo {
    pub prompt_id: i64,
    pub prompt_key: String,
    pub version: String,
    pub name: String,
    pub description: String,
    /// Variable names referenced by the template.
    pub variables: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableVal {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutePromptParam {
    pub space_id: i64,
    pub prompt_id: i64,
    pub prompt_version: String,
    pub variables: Vec<VariableVal>,
    pub history_messages: Vec<Message>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutePromptResult {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub token_usage: Option<TokenUsage>,
}

#[async_trait]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait PromptRpc: Send + Sync {
    async fn get_prompt(
        &self,
        space_id: i64,
        prompt_id: i64,
        version: &str,
    ) -> Result<Option<PromptTemplateInfo>, Error>;

    async fn execute_prompt(&self, param: ExecutePromptParam)
    -> Result<ExecutePromptResult, Error>;
}

#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq)]
pub enum Scenario {
    #[default]
    EvalEvaluator,
    EvalTarget,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmCallParam {
    pub space_id: i64,
    pub evaluator_version_id: i64,
    pub user_id: String,
    pub scenario: Scenario,
    pub messages: Vec<Message>,
    pub model_config: ModelConfig,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplyItem {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

#[async_trait]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait LlmProvider: Send + Sync {
    async fn call(&self, param: LlmCallParam) -> Result<ReplyItem, Error>;
}

#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq)]
pub enum AuditStatus {
    #[default]
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditParam {
    pub object_id: i64,
    pub audit_data: HashMap<String, String>,
    pub re_submit: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditRecord {
    pub audit_status: AuditStatus,
    pub failed_reason: Option<String>,
}

#[async_trait]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait AuditService: Send + Sync {
    async fn audit(&self, param: AuditParam) -> Result<AuditRecord, Error>;
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum DenyReason {
    InsufficientBalance,
    ExceedFreeQuota,
    AccountSuspended,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckBenefitParam {
    pub connector_uid: String,
    pub space_id: i64,
    pub expt_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckBenefitResult {
    pub deny_reason: Option<DenyReason>,
    pub is_free: Option<bool>,
}

#[async_trait]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait BenefitService: Send + Sync {
    async fn check_and_deduct_eval_benefit(
        &self,
        param: CheckBenefitParam,
    ) -> Result<CheckBenefitResult, Error>;
}

#[async_trait]
pub trait TagService: Send + Sync {
    async fn batch_get_tags(&self, space_id: i64, tag_key_ids: &[i64])
    -> Result<Vec<TagInfo>, Error>;
}

#[async_trait]
pub trait EvaluatorService: Send + Sync {
    /// Evaluators with their prompt version populated. Missing versions are skipped.
    async fn batch_get_evaluators_by_version_ids(
        &self,
        space_id: i64,
        evaluator_version_ids: &[i64],
    ) -> Result<Vec<Evaluator>, Error>;
}
