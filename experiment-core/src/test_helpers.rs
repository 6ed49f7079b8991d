//! Deterministic in-process fakes of the remote collaborators.
//! Used by unit and integration tests, and handy for local runs without the real services.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::entity::{
    EvaluationSet, EvaluationSetItem, EvaluationSetItemPage, EvaluationSetVersion, Evaluator,
    ListEvaluationSetItemsParam, TagInfo,
};
use crate::error::{Error, ErrorDetails};
use crate::rpc::{
    AuditParam, AuditRecord, AuditService, AuditStatus, BenefitService, CheckBenefitParam,
    CheckBenefitResult, EvaluationSetService, EvaluatorService, ExecutePromptParam,
    ExecutePromptResult, LlmCallParam, LlmProvider, PromptRpc, PromptTemplateInfo, ReplyItem,
    TagService,
};

#[derive(Default)]
pub struct FakeEvaluationSetService {
    sets: HashMap<i64, EvaluationSet>,
    versions: HashMap<i64, EvaluationSetVersion>,
    items: HashMap<i64, Vec<EvaluationSetItem>>,
}

impl FakeEvaluationSetService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a set version and its items; `item_count` is derived from `items`.
    pub fn with_version(
        mut self,
        set: EvaluationSet,
        mut version: EvaluationSetVersion,
        items: Vec<EvaluationSetItem>,
    ) -> Self {
        version.eval_set_id = set.id;
        version.item_count = items.len() as i64;
        self.items.insert(version.id, items);
        self.versions.insert(version.id, version);
        self.sets.insert(set.id, set);
        self
    }
}

#[async_trait]
impl EvaluationSetService for FakeEvaluationSetService {
    async fn get_evaluation_set(
        &self,
        space_id: i64,
        eval_set_id: i64,
    ) -> Result<Option<EvaluationSet>, Error> {
        Ok(self
            .sets
            .get(&eval_set_id)
            .filter(|s| s.space_id == space_id)
            .cloned())
    }

    async fn get_evaluation_set_version(
        &self,
        space_id: i64,
        version_id: i64,
    ) -> Result<Option<(EvaluationSetVersion, EvaluationSet)>, Error> {
        let Some(version) = self.versions.get(&version_id) else {
            return Ok(None);
        };
        Ok(self
            .sets
            .get(&version.eval_set_id)
            .filter(|s| s.space_id == space_id)
            .map(|set| (version.clone(), set.clone())))
    }

    async fn list_evaluation_set_items(
        &self,
        param: &ListEvaluationSetItemsParam,
    ) -> Result<EvaluationSetItemPage, Error> {
        let items = self.items.get(&param.version_id).cloned().unwrap_or_default();
        let offset: usize = match &param.page_token {
            Some(token) => token.parse().map_err(|_| {
                Error::new(ErrorDetails::InvalidParam {
                    message: format!("bad page token `{token}`"),
                })
            })?,
            None => 0,
        };
        let page_size = param.page_size.max(1);
        let end = (offset + page_size).min(items.len());
        let page = items.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(EvaluationSetItemPage {
            total: items.len() as i64,
            next_page_token: (end < items.len()).then(|| end.to_string()),
            items: page,
        })
    }

    async fn batch_get_evaluation_set_items(
        &self,
        _space_id: i64,
        _eval_set_id: i64,
        version_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<EvaluationSetItem>, Error> {
        Ok(self
            .items
            .get(&version_id)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item_ids.contains(&item.item_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Prompt service whose execution echoes the variables back as `key=value` lines,
/// unless a scripted result is queued.
#[derive(Default)]
pub struct FakePromptRpc {
    prompts: HashMap<(i64, String), PromptTemplateInfo>,
    scripted: Mutex<VecDeque<Result<ExecutePromptResult, Error>>>,
    calls: Mutex<Vec<ExecutePromptParam>>,
}

impl FakePromptRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, prompt: PromptTemplateInfo) -> Self {
        self.prompts
            .insert((prompt.prompt_id, prompt.version.clone()), prompt);
        self
    }

    pub async fn push_result(&self, result: Result<ExecutePromptResult, Error>) {
        self.scripted.lock().await.push_back(result);
    }

    pub async fn calls(&self) -> Vec<ExecutePromptParam> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PromptRpc for FakePromptRpc {
    async fn get_prompt(
        &self,
        _space_id: i64,
        prompt_id: i64,
        version: &str,
    ) -> Result<Option<PromptTemplateInfo>, Error> {
        Ok(self.prompts.get(&(prompt_id, version.to_string())).cloned())
    }

    async fn execute_prompt(
        &self,
        param: ExecutePromptParam,
    ) -> Result<ExecutePromptResult, Error> {
        self.calls.lock().await.push(param.clone());
        if let Some(result) = self.scripted.lock().await.pop_front() {
            return result;
        }
        let mut variables = param.variables;
        variables.sort_by(|a, b| a.key.cmp(&b.key));
        let content = variables
            .iter()
            .map(|v| format!("{}={}", v.key, v.value))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ExecutePromptResult {
            content: Some(content),
            tool_calls: Vec::new(),
            token_usage: None,
        })
    }
}

/// LLM returning queued replies first, then the default reply.
pub struct ScriptedLlmProvider {
    default_reply: Result<ReplyItem, Error>,
    scripted: Mutex<VecDeque<Result<ReplyItem, Error>>>,
    calls: Mutex<Vec<LlmCallParam>>,
}

impl ScriptedLlmProvider {
    pub fn new(default_reply: Result<ReplyItem, Error>) -> Self {
        Self {
            default_reply,
            scripted: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_content(content: &str) -> Self {
        Self::new(Ok(ReplyItem {
            content: Some(content.to_string()),
            ..Default::default()
        }))
    }

    pub async fn push_reply(&self, reply: Result<ReplyItem, Error>) {
        self.scripted.lock().await.push_back(reply);
    }

    pub async fn calls(&self) -> Vec<LlmCallParam> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlmProvider {
    async fn call(&self, param: LlmCallParam) -> Result<ReplyItem, Error> {
        self.calls.lock().await.push(param);
        if let Some(reply) = self.scripted.lock().await.pop_front() {
            return reply;
        }
        self.default_reply.clone()
    }
}

/// Audit returning a fixed verdict, or failing as if the service were down.
pub struct StaticAuditService {
    verdict: Option<AuditStatus>,
}

impl StaticAuditService {
    pub fn approving() -> Self {
        Self {
            verdict: Some(AuditStatus::Approved),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            verdict: Some(AuditStatus::Rejected),
        }
    }

    pub fn unavailable() -> Self {
        Self { verdict: None }
    }
}

#[async_trait]
impl AuditService for StaticAuditService {
    async fn audit(&self, _param: AuditParam) -> Result<AuditRecord, Error> {
        match self.verdict {
            Some(audit_status) => Ok(AuditRecord {
                audit_status,
                failed_reason: (audit_status == AuditStatus::Rejected)
                    .then(|| "content rejected by audit".to_string()),
            }),
            None => Err(Error::new(ErrorDetails::CommonRpc {
                service: "audit".to_string(),
                message: "service unavailable".to_string(),
            })),
        }
    }
}

pub struct StaticBenefitService {
    result: CheckBenefitResult,
    calls: Mutex<Vec<CheckBenefitParam>>,
}

impl StaticBenefitService {
    pub fn new(result: CheckBenefitResult) -> Self {
        Self {
            result,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<CheckBenefitParam> {
        self.calls.lock().await.clone()
    }
}

impl Default for StaticBenefitService {
    fn default() -> Self {
        Self::new(CheckBenefitResult::default())
    }
}

#[async_trait]
impl BenefitService for StaticBenefitService {
    async fn check_and_deduct_eval_benefit(
        &self,
        param: CheckBenefitParam,
    ) -> Result<CheckBenefitResult, Error> {
        self.calls.lock().await.push(param);
        Ok(self.result.clone())
    }
}

#[derive(Default)]
pub struct FakeTagService {
    tags: HashMap<i64, TagInfo>,
}

impl FakeTagService {
    pub fn new(tags: Vec<TagInfo>) -> Self {
        Self {
            tags: tags.into_iter().map(|t| (t.tag_key_id, t)).collect(),
        }
    }
}

#[async_trait]
impl TagService for FakeTagService {
    async fn batch_get_tags(
        &self,
        _space_id: i64,
        tag_key_ids: &[i64],
    ) -> Result<Vec<TagInfo>, Error> {
        Ok(tag_key_ids
            .iter()
            .filter_map(|id| self.tags.get(id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeEvaluatorService {
    by_version_id: HashMap<i64, Evaluator>,
}

impl FakeEvaluatorService {
    pub fn new(evaluators: Vec<Evaluator>) -> Self {
        Self {
            by_version_id: evaluators
                .into_iter()
                .filter_map(|e| e.evaluator_version_id().map(|id| (id, e)))
                .collect(),
        }
    }
}

#[async_trait]
impl EvaluatorService for FakeEvaluatorService {
    async fn batch_get_evaluators_by_version_ids(
        &self,
        space_id: i64,
        evaluator_version_ids: &[i64],
    ) -> Result<Vec<Evaluator>, Error> {
        Ok(evaluator_version_ids
            .iter()
            .filter_map(|id| self.by_version_id.get(id))
            .filter(|e| e.space_id == space_id)
            .cloned()
            .collect())
    }
}
