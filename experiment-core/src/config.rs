use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::entity::{ParseType, Tool};
use crate::error::{Error, ErrorDetails};
use crate::utils::retries::RetryConfig;

/// Key used when a template or model has no explicit mapping.
pub const DEFAULT_MAPPING_KEY: &str = "default";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ItemEvalConf {
    /// Items dispatched concurrently per run.
    #[serde(default = "default_item_concur_num")]
    pub concur_num: usize,
    /// Evaluators run concurrently per turn.
    #[serde(default = "default_evaluator_concur_num")]
    pub evaluator_concur_num: usize,
}

impl Default for ItemEvalConf {
    fn default() -> Self {
        Self {
            concur_num: default_item_concur_num(),
            evaluator_concur_num: default_evaluator_concur_num(),
        }
    }
}

fn default_item_concur_num() -> usize {
    3
}

fn default_evaluator_concur_num() -> usize {
    3
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExptExecConf {
    /// Lease of the per-experiment mutex, and the age after which a quota entry counts as a zombie.
    #[serde(default = "default_zombie_interval_second")]
    pub zombie_interval_second: u64,
    /// Delay between scheduler ticks.
    #[serde(default = "default_daemon_interval_second")]
    pub daemon_interval_second: u64,
    #[serde(default = "default_space_expt_concur_limit")]
    pub space_expt_concur_limit: usize,
    #[serde(default)]
    pub item_eval_conf: ItemEvalConf,
    #[serde(default = "default_scan_item_page_size")]
    pub scan_item_page_size: usize,
    /// Concurrency of the scheduler's scan passes.
    #[serde(default = "default_scan_concur_num")]
    pub scan_concur_num: usize,
}

impl Default for ExptExecConf {
    fn default() -> Self {
        Self {
            zombie_interval_second: default_zombie_interval_second(),
            daemon_interval_second: default_daemon_interval_second(),
            space_expt_concur_limit: default_space_expt_concur_limit(),
            item_eval_conf: ItemEvalConf::default(),
            scan_item_page_size: default_scan_item_page_size(),
            scan_concur_num: default_scan_concur_num(),
        }
    }
}

impl ExptExecConf {
    pub fn zombie_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_interval_second)
    }

    pub fn daemon_interval(&self) -> Duration {
        Duration::from_secs(self.daemon_interval_second)
    }
}

fn default_zombie_interval_second() -> u64 {
    60 * 60 * 24
}

fn default_daemon_interval_second() -> u64 {
    3
}

fn default_space_expt_concur_limit() -> usize {
    10
}

fn default_scan_item_page_size() -> usize {
    100
}

fn default_scan_concur_num() -> usize {
    3
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExptExecConfSection {
    #[serde(default)]
    pub default: ExptExecConf,
    /// Per-workspace overrides, keyed by the space id rendered as a string.
    #[serde(default)]
    pub spaces: HashMap<String, ExptExecConf>,
}

/// Suffix and output parsing selected for a model.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PromptSuffixMapping {
    pub suffix_key: String,
    #[serde(default)]
    pub parse_type: ParseType,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub expt_exec_conf: ExptExecConfSection,
    /// Tool key -> tool definition.
    #[serde(default)]
    pub evaluator_tool_conf: HashMap<String, Tool>,
    /// Prompt template key -> tool key.
    #[serde(default)]
    pub evaluator_tool_mapping: HashMap<String, String>,
    /// Suffix key -> suffix text.
    #[serde(default)]
    pub evaluator_prompt_suffix: HashMap<String, String>,
    /// Model id (as a string) -> suffix key and parse type.
    #[serde(default)]
    pub evaluator_prompt_suffix_mapping: HashMap<String, PromptSuffixMapping>,
    /// Retries applied to collaborator RPCs made by the scheduler.
    #[serde(default)]
    pub rpc_retries: RetryConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse engine config: {e}"),
            })
        })
    }
}

/// Read access to configuration. Implementations must reflect reloads on the next call,
/// so callers never cache the returned values across operations.
pub trait ConfigProvider: Send + Sync {
    fn get_expt_exec_conf(&self, space_id: i64) -> ExptExecConf;

    fn get_evaluator_tool_conf(&self) -> HashMap<String, Tool>;

    fn get_evaluator_tool_mapping(&self) -> HashMap<String, String>;

    fn get_evaluator_prompt_suffix(&self) -> HashMap<String, String>;

    fn get_evaluator_prompt_suffix_mapping(&self) -> HashMap<String, PromptSuffixMapping>;

    fn get_rpc_retries(&self) -> RetryConfig;
}

/// `ConfigProvider` over an atomically swappable `EngineConfig`.
pub struct SwappableConfigProvider {
    config: ArcSwap<EngineConfig>,
}

impl SwappableConfigProvider {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
        }
    }

    pub fn reload(&self, config: EngineConfig) {
        tracing::info!("Reloading experiment engine config");
        self.config.store(Arc::new(config));
    }

    pub fn current(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }
}

impl Default for SwappableConfigProvider {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ConfigProvider for SwappableConfigProvider {
    fn get_expt_exec_conf(&self, space_id: i64) -> ExptExecConf {
        let config = self.config.load();
        config
            .expt_exec_conf
            .spaces
            .get(&space_id.to_string())
            .unwrap_or(&config.expt_exec_conf.default)
            .clone()
    }

    fn get_evaluator_tool_conf(&self) -> HashMap<String, Tool> {
        self.config.load().evaluator_tool_conf.clone()
    }

    fn get_evaluator_tool_mapping(&self) -> HashMap<String, String> {
        self.config.load().evaluator_tool_mapping.clone()
    }

    fn get_evaluator_prompt_suffix(&self) -> HashMap<String, String> {
        self.config.load().evaluator_prompt_suffix.clone()
    }

    fn get_evaluator_prompt_suffix_mapping(&self) -> HashMap<String, PromptSuffixMapping> {
        self.config.load().evaluator_prompt_suffix_mapping.clone()
    }

    fn get_rpc_retries(&self) -> RetryConfig {
        self.config.load().rpc_retries
    }
}
