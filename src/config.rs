use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cost::{ModelPricing, PricingTable};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default = "default_model_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            base_url: None,
            organization: None,
            timeout_ms: default_model_timeout_ms(),
        }
    }
}

fn default_model_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_role_prompt")]
    pub role_prompt: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// Per-request deadline. Unset means requests run until the loop ends.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            role_prompt: default_role_prompt(),
            max_iterations: default_max_iterations(),
            tool_timeout_ms: default_tool_timeout_ms(),
            deadline_ms: None,
        }
    }
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

fn default_agent_name() -> String {
    "agent".into()
}

fn default_role_prompt() -> String {
    "You are a helpful agent.".into()
}

fn default_max_iterations() -> usize {
    10
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolServerConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_factor() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    #[serde(default = "default_process_path")]
    pub process_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            process_path: default_process_path(),
            health_path: default_health_path(),
            request_timeout_ms: default_request_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_process_path() -> String {
    "/process".into()
}

fn default_health_path() -> String {
    "/health".into()
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_name")]
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: default_workflow_name(),
            stages: Vec::new(),
        }
    }
}

fn default_workflow_name() -> String {
    "research".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tool_server: ToolServerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Per-model price overrides. The key `default` replaces the fallback tier.
    #[serde(default)]
    pub pricing: BTreeMap<String, ModelPricing>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            agent: AgentConfig::default(),
            tool_server: ToolServerConfig::default(),
            remote: RemoteConfig::default(),
            workflow: WorkflowConfig::default(),
            pricing: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| PipelineError::Config(format!("failed to parse configuration: {err}")))
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Applies `PIPELINE_*` overrides. Unparseable numbers are rejected rather
    /// than ignored.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("PIPELINE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("PIPELINE_PORT") {
            self.server.port = parse_env("PIPELINE_PORT", &port)?;
        }
        if let Ok(model) = env::var("PIPELINE_MODEL") {
            self.model.model = model;
        }
        if let Ok(key) = env::var("PIPELINE_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Ok(url) = env::var("PIPELINE_BASE_URL") {
            self.model.base_url = Some(url);
        }
        if let Ok(max) = env::var("PIPELINE_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_env("PIPELINE_MAX_ITERATIONS", &max)?;
        }
        if let Ok(level) = env::var("PIPELINE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("PIPELINE_LOG_JSON") {
            self.logging.json = parse_env("PIPELINE_LOG_JSON", &json)?;
        }
        if let Ok(url) = env::var("PIPELINE_TOOL_SERVER_URL") {
            self.tool_server.url = Some(url);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(PipelineError::Config(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.remote.retry.factor < 1.0 {
            return Err(PipelineError::Config(
                "remote.retry.factor must be >= 1.0".into(),
            ));
        }
        if self.remote.retry.min_delay_ms > self.remote.retry.max_delay_ms {
            return Err(PipelineError::Config(
                "remote.retry.min_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        if let Some(stage) = self.workflow.stages.iter().find(|s| s.name.trim().is_empty()) {
            return Err(PipelineError::Config(format!(
                "workflow stage bound to {} has no name",
                stage.url
            )));
        }
        Ok(())
    }

    /// Built-in tiers with the `[pricing]` overrides applied.
    pub fn pricing_table(&self) -> PricingTable {
        self.pricing
            .iter()
            .fold(PricingTable::default(), |table, (model, pricing)| {
                if model == "default" {
                    table.with_fallback(*pricing)
                } else {
                    table.with_tier(model.clone(), *pricing)
                }
            })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| PipelineError::Config(format!("{key}={raw:?} is invalid: {err}")))
}
