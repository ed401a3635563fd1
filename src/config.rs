//! Configuration loading: JSON file plus environment-variable overrides
//! for credentials, in the same shape `Config::from_file` used to load the
//! backtester's strategy configs.

use crate::oms::{ExecutionParams, RfqAction, RouterConfig, SmartExecConfig};
use crate::strategy::{EntryPredicateSpec, ExitPredicateSpec, LegTemplate};
use crate::venue::{ClientConfig, Credentials};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

impl VenueConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_base_url(self.base_url.clone())
            .with_max_retries(self.max_retries)
            .with_timeout(std::time::Duration::from_secs(self.timeout_secs))
    }

    /// Resolves credentials, preferring environment variables over the
    /// config file so secrets never need to live on disk.
    pub fn credentials(&self) -> Result<Credentials> {
        if let Ok(creds) = Credentials::from_env() {
            return Ok(creds);
        }
        let api_key = self
            .api_key
            .clone()
            .context("missing venue api_key (set in config or VENUE_API_KEY)")?;
        let api_secret = self
            .api_secret
            .clone()
            .context("missing venue api_secret (set in config or VENUE_API_SECRET)")?;
        Ok(Credentials::new(api_key, api_secret))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionConfig {
    #[serde(flatten)]
    pub router: RouterConfig,
    #[serde(default)]
    pub params: ExecutionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub strategy_id: String,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: i64,
    #[serde(default = "default_max_concurrent_trades")]
    pub max_concurrent_trades: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: usize,
    pub rfq_action: RfqAction,
    pub legs: Vec<LegTemplate>,
    #[serde(default)]
    pub entry_predicates: Vec<EntryPredicateSpec>,
    #[serde(default)]
    pub exit_predicates: Vec<ExitPredicateSpec>,
}

fn default_check_interval_secs() -> i64 {
    30
}

fn default_max_concurrent_trades() -> usize {
    1
}

fn default_cooldown_secs() -> i64 {
    0
}

fn default_max_trades_per_day() -> usize {
    10
}

/// Top-level JSON configuration for the daemon: one venue, one set of
/// execution defaults, a poll cadence, and the strategies to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub venue: VenueConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub smart_execution: SmartExecConfig,
    #[serde(default = "default_poller_interval_seconds")]
    pub poller_interval_seconds: u64,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    pub strategies: Vec<StrategyDefinition>,
}

fn default_poller_interval_seconds() -> u64 {
    10
}

fn default_state_file() -> String {
    "logs/trade_state.json".to_string()
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: AppConfig = serde_json::from_str(&contents).context("failed to parse config JSON")?;
        Ok(config)
    }
}
