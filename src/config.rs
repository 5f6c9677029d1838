//! Configuration management for the DBCP runtime
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub event_hub: EventHubConfig,
    /// Account address -> hex private key
    #[serde(default)]
    pub accounts: HashMap<String, String>,
    /// Domain -> address, used when no external name resolver is supplied
    #[serde(default)]
    pub names: HashMap<String, String>,
    #[serde(default)]
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub ws_url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Default gas limit merged into every transaction
    pub gas: Option<u64>,
    /// Default gas price merged into every transaction
    pub gas_price: Option<u64>,
    /// Auto-gas multiplier used when a call does not set its own; `0` disables it
    #[serde(default = "default_auto_gas")]
    pub always_auto_gas_limit: Option<f64>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_gas_log_capacity")]
    pub gas_log_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            gas: None,
            gas_price: None,
            always_auto_gas_limit: default_auto_gas(),
            timeout_ms: default_timeout_ms(),
            gas_log_capacity: default_gas_log_capacity(),
        }
    }
}

impl ExecutorConfig {
    /// Default auto-gas multiplier, `None` when switched off
    pub fn auto_gas_default(&self) -> Option<f64> {
        self.always_auto_gas_limit.filter(|multiplier| *multiplier != 0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// Fixed gas price in wei; the node median is used when unset
    pub gas_price: Option<u64>,
    /// Substituted when the node reports a gas price of zero
    #[serde(default = "default_gas_price_floor")]
    pub gas_price_floor: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: u64,
    #[serde(default = "default_send_gas")]
    pub default_send_gas: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            gas_price: None,
            gas_price_floor: default_gas_price_floor(),
            receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
            block_cache_size: default_block_cache_size(),
            default_send_gas: default_send_gas(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventHubConfig {
    /// Domain the system event contract is registered under
    #[serde(default = "default_event_hub_domain")]
    pub domain: String,
    /// Reserved contract name that resolves through `domain`
    #[serde(default = "default_event_hub_contract")]
    pub contract_name: String,
    /// Resume listeners from the last seen block after a reconnect
    #[serde(default)]
    pub resume_from_last_block: bool,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            domain: default_event_hub_domain(),
            contract_name: default_event_hub_contract(),
            resume_from_last_block: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractsConfig {
    /// Compiled contracts JSON file
    pub path: Option<PathBuf>,
}

/// Contract event the watcher binary logs
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub contract: String,
    pub address: String,
    pub event: String,
    pub from_block: Option<u64>,
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_auto_gas() -> Option<f64> {
    Some(1.1)
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_gas_log_capacity() -> usize {
    crate::logging::DEFAULT_GAS_LOG_CAPACITY
}

fn default_gas_price_floor() -> u64 {
    200_000_000_000
}

fn default_receipt_poll_interval_ms() -> u64 {
    1000
}

fn default_block_cache_size() -> u64 {
    200
}

fn default_send_gas() -> u64 {
    53_000
}

fn default_event_hub_domain() -> String {
    "eventhub.evan".to_string()
}

fn default_event_hub_contract() -> String {
    "EventHub".to_string()
}

impl Settings {
    /// Load settings from the file named by `DBCP_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("DBCP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::from_file(&config_path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&config_str)
    }

    /// Parse TOML after substituting environment variables
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let url = self.node.ws_url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            anyhow::bail!("node.ws_url must be a websocket URL, got \"{}\"", url);
        }

        if let Some(multiplier) = self.executor.always_auto_gas_limit {
            if !(multiplier >= 0.0) {
                anyhow::bail!("executor.always_auto_gas_limit must not be negative");
            }
        }

        self.account_map()?;
        self.name_map()?;

        for watch in &self.watch {
            parse_address(&watch.address)
                .with_context(|| format!("Invalid address for watch on {}", watch.contract))?;
        }

        if self.accounts.is_empty() {
            tracing::warn!("No accounts configured - runtime will be read-only");
        }

        Ok(())
    }

    /// Configured accounts keyed by address
    pub fn account_map(&self) -> Result<HashMap<Address, String>> {
        self.accounts
            .iter()
            .map(|(address, key)| {
                let address = parse_address(address)
                    .with_context(|| format!("Invalid account address \"{}\"", address))?;
                if key.trim().is_empty() {
                    anyhow::bail!("Account {:?} has an empty private key", address);
                }
                Ok((address, key.clone()))
            })
            .collect()
    }

    /// Configured name table keyed by domain
    pub fn name_map(&self) -> Result<HashMap<String, Address>> {
        self.names
            .iter()
            .map(|(domain, address)| {
                let address = parse_address(address)
                    .with_context(|| format!("Invalid address for domain \"{}\"", domain))?;
                Ok((domain.clone(), address))
            })
            .collect()
    }
}

pub fn parse_address(input: &str) -> Result<Address> {
    Address::from_str(input.trim()).map_err(|e| anyhow::anyhow!("{}: {}", input, e))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}
