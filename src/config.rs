//! Configuration management for the bridge relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::finality::recommended_confirmations;
use crate::events::ChainSide;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "BRIDGE_RELAYER_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    /// Keyed by leg name: `l1` and `settlement`
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

/// Tuning shared by both relay legs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub listener_poll_interval_ms: u64,
    pub monitor_poll_interval_ms: u64,
    /// Transactions allowed in flight past the last confirmed nonce
    pub max_pending_txs: u64,
    pub receipt_batch_size: usize,
    pub event_queue_capacity: usize,
    /// Largest block span requested in one log query
    pub max_block_range: u64,
    /// Retries of a failed range before rescanning from genesis
    pub scan_retries: u32,
    pub scan_retry_base_delay_ms: u64,
    pub fee_bump_percent: u64,
    /// Fee-bump replacements before a finalize attempt is abandoned
    pub max_retries: u32,
    pub submission_timeout_secs: u64,
    /// Broadcast retries when the RPC call itself times out
    pub send_retries: u32,
    pub health_check_interval_secs: u64,
    pub settled_cache_size: usize,
    /// Submit a fresh finalize when the recorded one failed or was replaced
    pub resubmit_failed: bool,
    pub cancel_pending_on_start: bool,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            listener_poll_interval_ms: 5_000,
            monitor_poll_interval_ms: 500,
            max_pending_txs: 1024,
            receipt_batch_size: 64,
            event_queue_capacity: 10,
            max_block_range: 40_000,
            scan_retries: 5,
            scan_retry_base_delay_ms: 1_000,
            fee_bump_percent: 10,
            max_retries: 10,
            submission_timeout_secs: 60,
            send_retries: 3,
            health_check_interval_secs: 30,
            settled_cache_size: 1000,
            resubmit_failed: false,
            cancel_pending_on_start: false,
        }
    }
}

impl RelayerConfig {
    pub fn listener_poll_interval(&self) -> Duration {
        Duration::from_millis(self.listener_poll_interval_ms)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Bridge contract emitting `TransferInitiated` and accepting `finalizeTransfer`
    pub contract_address: String,
    /// Blocks below the head treated as reorg-prone
    pub finality_depth: Option<u64>,
    #[serde(default = "default_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_priority_fee_gwei")]
    pub default_priority_fee_gwei: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

fn default_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_priority_fee_gwei() -> u64 {
    2
}

fn default_gas_limit() -> u64 {
    3_000_000
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

impl ChainConfig {
    /// Configured depth, or the per-network recommendation
    pub fn finality_depth(&self) -> u64 {
        self.finality_depth
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the hex private key
    #[serde(default = "default_key_env")]
    pub private_key_env: String,
}

fn default_key_env() -> String {
    "RELAYER_PRIVATE_KEY".to_string()
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_key_env(),
        }
    }
}

impl Settings {
    /// Load settings from the file named by `BRIDGE_RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        for side in [ChainSide::L1, ChainSide::Settlement] {
            let name = side.as_str();
            let chain = self
                .chains
                .get(name)
                .with_context(|| format!("Missing [chains.{}] section", name))?;

            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.contract_address.is_empty() {
                anyhow::bail!("Chain {} has no contract address configured", name);
            }
        }

        let r = &self.relayer;
        if r.max_block_range == 0 {
            anyhow::bail!("relayer.max_block_range must be positive");
        }
        if r.max_pending_txs == 0 {
            anyhow::bail!("relayer.max_pending_txs must be positive");
        }
        if r.receipt_batch_size == 0 || r.event_queue_capacity == 0 {
            anyhow::bail!("relayer.receipt_batch_size and event_queue_capacity must be positive");
        }
        if r.max_retries == 0 {
            anyhow::bail!("relayer.max_retries must be positive");
        }

        Ok(())
    }

    /// Chain config for one side of the bridge
    pub fn chain(&self, side: ChainSide) -> Result<&ChainConfig> {
        self.chains
            .get(side.as_str())
            .with_context(|| format!("Missing [chains.{}] section", side))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[relayer]
max_pending_txs = 16

[database]
url = "postgres://relayer@localhost/bridge"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chains.l1]
chain_id = 1
name = "ethereum"
rpc_urls = ["${TEST_L1_RPC}"]
contract_address = "0x00000000000000000000000000000000000000aa"
max_gas_price_gwei = 300

[chains.settlement]
chain_id = 17864
name = "settlement"
rpc_urls = ["http://localhost:8545"]
contract_address = "0x00000000000000000000000000000000000000bb"
finality_depth = 2
gas_price_strategy = "legacy"
max_gas_price_gwei = 50
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        env::set_var("TEST_L1_RPC", "https://l1.example.org");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.relayer.max_pending_txs, 16);
        assert_eq!(settings.relayer.receipt_batch_size, 64);
        assert_eq!(settings.relayer.max_block_range, 40_000);
        assert_eq!(settings.wallet.private_key_env, "RELAYER_PRIVATE_KEY");

        let l1 = settings.chain(ChainSide::L1).unwrap();
        assert_eq!(l1.rpc_urls, vec!["https://l1.example.org".to_string()]);
        assert_eq!(l1.finality_depth(), 32);
        assert_eq!(l1.gas_limit, 3_000_000);

        let settlement = settings.chain(ChainSide::Settlement).unwrap();
        assert_eq!(settlement.finality_depth(), 2);
        assert_eq!(settlement.gas_price_strategy, GasPriceStrategy::Legacy);
    }

    #[test]
    fn test_missing_leg_is_rejected() {
        let without_settlement = SAMPLE
            .split("[chains.settlement]")
            .next()
            .unwrap()
            .replace("${TEST_L1_RPC}", "http://x");
        let err = Settings::parse(&without_settlement).unwrap_err();
        assert!(err.to_string().contains("chains.settlement"));
    }
}
