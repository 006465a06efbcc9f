use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{bail, Context};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// JSON-RPC chain connection configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    pub rpc_url: String,
    pub chain_id: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts per RPC call before the error is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

/// Ingestion settings for the tracked wallet.
///
/// Controls which transfers are picked up and how aggressively
/// the provider is queried:
/// - Poll window: `max_blocks_per_poll` blocks per cycle
/// - Cold start: `lookback_blocks` behind head when nothing is stored yet
/// - Chunking: bounded concurrency with a small delay after every chunk
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorSettings {
    pub wallet_address: String,
    pub tokens: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_blocks_per_poll")]
    pub max_blocks_per_poll: u64,
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    /// Blocks behind head treated as final
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Upper bound for the planner's tiered chunk size
    #[serde(default)]
    pub max_chunk_size: Option<u64>,
    #[serde(default = "default_max_narrowing_splits")]
    pub max_narrowing_splits: u32,
    /// Failed cycles after which a gap is declared permanent and skipped.
    /// Unset means the checkpoint waits on the gap forever.
    #[serde(default)]
    pub gap_skip_after_attempts: Option<u32>,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_blocks_per_poll() -> u64 {
    100
}

fn default_lookback_blocks() -> u64 {
    1_000
}

fn default_chunk_concurrency() -> usize {
    2
}

fn default_chunk_delay_ms() -> u64 {
    200
}

fn default_max_narrowing_splits() -> u32 {
    16
}

/// Intervals for the background statistics jobs.
#[derive(Debug, Deserialize, Clone)]
pub struct StatsSettings {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            audit_interval_secs: default_audit_interval_secs(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_audit_interval_secs() -> u64 {
    3_600
}

/// PostgreSQL database connection configuration.
///
/// Used for storing:
/// - Materialized transfer transactions
/// - Wallet ledgers
/// - Checkpoints and ingestion gaps
/// - Token metadata
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    8
}

/// Redpanda (Kafka-compatible) pub/sub configuration.
///
/// When enabled, ledger events are forwarded to Redpanda topics
/// for external consumers such as the dashboard.
#[derive(Debug, Deserialize, Clone)]
pub struct RedpandaSettings {
    /// Enable/disable Redpanda publishing
    #[serde(default)]
    pub enabled: bool,
    /// Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[serde(default = "default_redpanda_brokers")]
    pub brokers: String,
    /// Topic name prefix (topics: {prefix}.{event}.{wallet})
    #[serde(default = "default_redpanda_topic_prefix")]
    pub topic_prefix: String,
}

fn default_redpanda_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_redpanda_topic_prefix() -> String {
    "feewatch".to_string()
}

/// Root application configuration.
///
/// Loaded from `config.yaml` at startup, with `FEEWATCH__SECTION__KEY`
/// environment variables taking precedence.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub chain: ChainSettings,
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub stats: StatsSettings,
    #[serde(default)]
    pub postgres: Option<PostgresSettings>,
    #[serde(default)]
    pub redpanda: Option<RedpandaSettings>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("FEEWATCH")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("monitor.tokens")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }

    /// Checks the settings that make the process unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.wallet_address()?;
        self.token_addresses()?;

        if self.monitor.max_blocks_per_poll == 0 {
            bail!("monitor.max_blocks_per_poll must be greater than zero");
        }
        if self.monitor.poll_interval_secs == 0 {
            bail!("monitor.poll_interval_secs must be greater than zero");
        }
        if self.monitor.chunk_concurrency == 0 {
            bail!("monitor.chunk_concurrency must be greater than zero");
        }
        if self.monitor.max_chunk_size == Some(0) {
            bail!("monitor.max_chunk_size must be greater than zero when set");
        }
        url::Url::parse(&self.chain.rpc_url)
            .with_context(|| format!("Invalid chain.rpc_url: {}", self.chain.rpc_url))?;

        Ok(())
    }

    pub fn wallet_address(&self) -> anyhow::Result<Address> {
        let raw = self.monitor.wallet_address.trim();
        if raw.is_empty() {
            bail!("monitor.wallet_address is required");
        }
        let address =
            Address::from_str(raw).with_context(|| format!("Invalid wallet address: {}", raw))?;
        if address == Address::ZERO {
            bail!("monitor.wallet_address must not be the zero address");
        }
        Ok(address)
    }

    pub fn token_addresses(&self) -> anyhow::Result<Vec<Address>> {
        if self.monitor.tokens.is_empty() {
            bail!("monitor.tokens must list at least one ERC-20 contract");
        }

        let mut tokens = Vec::with_capacity(self.monitor.tokens.len());
        for raw in &self.monitor.tokens {
            let address = Address::from_str(raw.trim())
                .with_context(|| format!("Invalid token address: {}", raw))?;
            if !tokens.contains(&address) {
                tokens.push(address);
            }
        }
        Ok(tokens)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(wallet: &str, tokens: &[&str]) -> Settings {
        Settings {
            chain: ChainSettings {
                rpc_url: "https://mainnet.base.org".to_string(),
                chain_id: 8453,
                request_timeout_secs: default_request_timeout_secs(),
                max_retries: default_max_retries(),
                retry_base_delay_ms: default_retry_base_delay_ms(),
            },
            monitor: MonitorSettings {
                wallet_address: wallet.to_string(),
                tokens: tokens.iter().map(|t| t.to_string()).collect(),
                poll_interval_secs: default_poll_interval_secs(),
                max_blocks_per_poll: default_max_blocks_per_poll(),
                lookback_blocks: default_lookback_blocks(),
                confirmations: 0,
                chunk_concurrency: default_chunk_concurrency(),
                chunk_delay_ms: default_chunk_delay_ms(),
                max_chunk_size: None,
                max_narrowing_splits: default_max_narrowing_splits(),
                gap_skip_after_attempts: None,
            },
            stats: StatsSettings::default(),
            postgres: None,
            redpanda: None,
        }
    }

    const WALLET: &str = "0x8Ba1f109551bD432803012645Ac136ddd64DBA72";
    const TOKEN: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

    #[test]
    fn test_valid_settings_pass() {
        let s = settings(WALLET, &[TOKEN]);
        assert!(s.validate().is_ok());
        assert_eq!(s.token_addresses().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_wallet_is_rejected() {
        let s = settings("  ", &[TOKEN]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_zero_wallet_is_rejected() {
        let s = settings("0x0000000000000000000000000000000000000000", &[TOKEN]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let s = settings(WALLET, &["0x1234"]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_empty_token_list_is_rejected() {
        let s = settings(WALLET, &[]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_duplicate_tokens_differing_in_case_collapse() {
        let lower = TOKEN.to_lowercase();
        let s = settings(WALLET, &[TOKEN, &lower]);
        assert_eq!(s.token_addresses().unwrap().len(), 1);
    }

    #[test]
    fn test_zero_poll_window_is_rejected() {
        let mut s = settings(WALLET, &[TOKEN]);
        s.monitor.max_blocks_per_poll = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_durations_come_from_seconds_fields() {
        let mut s = settings(WALLET, &[TOKEN]);
        s.monitor.poll_interval_secs = 15;
        s.chain.request_timeout_secs = 7;
        assert_eq!(s.poll_interval(), Duration::from_secs(15));
        assert_eq!(s.request_timeout(), Duration::from_secs(7));
    }
}
