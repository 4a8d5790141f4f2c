//! Pipeline configuration from environment variables
//!
//! Required values (`PRIMARY_RPC_URL`, `INDEXER_API_KEY`, `CONTRACT_ADDRESS`,
//! `SUBMITTER_ADDRESS`) are fatal when missing. Everything else falls back to
//! a sensible default.

use std::env;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the credit pipeline runtime
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub primary_rpc_url: String,
    pub fallback_rpc_url: Option<String>,

    pub indexer_url: String,
    pub indexer_api_key: String,
    pub indexer_page_size: usize,

    /// Sliding-window limit shared by every call to one provider
    pub max_requests_per_window: usize,
    pub window_ms: u64,

    pub cache_ttl_ms: u64,

    pub circuit_threshold: u32,
    pub circuit_cooldown_ms: u64,
    pub liveness_timeout_ms: u64,

    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub realtime_mode: bool,

    pub max_tx_per_fetch: usize,
    pub rpc_scan_depth: u64,
    pub poll_interval_ms: u64,

    pub contract_address: String,
    pub submitter_address: String,
    pub confirmation_timeout_ms: u64,
    pub submit_max_attempts: u32,

    pub watch_addresses: Vec<String>,
    pub dead_letter_db_path: String,
    pub health_bind_addr: String,
    pub shutdown_timeout_ms: u64,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PRIMARY_RPC_URL` (required)
    /// - `FALLBACK_RPC_URL` (optional)
    /// - `INDEXER_API_KEY` (required)
    /// - `INDEXER_URL` (default: https://api.etherscan.io/api)
    /// - `MAX_REQUESTS_PER_WINDOW` (default: 5)
    /// - `RATE_WINDOW_MS` (default: 1000)
    /// - `CACHE_TTL_MS` (default: 300000)
    /// - `CIRCUIT_THRESHOLD` (default: 3)
    /// - `CIRCUIT_COOLDOWN_MS` (default: 60000)
    /// - `BATCH_SIZE` (default: 10)
    /// - `BATCH_INTERVAL_MS` (default: 30000)
    /// - `REALTIME_MODE` (default: false)
    /// - `MAX_TX_PER_FETCH` (default: 1000)
    /// - `CONTRACT_ADDRESS`, `SUBMITTER_ADDRESS` (required)
    /// - `WATCH_ADDRESSES` (comma-separated, default: none)
    /// - `DEAD_LETTER_DB_PATH` (default: credflow_dead_letters.db)
    /// - `HEALTH_BIND_ADDR` (default: 127.0.0.1:9090)
    pub fn from_env() -> Result<Self, ConfigError> {
        let primary_rpc_url = required("PRIMARY_RPC_URL")?;
        validate_url("PRIMARY_RPC_URL", &primary_rpc_url)?;

        let fallback_rpc_url = env::var("FALLBACK_RPC_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(url) = &fallback_rpc_url {
            validate_url("FALLBACK_RPC_URL", url)?;
        }

        let contract_address = required("CONTRACT_ADDRESS")?.to_lowercase();
        validate_address("CONTRACT_ADDRESS", &contract_address)?;
        let submitter_address = required("SUBMITTER_ADDRESS")?.to_lowercase();
        validate_address("SUBMITTER_ADDRESS", &submitter_address)?;

        let watch_addresses = env::var("WATCH_ADDRESSES")
            .map(|s| {
                s.split(',')
                    .map(|a| a.trim().to_lowercase())
                    .filter(|a| !a.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for address in &watch_addresses {
            validate_address("WATCH_ADDRESSES", address)?;
        }

        let config = Self {
            primary_rpc_url,
            fallback_rpc_url,
            indexer_url: env::var("INDEXER_URL")
                .unwrap_or_else(|_| "https://api.etherscan.io/api".to_string()),
            indexer_api_key: required("INDEXER_API_KEY")?,
            indexer_page_size: parsed("INDEXER_PAGE_SIZE", 100),
            max_requests_per_window: parsed("MAX_REQUESTS_PER_WINDOW", 5),
            window_ms: parsed("RATE_WINDOW_MS", 1_000),
            cache_ttl_ms: parsed("CACHE_TTL_MS", 300_000),
            circuit_threshold: parsed("CIRCUIT_THRESHOLD", 3),
            circuit_cooldown_ms: parsed("CIRCUIT_COOLDOWN_MS", 60_000),
            liveness_timeout_ms: parsed("LIVENESS_TIMEOUT_MS", 5_000),
            batch_size: parsed("BATCH_SIZE", 10),
            batch_interval_ms: parsed("BATCH_INTERVAL_MS", 30_000),
            realtime_mode: parsed("REALTIME_MODE", false),
            max_tx_per_fetch: parsed("MAX_TX_PER_FETCH", 1_000),
            rpc_scan_depth: parsed("RPC_SCAN_DEPTH", 1_000),
            poll_interval_ms: parsed("POLL_INTERVAL_MS", 12_000),
            contract_address,
            submitter_address,
            confirmation_timeout_ms: parsed("CONFIRMATION_TIMEOUT_MS", 120_000),
            submit_max_attempts: parsed("SUBMIT_MAX_ATTEMPTS", 3),
            watch_addresses,
            dead_letter_db_path: env::var("DEAD_LETTER_DB_PATH")
                .unwrap_or_else(|_| "credflow_dead_letters.db".to_string()),
            health_bind_addr: env::var("HEALTH_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:9090".to_string()),
            shutdown_timeout_ms: parsed("SHUTDOWN_TIMEOUT_MS", 10_000),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests_per_window == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_REQUESTS_PER_WINDOW must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue("BATCH_SIZE must be greater than 0".to_string()));
        }
        if self.circuit_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "CIRCUIT_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.indexer_page_size == 0 || self.max_tx_per_fetch == 0 {
            return Err(ConfigError::InvalidValue(
                "INDEXER_PAGE_SIZE and MAX_TX_PER_FETCH must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingVariable(name.to_string()))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().to_lowercase().parse().ok())
        .unwrap_or(default)
}

fn validate_url(name: &str, url: &str) -> Result<(), ConfigError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::InvalidValue(format!(
            "{} must start with http:// or https://",
            name
        )));
    }
    Ok(())
}

fn validate_address(name: &str, address: &str) -> Result<(), ConfigError> {
    if !crate::pipeline::types::is_valid_address(address) {
        return Err(ConfigError::InvalidValue(format!(
            "{} is not a 0x-prefixed 20-byte address: {}",
            name, address
        )));
    }
    Ok(())
}
