//! # Scraper Configuration
//!
//! Settings for a single scraper instance, loaded from a JSON file. Only the
//! connection endpoints, the factory address, and the discovery start block
//! are mandatory; every tunable carries a serde default so a minimal config
//! file stays minimal.

use ethers::types::Address;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange name stamped on every emitted trade.
    pub exchange: String,
    /// Chain tag applied to all discovered assets.
    pub chain: String,
    pub http_url: String,
    pub ws_url: String,
    /// Factory contract emitting pool-creation events.
    pub factory_address: Address,
    /// Historical block the pool-discovery scan starts from.
    pub pool_creation_start_block: u64,
    /// Blocks of history replayed when a swap subscription is (re)opened.
    #[serde(default = "default_swap_lookback")]
    pub swap_lookback_blocks: u64,
    /// Blocks of history replayed when the factory subscription is (re)opened.
    #[serde(default = "default_factory_lookback")]
    pub factory_lookback_blocks: u64,
    /// Wrapped-native symbol rewritten to the native symbol on output.
    #[serde(default = "default_wrapped_native")]
    pub wrapped_native_symbol: String,
    #[serde(default = "default_native")]
    pub native_symbol: String,
    /// Symbols rejected at registration time (compared case-insensitively).
    #[serde(default)]
    pub symbol_blacklist: Vec<String>,
    /// Watchdog threshold for the downstream sink, in seconds.
    #[serde(default = "default_watchdog_delay")]
    pub watchdog_delay_secs: u64,
    /// Capacity of the outbound trade channel. A slow consumer throttles all
    /// pool subscribers once the buffer is full.
    #[serde(default = "default_trade_capacity")]
    pub trade_channel_capacity: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub resubscribe_backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub resubscribe_backoff_max_ms: u64,
    /// Foreign names to scrape. Empty means every available pair.
    #[serde(default)]
    pub pairs: Vec<String>,
}

fn default_swap_lookback() -> u64 {
    5_250
}

fn default_factory_lookback() -> u64 {
    86_400
}

fn default_wrapped_native() -> String {
    "WETH".to_string()
}

fn default_native() -> String {
    "ETH".to_string()
}

fn default_watchdog_delay() -> u64 {
    3_600
}

fn default_trade_capacity() -> usize {
    256
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            chain: String::new(),
            http_url: String::new(),
            ws_url: String::new(),
            factory_address: Address::zero(),
            pool_creation_start_block: 0,
            swap_lookback_blocks: default_swap_lookback(),
            factory_lookback_blocks: default_factory_lookback(),
            wrapped_native_symbol: default_wrapped_native(),
            native_symbol: default_native(),
            symbol_blacklist: Vec::new(),
            watchdog_delay_secs: default_watchdog_delay(),
            trade_channel_capacity: default_trade_capacity(),
            resubscribe_backoff_base_ms: default_backoff_base_ms(),
            resubscribe_backoff_max_ms: default_backoff_max_ms(),
            pairs: Vec::new(),
        }
    }
}

impl Config {
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from JSON: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.is_empty() {
            eyre::bail!("exchange name must not be empty");
        }
        if self.chain.is_empty() {
            eyre::bail!("chain tag must not be empty");
        }
        if self.http_url.is_empty() || self.ws_url.is_empty() {
            eyre::bail!("both http_url and ws_url must be set");
        }
        if self.factory_address == Address::zero() {
            eyre::bail!("factory_address must not be the zero address");
        }
        if self.trade_channel_capacity == 0 {
            eyre::bail!("trade_channel_capacity must be at least 1");
        }
        if self.resubscribe_backoff_base_ms == 0 {
            eyre::bail!("resubscribe_backoff_base_ms must be at least 1");
        }
        Ok(())
    }

    pub fn watchdog_delay(&self) -> Duration {
        Duration::from_secs(self.watchdog_delay_secs)
    }

    pub fn resubscribe_backoff_base(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_base_ms)
    }

    pub fn resubscribe_backoff_max(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_max_ms)
    }
}
