//! Real-time swap ingestion for a factory-instantiated CFMM exchange.
//!
//! The engine discovers liquidity pools through the factory contract's
//! creation events, keeps one live swap subscription per pool plus one for
//! the factory itself, normalizes raw swap events against per-token decimal
//! metadata, and emits canonical trades for registered pairs on a single
//! outbound channel. Failed subscriptions are recovered sequentially through
//! one resubscribe channel; the downstream consumer carries a liveness
//! watchdog.

pub mod chain;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod normalize;
pub mod registry;
pub mod scraper;
pub mod types;
pub mod watchdog;

pub use config::Config;
pub use errors::{ChainError, ScraperError, SinkError};
pub use scraper::{PairHandle, SwapScraper};
pub use types::{Asset, ExchangePair, Trade};
