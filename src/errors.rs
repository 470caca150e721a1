//! # Centralized Error Handling
//!
//! Typed, hierarchical errors for the scraper. Chain-level failures and sink
//! failures carry their own enums and convert into the top-level
//! [`ScraperError`] via `#[from]`, so call sites propagate with `?` instead of
//! stringly-typed errors.

use thiserror::Error;

/// The top-level error type for the scraper engine.
#[derive(Error, Debug, Clone)]
pub enum ScraperError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Internal channel error: {0}")]
    Channel(String),
    #[error("Scraper is closed")]
    Closed,
}

/// Errors related to chain interaction: RPC calls, subscriptions, decoding.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("Provider connection failed: {0}")]
    Connection(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Subscription failed: {0}")]
    Subscription(String),
    #[error("Subscription stream ended")]
    StreamEnded,
    #[error("Data encoding/decoding error: {0}")]
    DataEncoding(String),
    #[error("Chain client is closed")]
    Closed,
}

impl From<ethers::providers::ProviderError> for ChainError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        ChainError::Rpc(err.to_string())
    }
}

/// Errors raised by the downstream trade sink.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("trade ingestion frozen: no trade for {0:?}")]
    Frozen(std::time::Duration),
    #[error("trade store error: {0}")]
    Store(String),
}
