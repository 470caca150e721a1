//! Core data model: assets, exchange pairs, raw and normalized swaps, and the
//! canonical trade record emitted to the downstream sink.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// A token registered on the scraper's chain. Immutable once registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub address: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    /// Chain tag applied to all assets discovered by this scraper instance.
    pub chain: String,
}

/// A tradable pair as exposed to clients. The foreign name is the pair key
/// `BUY-SELL`; the quote asset is the buy side, the base asset the sell side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangePair {
    pub foreign_name: String,
    pub quote: Asset,
    pub base: Asset,
    /// Primary symbol of the pair (the quote side).
    pub symbol: String,
    pub exchange: String,
    pub verified: bool,
}

/// A decoded swap event as it appears on chain, before any normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSwap {
    pub pool: Address,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
    pub tx_hash: H256,
    pub log_index: U256,
    pub block_number: u64,
}

impl RawSwap {
    /// Unique event identifier: `txHash + "-" + logIndex`.
    pub fn event_id(&self) -> String {
        format!("{:?}-{}", self.tx_hash, self.log_index)
    }
}

/// A pool-creation event decoded from the factory contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolCreated {
    pub pool: Address,
    pub block_number: u64,
}

/// A swap after decimal scaling and wrapped-native symbol aliasing.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSwap {
    pub sell_symbol: String,
    pub buy_symbol: String,
    pub sell_volume: f64,
    pub buy_volume: f64,
    /// `txHash + "-" + logIndex` of the source event.
    pub id: String,
    /// Wall-clock unix seconds at ingest.
    pub timestamp: i64,
}

impl NormalizedSwap {
    /// Pair key the swap is routed under: `BUY-SELL`.
    pub fn pair_key(&self) -> String {
        format!("{}-{}", self.buy_symbol, self.sell_symbol)
    }
}

/// The canonical trade record produced for every swap on a registered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub pair: String,
    /// `sellVolume / buyVolume`.
    pub price: f64,
    /// `buyVolume`.
    pub volume: f64,
    /// Unix seconds, wall clock at ingest.
    pub timestamp: i64,
    pub foreign_trade_id: String,
    /// Name of the source exchange.
    pub source: String,
    /// Sell-side asset, as registered.
    pub base: Asset,
    /// Buy-side asset, as registered.
    pub quote: Asset,
    pub verified_pair: bool,
}
