//! # Watchdog Sink
//!
//! The single downstream consumer: reads canonical trades off the engine's
//! outbound channel, hands them to an injected [`TradeStore`], and trips a
//! liveness watchdog when no trade has arrived for the configured delay.
//! Channel closure signals terminal shutdown and ends the loop cleanly.

use crate::errors::SinkError;
use crate::types::Trade;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Destination for persisted trades. The time-series backend is an external
/// collaborator; the crate ships an in-memory store and a logging store.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save_trade(&self, trade: &Trade) -> Result<(), SinkError>;
}

/// Collects trades in memory. Used by tests and demos.
#[derive(Default)]
pub struct MemoryTradeStore {
    trades: Mutex<Vec<Trade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.trades.lock().await.clone()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), SinkError> {
        self.trades.lock().await.push(trade.clone());
        Ok(())
    }
}

/// Logs every trade at info level.
pub struct LoggingTradeStore;

#[async_trait]
impl TradeStore for LoggingTradeStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), SinkError> {
        info!(
            target: "sink",
            pair = %trade.pair,
            price = trade.price,
            volume = trade.volume,
            id = %trade.foreign_trade_id,
            "trade"
        );
        Ok(())
    }
}

/// Consumes trades until the channel closes. A ticker fires every
/// `watchdog_delay`; if no trade arrived within the last full delay the loop
/// returns [`SinkError::Frozen`] so the caller can abort the process. Store
/// failures are logged and do not stop ingestion.
pub async fn run_sink(
    mut trades: mpsc::Receiver<Trade>,
    store: Arc<dyn TradeStore>,
    watchdog_delay: Duration,
) -> Result<(), SinkError> {
    let mut ticker = interval(watchdog_delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick completes immediately
    let mut last_trade = Instant::now();

    loop {
        tokio::select! {
            received = trades.recv() => match received {
                Some(trade) => {
                    last_trade = Instant::now();
                    if let Err(e) = store.save_trade(&trade).await {
                        warn!(target: "sink", error = %e, "failed to persist trade");
                    }
                    debug!(target: "sink", pair = %trade.pair, "trade persisted");
                }
                None => {
                    info!(target: "sink", "trade channel closed; sink exiting");
                    return Ok(());
                }
            },
            _ = ticker.tick() => {
                let elapsed = last_trade.elapsed();
                if elapsed > watchdog_delay {
                    error!(target: "sink", ?elapsed, "no trades within the watchdog delay; frozen");
                    return Err(SinkError::Frozen(elapsed));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Asset;

    fn trade(id: &str) -> Trade {
        Trade {
            symbol: "AAA".into(),
            pair: "AAA-BBB".into(),
            price: 1.0,
            volume: 1.0,
            timestamp: 0,
            foreign_trade_id: id.into(),
            source: "TestSwap".into(),
            base: Asset::default(),
            quote: Asset::default(),
            verified_pair: true,
        }
    }

    #[tokio::test]
    async fn exits_cleanly_when_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        let store = Arc::new(MemoryTradeStore::new());
        tx.send(trade("a")).await.unwrap();
        drop(tx);
        let result = run_sink(rx, store.clone(), Duration::from_secs(60)).await;
        assert!(result.is_ok());
        assert_eq!(store.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn trips_watchdog_when_trades_stop() {
        let (tx, rx) = mpsc::channel(4);
        let store = Arc::new(MemoryTradeStore::new());
        tx.send(trade("a")).await.unwrap();
        // keep the sender alive so the channel never closes
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_sink(rx, store, Duration::from_millis(100)),
        )
        .await
        .expect("sink should trip the watchdog before the test timeout");
        match result {
            Err(SinkError::Frozen(_)) => {}
            other => panic!("expected frozen sink, got {other:?}"),
        }
        drop(tx);
    }
}
