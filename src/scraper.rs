//! # Swap Scraper Engine
//!
//! The dynamic fan-in subscription manager. Owns the pool set and the pair
//! scraper table, keeps one live swap subscription per pool plus one factory
//! subscription for new pools, and serializes all recovery through a single
//! resubscribe channel so a burst of dying subscriptions never stampedes the
//! node. Raw swap events are normalized and emitted as canonical trades on
//! one bounded outbound channel with a single consumer.

use crate::chain::{ChainReader, ChainStream, EventSubscription};
use crate::config::Config;
use crate::errors::{ChainError, ScraperError};
use crate::metrics;
use crate::normalize;
use crate::registry::TokenRegistry;
use crate::types::{Asset, ExchangePair, PoolCreated, RawSwap, Trade};
use dashmap::DashMap;
use ethers::types::Address;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

//================================================================================================//
//                                          CONSTANTS                                             //
//================================================================================================//

const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(10);
const RESUBSCRIBE_CHANNEL_CAPACITY: usize = 64;
const MAX_RESUBSCRIBE_ATTEMPTS: u32 = 8;

//================================================================================================//
//                                           HELPERS                                              //
//================================================================================================//

/// Recovery request carried on the resubscribe channel: a single failed pool
/// subscription, or the factory's new-pool stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resubscribe {
    Pool(Address),
    NewPools,
}

/// Exponential backoff capped at `max_delay`, with randomized jitter so
/// simultaneous retries do not synchronize against the node.
fn backoff_with_jitter(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(8);
    let mut delay = base_delay.saturating_mul(2u32.saturating_pow(exp));
    delay = delay.min(max_delay);
    let jitter_ms = (delay.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
    delay + Duration::from_millis(jitter_ms)
}

fn read_lock<T>(lock: &StdRwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &StdRwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct EngineStatus {
    error: Option<ScraperError>,
    closed: bool,
}

struct PairEntry {
    pair: ExchangePair,
    closed: AtomicBool,
}

//================================================================================================//
//                                         PAIR HANDLE                                            //
//================================================================================================//

/// Client handle for one registered pair. Holds the pair key and a weak
/// reference into the engine; closing marks the table entry closed but does
/// not remove it, and the engine keeps emitting trades for the pair.
#[derive(Debug)]
pub struct PairHandle {
    foreign_name: String,
    pair: ExchangePair,
    engine: Weak<ScraperInner>,
}

impl PairHandle {
    pub fn pair(&self) -> &ExchangePair {
        &self.pair
    }

    /// The engine's terminal error, if one is set.
    pub fn error(&self) -> Option<ScraperError> {
        match self.engine.upgrade() {
            Some(inner) => read_lock(&inner.status).error.clone(),
            None => Some(ScraperError::Closed),
        }
    }

    pub fn close(&self) {
        if let Some(inner) = self.engine.upgrade() {
            if let Some(entry) = inner.pair_scrapers.get(&self.foreign_name) {
                entry.closed.store(true, Ordering::SeqCst);
            }
        }
    }
}

//================================================================================================//
//                                           ENGINE                                               //
//================================================================================================//

struct ScraperInner {
    config: Config,
    reader: Arc<dyn ChainReader>,
    stream: Arc<dyn ChainStream>,
    registry: TokenRegistry,
    pools: DashMap<Address, ()>,
    pair_scrapers: DashMap<String, PairEntry>,
    running: AtomicBool,
    status: StdRwLock<EngineStatus>,
    resubscribe_tx: mpsc::Sender<Resubscribe>,
    trades_tx: StdRwLock<Option<mpsc::Sender<Trade>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct SwapScraper {
    inner: Arc<ScraperInner>,
    resubscribe_rx: Mutex<Option<mpsc::Receiver<Resubscribe>>>,
    trades_rx: Mutex<Option<mpsc::Receiver<Trade>>>,
}

impl SwapScraper {
    pub fn new(config: Config, reader: Arc<dyn ChainReader>, stream: Arc<dyn ChainStream>) -> Self {
        let (resubscribe_tx, resubscribe_rx) = mpsc::channel(RESUBSCRIBE_CHANNEL_CAPACITY);
        let (trades_tx, trades_rx) = mpsc::channel(config.trade_channel_capacity.max(1));
        let registry = TokenRegistry::new(config.chain.clone(), config.symbol_blacklist.clone());
        let inner = Arc::new(ScraperInner {
            config,
            reader,
            stream,
            registry,
            pools: DashMap::new(),
            pair_scrapers: DashMap::new(),
            running: AtomicBool::new(false),
            status: StdRwLock::new(EngineStatus::default()),
            resubscribe_tx,
            trades_tx: StdRwLock::new(Some(trades_tx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        Self {
            inner,
            resubscribe_rx: Mutex::new(Some(resubscribe_rx)),
            trades_rx: Mutex::new(Some(trades_rx)),
        }
    }

    /// Bootstraps the pool and token registries, then opens all live
    /// subscriptions and the recovery dispatcher. The historical scan runs to
    /// completion before any subscription is opened; its failure is fatal.
    pub async fn start(&self) -> Result<(), ScraperError> {
        let inner = &self.inner;
        let created = inner
            .reader
            .pool_creations_since(
                inner.config.factory_address,
                inner.config.pool_creation_start_block,
            )
            .await?;
        for event in created {
            inner.pools.insert(event.pool, ());
        }
        metrics::POOLS_TRACKED.set(inner.pools.len() as i64);
        info!(target: "scraper", pools = inner.pools.len(), "pool registry bootstrapped");

        let pools: Vec<Address> = inner.pools.iter().map(|entry| *entry.key()).collect();
        inner.registry.bootstrap(inner.reader.as_ref(), &pools).await;
        info!(target: "scraper", tokens = inner.registry.len().await, "token registry bootstrapped");

        inner.running.store(true, Ordering::SeqCst);

        let resubscribe_rx = self
            .resubscribe_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ScraperError::Channel("scraper already started".into()))?;
        let dispatcher = inner.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatcher_loop(resubscribe_rx).await });
        inner.tasks.lock().await.push(handle);

        for pool in pools {
            if let Err(e) = inner.open_swap_subscription(pool).await {
                warn!(target: "scraper", pool = ?pool, error = %e, "initial swap subscription failed; queueing recovery");
                let _ = inner.resubscribe_tx.send(Resubscribe::Pool(pool)).await;
            }
        }
        if let Err(e) = inner.open_factory_subscription().await {
            warn!(target: "scraper", error = %e, "initial factory subscription failed; queueing recovery");
            let _ = inner.resubscribe_tx.send(Resubscribe::NewPools).await;
        }
        Ok(())
    }

    /// Hands out the single consumer end of the trade channel. Returns `None`
    /// after the first call.
    pub async fn trades(&self) -> Option<mpsc::Receiver<Trade>> {
        self.trades_rx.lock().await.take()
    }

    /// Registers a pair for scraping. One table entry exists per unique
    /// foreign name; re-registration returns a fresh handle to the same entry.
    pub fn scrape_pair(&self, pair: ExchangePair) -> Result<PairHandle, ScraperError> {
        {
            let status = read_lock(&self.inner.status);
            if let Some(err) = &status.error {
                return Err(err.clone());
            }
            if status.closed {
                return Err(ScraperError::Closed);
            }
        }
        let foreign_name = pair.foreign_name.clone();
        self.inner
            .pair_scrapers
            .entry(foreign_name.clone())
            .or_insert_with(|| PairEntry {
                pair: pair.clone(),
                closed: AtomicBool::new(false),
            });
        Ok(PairHandle {
            foreign_name,
            pair,
            engine: Arc::downgrade(&self.inner),
        })
    }

    /// Enumerates every unordered token pair across the known pools. Pools
    /// with fewer than two tokens, and tokens that do not resolve to a
    /// registered asset, are skipped.
    pub async fn fetch_available_pairs(&self) -> Result<Vec<ExchangePair>, ScraperError> {
        let inner = &self.inner;
        let pools: Vec<Address> = inner.pools.iter().map(|entry| *entry.key()).collect();
        let mut pairs = Vec::new();
        for pool in pools {
            let tokens = match inner.reader.pool_tokens(pool).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!(target: "scraper", pool = ?pool, error = %e, "failed to enumerate pool tokens");
                    continue;
                }
            };
            if tokens.len() < 2 {
                continue;
            }
            for i in 0..tokens.len() {
                for j in (i + 1)..tokens.len() {
                    let quote = match inner.resolve_asset(tokens[i]).await {
                        Some(asset) => asset,
                        None => continue,
                    };
                    let base = match inner.resolve_asset(tokens[j]).await {
                        Some(asset) => asset,
                        None => continue,
                    };
                    pairs.push(ExchangePair {
                        foreign_name: format!("{}-{}", quote.symbol, base.symbol),
                        symbol: quote.symbol.clone(),
                        quote,
                        base,
                        exchange: inner.config.exchange.clone(),
                        verified: true,
                    });
                }
            }
        }
        Ok(pairs)
    }

    /// The engine's terminal error, if one is set.
    pub fn error(&self) -> Option<ScraperError> {
        read_lock(&self.inner.status).error.clone()
    }

    /// Number of entries in the pair scraper table.
    pub fn pair_count(&self) -> usize {
        self.inner.pair_scrapers.len()
    }

    pub fn is_closed(&self) -> bool {
        read_lock(&self.inner.status).closed
    }

    /// Stops the engine: clears the running flag, marks every pair scraper
    /// closed, drops the outbound sender so the consumer observes terminal
    /// shutdown, closes both chain handles, and joins outstanding tasks.
    pub async fn close(&self) -> Result<(), ScraperError> {
        self.inner.shutdown_engine(None).await;
        Ok(())
    }
}

impl ScraperInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn outbound(&self) -> Option<mpsc::Sender<Trade>> {
        read_lock(&self.trades_tx).clone()
    }

    async fn resolve_asset(&self, token: Address) -> Option<Asset> {
        if let Some(asset) = self.registry.asset(token).await {
            return Some(asset);
        }
        self.registry.register_token(self.reader.as_ref(), token).await;
        self.registry.asset(token).await
    }

    //--------------------------------------- dispatcher ----------------------------------------//

    /// Single point of recovery: reads the resubscribe channel and reopens
    /// subscriptions one at a time, with bounded exponential backoff per
    /// request. Sequential recovery trades latency for not stampeding the
    /// node when many subscriptions die at once.
    async fn dispatcher_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Resubscribe>) {
        info!(target: "scraper", "resubscribe dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    if !self.is_running() {
                        break;
                    }
                    self.resubscribe_with_backoff(request).await;
                }
            }
        }
        debug!(target: "scraper", "resubscribe dispatcher stopped");
    }

    async fn resubscribe_with_backoff(self: &Arc<Self>, request: Resubscribe) {
        let base = self.config.resubscribe_backoff_base();
        let max = self.config.resubscribe_backoff_max();
        for attempt in 1..=MAX_RESUBSCRIBE_ATTEMPTS {
            if !self.is_running() {
                return;
            }
            let result = match request {
                Resubscribe::Pool(pool) => {
                    info!(target: "scraper", pool = ?pool, attempt, "resubscribing to pool swaps");
                    self.open_swap_subscription(pool).await
                }
                Resubscribe::NewPools => {
                    info!(target: "scraper", attempt, "resubscribing to new pools");
                    self.open_factory_subscription().await
                }
            };
            match result {
                Ok(()) => {
                    metrics::RESUBSCRIPTIONS.inc();
                    return;
                }
                Err(e) => {
                    let delay = backoff_with_jitter(attempt, base, max);
                    warn!(target: "scraper", request = ?request, error = %e, ?delay, "resubscribe attempt failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        error!(target: "scraper", request = ?request, "giving up after {MAX_RESUBSCRIBE_ATTEMPTS} resubscribe attempts");
    }

    //------------------------------------- subscriptions ---------------------------------------//

    /// Opens the live swap subscription for one pool, starting `lookback`
    /// blocks behind head, and spawns the task driving it.
    async fn open_swap_subscription(self: &Arc<Self>, pool: Address) -> Result<(), ChainError> {
        let head = self.reader.head_block().await?;
        let from_block = head.saturating_sub(self.config.swap_lookback_blocks);
        let subscription = self.stream.subscribe_swaps(pool, from_block).await?;
        let inner = self.clone();
        let handle =
            tokio::spawn(async move { inner.run_pool_subscription(pool, subscription).await });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn open_factory_subscription(self: &Arc<Self>) -> Result<(), ChainError> {
        let head = self.reader.head_block().await?;
        let from_block = head.saturating_sub(self.config.factory_lookback_blocks);
        let subscription = self
            .stream
            .subscribe_pool_creations(self.config.factory_address, from_block)
            .await?;
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.run_factory_subscription(subscription).await });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Drives one pool's swap subscription until shutdown or failure. On
    /// failure the pool address goes onto the resubscribe channel, provided
    /// the engine is still running.
    async fn run_pool_subscription(
        self: Arc<Self>,
        pool: Address,
        mut subscription: EventSubscription<RawSwap>,
    ) {
        info!(target: "scraper::sub_task", pool = ?pool, "subscribed to pool swaps");
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(target: "scraper::sub_task", pool = ?pool, "swap subscription task stopping");
                    return;
                }
                event = subscription.events.recv() => match event {
                    Some(swap) => self.handle_swap(swap).await,
                    None => break ChainError::StreamEnded,
                },
                err = subscription.errors.recv() => {
                    break err.unwrap_or(ChainError::StreamEnded);
                }
            }
        };
        warn!(target: "scraper::sub_task", pool = ?pool, error = %reason, "swap subscription lost");
        if self.is_running() {
            let _ = self.resubscribe_tx.send(Resubscribe::Pool(pool)).await;
        }
    }

    /// Drives the factory's pool-creation subscription. Unknown pools are
    /// inserted, their tokens registered, and a swap subscription opened; on
    /// failure the `NewPools` request goes onto the resubscribe channel.
    async fn run_factory_subscription(
        self: Arc<Self>,
        mut subscription: EventSubscription<PoolCreated>,
    ) {
        info!(target: "scraper::sub_task", "subscribed to new pools");
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(target: "scraper::sub_task", "factory subscription task stopping");
                    return;
                }
                event = subscription.events.recv() => match event {
                    Some(created) => self.handle_new_pool(created).await,
                    None => break ChainError::StreamEnded,
                },
                err = subscription.errors.recv() => {
                    break err.unwrap_or(ChainError::StreamEnded);
                }
            }
        };
        warn!(target: "scraper::sub_task", error = %reason, "factory subscription lost");
        if self.is_running() {
            let _ = self.resubscribe_tx.send(Resubscribe::NewPools).await;
        }
    }

    //---------------------------------------- handlers -----------------------------------------//

    async fn handle_new_pool(self: &Arc<Self>, created: PoolCreated) {
        if self.pools.insert(created.pool, ()).is_some() {
            debug!(target: "scraper", pool = ?created.pool, "pool already known");
            return;
        }
        metrics::POOLS_TRACKED.set(self.pools.len() as i64);
        info!(target: "scraper", pool = ?created.pool, block = created.block_number, "discovered new pool");
        // Register the pool's tokens before its swaps can reach the normalizer.
        self.registry
            .register_pool_tokens(self.reader.as_ref(), created.pool)
            .await;
        if let Err(e) = self.open_swap_subscription(created.pool).await {
            warn!(target: "scraper", pool = ?created.pool, error = %e, "failed to subscribe to new pool; queueing recovery");
            let _ = self.resubscribe_tx.send(Resubscribe::Pool(created.pool)).await;
        }
    }

    async fn handle_swap(&self, swap: RawSwap) {
        metrics::SWAPS_INGESTED.inc();
        let sell_asset = self.registry.asset(swap.token_in).await;
        let buy_asset = self.registry.asset(swap.token_out).await;
        let (sell_asset, buy_asset) = match (sell_asset, buy_asset) {
            (Some(sell), Some(buy)) => (sell, buy),
            _ => {
                metrics::SWAPS_DROPPED.with_label_values(&["unknown_token"]).inc();
                error!(
                    target: "scraper",
                    pool = ?swap.pool,
                    event = %swap.event_id(),
                    "swap references a token missing from the registry; dropping"
                );
                return;
            }
        };

        let normalized = match normalize::normalize_swap(
            &swap,
            &sell_asset,
            &buy_asset,
            &self.config.wrapped_native_symbol,
            &self.config.native_symbol,
        ) {
            Some(normalized) => normalized,
            None => {
                metrics::SWAPS_DROPPED.with_label_values(&["zero_volume"]).inc();
                warn!(
                    target: "scraper",
                    pool = ?swap.pool,
                    event = %swap.event_id(),
                    "swap has zero buy volume; dropping"
                );
                return;
            }
        };

        let pair_key = normalized.pair_key();
        let pair = match self.pair_scrapers.get(&pair_key) {
            Some(entry) => entry.pair.clone(),
            None => {
                metrics::SWAPS_DROPPED.with_label_values(&["unregistered_pair"]).inc();
                warn!(
                    target: "scraper",
                    pair = %pair_key,
                    event = %normalized.id,
                    "no pair scraper registered for swap; dropping"
                );
                return;
            }
        };

        let trade = normalize::trade_from_swap(
            &normalized,
            &pair,
            sell_asset,
            buy_asset,
            &self.config.exchange,
        );
        let sender = match self.outbound() {
            Some(sender) => sender,
            None => return,
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            sent = sender.send(trade) => match sent {
                Ok(()) => metrics::TRADES_EMITTED.inc(),
                Err(_) => warn!(target: "scraper", "trade channel consumer is gone; dropping trade"),
            }
        }
    }

    //---------------------------------------- shutdown -----------------------------------------//

    async fn shutdown_engine(&self, err: Option<ScraperError>) {
        self.running.store(false, Ordering::SeqCst);
        for entry in self.pair_scrapers.iter() {
            entry.value().closed.store(true, Ordering::SeqCst);
        }
        *write_lock(&self.trades_tx) = None;
        self.stream.close();
        self.reader.close();
        self.shutdown.cancel();
        {
            // Terminal error and closed flag flip in one critical section.
            let mut status = write_lock(&self.status);
            if status.error.is_none() {
                status.error = Some(err.unwrap_or(ScraperError::Closed));
            }
            status.closed = true;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for handle in handles {
            if timeout(SHUTDOWN_TASK_TIMEOUT, handle).await.is_err() {
                warn!(target: "scraper", "task did not stop within the shutdown timeout");
            }
        }
        info!(target: "scraper", "scraper shut down");
    }
}
