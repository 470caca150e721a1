//! In-memory stand-ins for the chain client pair. The reader serves token
//! and pool metadata from maps; the stream hands out channel-backed
//! subscriptions whose producer ends stay with the test, so swaps, pool
//! creations, and subscription failures can be injected deterministically.

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use swap_scraper::chain::{ChainReader, ChainStream, EventSubscription};
use swap_scraper::errors::ChainError;
use swap_scraper::types::{PoolCreated, RawSwap};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

pub struct TokenMeta {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

#[derive(Default)]
pub struct MockChainReader {
    pub head: AtomicU64,
    pub creations: StdMutex<Vec<PoolCreated>>,
    pub pool_tokens: StdMutex<HashMap<Address, Vec<Address>>>,
    pub tokens: StdMutex<HashMap<Address, TokenMeta>>,
    pub closed: AtomicBool,
}

impl MockChainReader {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            ..Self::default()
        }
    }

    /// Registers a pool with its token list. When `created_on_chain` is set
    /// the pool also appears in the factory's historical creation scan.
    pub fn add_pool(&self, pool: Address, tokens: Vec<Address>, created_on_chain: Option<u64>) {
        self.pool_tokens.lock().unwrap().insert(pool, tokens);
        if let Some(block_number) = created_on_chain {
            self.creations.lock().unwrap().push(PoolCreated {
                pool,
                block_number,
            });
        }
    }

    pub fn add_token(&self, token: Address, symbol: &str, decimals: u8) {
        self.tokens.lock().unwrap().insert(
            token,
            TokenMeta {
                symbol: symbol.to_string(),
                name: format!("{symbol} Token"),
                decimals,
            },
        );
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn head_block(&self) -> Result<u64, ChainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChainError::Closed);
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn pool_creations_since(
        &self,
        _factory: Address,
        from_block: u64,
    ) -> Result<Vec<PoolCreated>, ChainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChainError::Closed);
        }
        Ok(self
            .creations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.block_number >= from_block)
            .copied()
            .collect())
    }

    async fn pool_tokens(&self, pool: Address) -> Result<Vec<Address>, ChainError> {
        self.pool_tokens
            .lock()
            .unwrap()
            .get(&pool)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("unknown pool {pool:?}")))
    }

    async fn token_symbol(&self, token: Address) -> Result<String, ChainError> {
        self.tokens
            .lock()
            .unwrap()
            .get(&token)
            .map(|meta| meta.symbol.clone())
            .ok_or_else(|| ChainError::Rpc(format!("unknown token {token:?}")))
    }

    async fn token_name(&self, token: Address) -> Result<String, ChainError> {
        self.tokens
            .lock()
            .unwrap()
            .get(&token)
            .map(|meta| meta.name.clone())
            .ok_or_else(|| ChainError::Rpc(format!("unknown token {token:?}")))
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, ChainError> {
        self.tokens
            .lock()
            .unwrap()
            .get(&token)
            .map(|meta| meta.decimals)
            .ok_or_else(|| ChainError::Rpc(format!("unknown token {token:?}")))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct SwapFeed {
    pub events: mpsc::Sender<RawSwap>,
    pub errors: mpsc::Sender<ChainError>,
    pub from_block: u64,
}

pub struct FactoryFeed {
    pub events: mpsc::Sender<PoolCreated>,
    pub errors: mpsc::Sender<ChainError>,
}

#[derive(Default)]
pub struct MockChainStream {
    pub swap_feeds: StdMutex<HashMap<Address, Vec<SwapFeed>>>,
    pub factory_feeds: StdMutex<Vec<FactoryFeed>>,
    pub closed: AtomicBool,
}

impl MockChainStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn swap_subscription_count(&self, pool: Address) -> usize {
        self.swap_feeds
            .lock()
            .unwrap()
            .get(&pool)
            .map(|feeds| feeds.len())
            .unwrap_or(0)
    }

    pub fn factory_subscription_count(&self) -> usize {
        self.factory_feeds.lock().unwrap().len()
    }

    /// Start block of the most recently opened subscription for `pool`.
    pub fn latest_swap_from_block(&self, pool: Address) -> Option<u64> {
        self.swap_feeds
            .lock()
            .unwrap()
            .get(&pool)
            .and_then(|feeds| feeds.last())
            .map(|feed| feed.from_block)
    }

    pub async fn wait_for_swap_subscriptions(
        &self,
        pool: Address,
        count: usize,
        deadline: Duration,
    ) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if self.swap_subscription_count(pool) >= count {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Delivers a swap on the most recently opened subscription for its pool.
    pub async fn send_swap(&self, swap: RawSwap) {
        let sender = {
            let feeds = self.swap_feeds.lock().unwrap();
            feeds
                .get(&swap.pool)
                .and_then(|feeds| feeds.last())
                .map(|feed| feed.events.clone())
                .expect("no swap subscription open for pool")
        };
        sender.send(swap).await.expect("swap receiver dropped");
    }

    /// Injects a terminal error on the most recently opened subscription.
    pub async fn fail_swap_subscription(&self, pool: Address) {
        let sender = {
            let feeds = self.swap_feeds.lock().unwrap();
            feeds
                .get(&pool)
                .and_then(|feeds| feeds.last())
                .map(|feed| feed.errors.clone())
                .expect("no swap subscription open for pool")
        };
        sender
            .send(ChainError::Subscription("injected failure".into()))
            .await
            .expect("error receiver dropped");
    }

    pub async fn send_pool_created(&self, created: PoolCreated) {
        let sender = {
            let feeds = self.factory_feeds.lock().unwrap();
            feeds
                .last()
                .map(|feed| feed.events.clone())
                .expect("no factory subscription open")
        };
        sender.send(created).await.expect("factory receiver dropped");
    }

    pub async fn fail_factory_subscription(&self) {
        let sender = {
            let feeds = self.factory_feeds.lock().unwrap();
            feeds
                .last()
                .map(|feed| feed.errors.clone())
                .expect("no factory subscription open")
        };
        sender
            .send(ChainError::Subscription("injected failure".into()))
            .await
            .expect("error receiver dropped");
    }
}

#[async_trait]
impl ChainStream for MockChainStream {
    async fn subscribe_swaps(
        &self,
        pool: Address,
        from_block: u64,
    ) -> Result<EventSubscription<RawSwap>, ChainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChainError::Closed);
        }
        let (event_tx, event_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(4);
        self.swap_feeds
            .lock()
            .unwrap()
            .entry(pool)
            .or_default()
            .push(SwapFeed {
                events: event_tx,
                errors: error_tx,
                from_block,
            });
        Ok(EventSubscription {
            events: event_rx,
            errors: error_rx,
        })
    }

    async fn subscribe_pool_creations(
        &self,
        _factory: Address,
        _from_block: u64,
    ) -> Result<EventSubscription<PoolCreated>, ChainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChainError::Closed);
        }
        let (event_tx, event_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(4);
        self.factory_feeds.lock().unwrap().push(FactoryFeed {
            events: event_tx,
            errors: error_tx,
        });
        Ok(EventSubscription {
            events: event_rx,
            errors: error_rx,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
