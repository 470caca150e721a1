//! # Chain Client Pair
//!
//! Low-level access to the chain node, split the way the engine consumes it:
//! a request/response handle ([`ChainReader`]) over HTTP for head queries,
//! historical factory scans and contract view calls, and a streaming handle
//! ([`ChainStream`]) over WebSocket for live event subscriptions.
//!
//! Both sides are traits so the engine and its tests never depend on a real
//! node. The ethers-backed implementations live here too; view calls go out
//! as raw-selector `eth_call`s and come back through `ethers::abi`.

use crate::errors::ChainError;
use crate::types::{PoolCreated, RawSwap};
use async_trait::async_trait;
use ethers::{
    abi::{self, ParamType},
    providers::{Http, Middleware, Provider, Ws},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, Filter, Log,
        TransactionRequest, H256,
    },
    utils::keccak256,
};
use futures::StreamExt;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

//================================================================================================//
//                                          CONSTANTS                                             //
//================================================================================================//

pub const SWAP_EVENT_SIGNATURE: &str = "LOG_SWAP(address,address,address,uint256,uint256)";
pub const NEW_POOL_EVENT_SIGNATURE: &str = "LOG_NEW_POOL(address,address)";

static SWAP_TOPIC: Lazy<H256> = Lazy::new(|| H256::from(keccak256(SWAP_EVENT_SIGNATURE)));
static NEW_POOL_TOPIC: Lazy<H256> = Lazy::new(|| H256::from(keccak256(NEW_POOL_EVENT_SIGNATURE)));

/// ERC20 decimals selector
static DECIMALS_SELECTOR: Lazy<Bytes> = Lazy::new(|| {
    hex::decode("313ce567")
        .map(Bytes::from)
        .expect("Invalid selector for decimals()")
});

const EVENT_CHANNEL_CAPACITY: usize = 64;

//================================================================================================//
//                                            TRAITS                                              //
//================================================================================================//

/// A live event subscription: a channel of typed events plus a channel that
/// yields the terminal subscription error. Dropping the producer side closes
/// both channels.
pub struct EventSubscription<T> {
    pub events: mpsc::Receiver<T>,
    pub errors: mpsc::Receiver<ChainError>,
}

/// Request/response access to the chain node.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// All pool-creation events emitted by `factory` from `from_block` through
    /// the current head.
    async fn pool_creations_since(
        &self,
        factory: Address,
        from_block: u64,
    ) -> Result<Vec<PoolCreated>, ChainError>;

    /// The pool's current token list (`getCurrentTokens()`).
    async fn pool_tokens(&self, pool: Address) -> Result<Vec<Address>, ChainError>;

    async fn token_symbol(&self, token: Address) -> Result<String, ChainError>;
    async fn token_name(&self, token: Address) -> Result<String, ChainError>;
    async fn token_decimals(&self, token: Address) -> Result<u8, ChainError>;

    /// Marks the handle closed; subsequent calls fail with [`ChainError::Closed`].
    fn close(&self);
}

/// Streaming access to the chain node.
#[async_trait]
pub trait ChainStream: Send + Sync {
    /// Live swap events for one pool, replaying history from `from_block`.
    async fn subscribe_swaps(
        &self,
        pool: Address,
        from_block: u64,
    ) -> Result<EventSubscription<RawSwap>, ChainError>;

    /// Live pool-creation events from the factory, replaying history from
    /// `from_block`.
    async fn subscribe_pool_creations(
        &self,
        factory: Address,
        from_block: u64,
    ) -> Result<EventSubscription<PoolCreated>, ChainError>;

    /// Terminates every open subscription and rejects new ones.
    fn close(&self);
}

//================================================================================================//
//                                        EVENT DECODING                                          //
//================================================================================================//

/// Decodes a `LOG_SWAP` log. Token addresses ride in topics 2 and 3, the two
/// amounts in the data section.
pub fn decode_swap_log(log: &Log) -> Result<RawSwap, ChainError> {
    if log.topics.len() < 4 {
        return Err(ChainError::DataEncoding(format!(
            "swap log has {} topics, expected 4",
            log.topics.len()
        )));
    }
    let token_in = Address::from_slice(&log.topics[2].as_bytes()[12..]);
    let token_out = Address::from_slice(&log.topics[3].as_bytes()[12..]);

    let decoded = abi::decode(
        &[ParamType::Uint(256), ParamType::Uint(256)],
        log.data.as_ref(),
    )
    .map_err(|e| ChainError::DataEncoding(format!("swap log data: {e}")))?;
    let amount_in = decoded[0]
        .clone()
        .into_uint()
        .ok_or_else(|| ChainError::DataEncoding("swap amount-in is not a uint".into()))?;
    let amount_out = decoded[1]
        .clone()
        .into_uint()
        .ok_or_else(|| ChainError::DataEncoding("swap amount-out is not a uint".into()))?;

    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| ChainError::DataEncoding("swap log missing transaction hash".into()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| ChainError::DataEncoding("swap log missing log index".into()))?;

    Ok(RawSwap {
        pool: log.address,
        token_in,
        token_out,
        amount_in,
        amount_out,
        tx_hash,
        log_index,
        block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
    })
}

/// Decodes a `LOG_NEW_POOL` log; the pool address rides in topic 2.
pub fn decode_new_pool_log(log: &Log) -> Result<PoolCreated, ChainError> {
    if log.topics.len() < 3 {
        return Err(ChainError::DataEncoding(format!(
            "pool-creation log has {} topics, expected 3",
            log.topics.len()
        )));
    }
    Ok(PoolCreated {
        pool: Address::from_slice(&log.topics[2].as_bytes()[12..]),
        block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
    })
}

fn swap_filter(pool: Address, from_block: u64) -> Filter {
    Filter::new()
        .address(pool)
        .topic0(*SWAP_TOPIC)
        .from_block(from_block)
}

fn new_pool_filter(factory: Address, from_block: u64) -> Filter {
    Filter::new()
        .address(factory)
        .topic0(*NEW_POOL_TOPIC)
        .from_block(from_block)
}

//================================================================================================//
//                                      HTTP IMPLEMENTATION                                       //
//================================================================================================//

pub struct EthChainReader {
    provider: Arc<Provider<Http>>,
    closed: AtomicBool,
}

impl EthChainReader {
    pub fn connect(url: &str) -> Result<Self, ChainError> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| ChainError::Connection(e.to_string()))?;
        Ok(Self {
            provider: Arc::new(provider),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), ChainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChainError::Closed);
        }
        Ok(())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.ensure_open()?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, None).await.map_err(ChainError::from)
    }

    async fn call_selector(&self, to: Address, signature: &str) -> Result<Bytes, ChainError> {
        let selector = ethers::utils::id(signature).to_vec();
        self.call(to, Bytes::from(selector)).await
    }

    /// Decodes a string return value, falling back to the legacy bytes32
    /// encoding some older tokens use for `symbol()`/`name()`.
    fn decode_string(raw: &Bytes) -> Result<String, ChainError> {
        if let Ok(mut tokens) = abi::decode(&[ParamType::String], raw.as_ref()) {
            if let Some(value) = tokens.pop().and_then(|t| t.into_string()) {
                return Ok(value);
            }
        }
        if raw.len() == 32 {
            let trimmed: Vec<u8> = raw.iter().copied().take_while(|&b| b != 0).collect();
            return String::from_utf8(trimmed)
                .map_err(|e| ChainError::DataEncoding(format!("bytes32 string: {e}")));
        }
        Err(ChainError::DataEncoding(format!(
            "cannot decode string from {} bytes",
            raw.len()
        )))
    }
}

#[async_trait]
impl ChainReader for EthChainReader {
    async fn head_block(&self) -> Result<u64, ChainError> {
        self.ensure_open()?;
        let head = self.provider.get_block_number().await?;
        Ok(head.as_u64())
    }

    async fn pool_creations_since(
        &self,
        factory: Address,
        from_block: u64,
    ) -> Result<Vec<PoolCreated>, ChainError> {
        self.ensure_open()?;
        let filter = new_pool_filter(factory, from_block).to_block(BlockNumber::Latest);
        let logs = self.provider.get_logs(&filter).await?;
        let mut created = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_new_pool_log(log) {
                Ok(event) => created.push(event),
                Err(e) => warn!(target: "chain", error = %e, "skipping undecodable pool-creation log"),
            }
        }
        Ok(created)
    }

    async fn pool_tokens(&self, pool: Address) -> Result<Vec<Address>, ChainError> {
        let raw = self.call_selector(pool, "getCurrentTokens()").await?;
        let decoded = abi::decode(
            &[ParamType::Array(Box::new(ParamType::Address))],
            raw.as_ref(),
        )
        .map_err(|e| ChainError::DataEncoding(format!("getCurrentTokens: {e}")))?;
        let tokens = decoded
            .into_iter()
            .next()
            .and_then(|t| t.into_array())
            .ok_or_else(|| ChainError::DataEncoding("getCurrentTokens: not an array".into()))?;
        Ok(tokens
            .into_iter()
            .filter_map(|t| t.into_address())
            .collect())
    }

    async fn token_symbol(&self, token: Address) -> Result<String, ChainError> {
        let raw = self.call_selector(token, "symbol()").await?;
        Self::decode_string(&raw)
    }

    async fn token_name(&self, token: Address) -> Result<String, ChainError> {
        let raw = self.call_selector(token, "name()").await?;
        Self::decode_string(&raw)
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, ChainError> {
        let raw = self.call(token, DECIMALS_SELECTOR.clone()).await?;
        if raw.len() == 32 {
            // uint8 lives in the last byte of the word
            Ok(raw[31])
        } else {
            Err(ChainError::DataEncoding(format!(
                "invalid decimals response length: expected 32 bytes, got {}",
                raw.len()
            )))
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

//================================================================================================//
//                                    WEBSOCKET IMPLEMENTATION                                    //
//================================================================================================//

pub struct EthChainStream {
    provider: Arc<Provider<Ws>>,
    cancel: CancellationToken,
}

impl EthChainStream {
    pub async fn connect(url: &str) -> Result<Self, ChainError> {
        let provider = Provider::<Ws>::connect(url)
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?;
        Ok(Self {
            provider: Arc::new(provider),
            cancel: CancellationToken::new(),
        })
    }

    fn open_subscription<T, F>(
        &self,
        filter: Filter,
        decode: F,
    ) -> Result<EventSubscription<T>, ChainError>
    where
        T: Send + 'static,
        F: Fn(&Log) -> Result<T, ChainError> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(ChainError::Closed);
        }
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);
        let provider = self.provider.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            forward_logs(provider, filter, cancel, event_tx, error_tx, decode).await;
        });
        Ok(EventSubscription {
            events: event_rx,
            errors: error_rx,
        })
    }
}

#[async_trait]
impl ChainStream for EthChainStream {
    async fn subscribe_swaps(
        &self,
        pool: Address,
        from_block: u64,
    ) -> Result<EventSubscription<RawSwap>, ChainError> {
        self.open_subscription(swap_filter(pool, from_block), decode_swap_log)
    }

    async fn subscribe_pool_creations(
        &self,
        factory: Address,
        from_block: u64,
    ) -> Result<EventSubscription<PoolCreated>, ChainError> {
        self.open_subscription(new_pool_filter(factory, from_block), decode_new_pool_log)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Replays the historical tail of `filter`, then drains the live log stream.
/// Decoded events go to `event_tx`; the terminal failure goes to `error_tx`.
async fn forward_logs<T, F>(
    provider: Arc<Provider<Ws>>,
    filter: Filter,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<T>,
    error_tx: mpsc::Sender<ChainError>,
    decode: F,
) where
    T: Send + 'static,
    F: Fn(&Log) -> Result<T, ChainError> + Send + 'static,
{
    let tail = match provider.get_logs(&filter).await {
        Ok(logs) => logs,
        Err(e) => {
            let _ = error_tx.send(ChainError::from(e)).await;
            return;
        }
    };
    for log in &tail {
        match decode(log) {
            Ok(event) => {
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(target: "chain::sub_task", error = %e, "skipping undecodable log in tail"),
        }
    }

    let mut stream = match provider.subscribe_logs(&filter).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = error_tx.send(ChainError::Subscription(e.to_string())).await;
            return;
        }
    };
    debug!(target: "chain::sub_task", "log subscription established");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target: "chain::sub_task", "log subscription cancelled");
                return;
            }
            next = stream.next() => match next {
                Some(log) => match decode(&log) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(target: "chain::sub_task", error = %e, "skipping undecodable log"),
                },
                None => {
                    let _ = error_tx.send(ChainError::StreamEnded).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{H160, U256, U64};

    fn topic_address(addr: H160) -> H256 {
        let mut raw = [0u8; 32];
        raw[12..].copy_from_slice(addr.as_bytes());
        H256::from(raw)
    }

    fn swap_log() -> Log {
        let token_in = H160::repeat_byte(0x11);
        let token_out = H160::repeat_byte(0x22);
        let mut data = [0u8; 64];
        U256::from(1_000_000u64).to_big_endian(&mut data[..32]);
        U256::from(2_000u64).to_big_endian(&mut data[32..]);
        Log {
            address: H160::repeat_byte(0xaa),
            topics: vec![
                *SWAP_TOPIC,
                topic_address(H160::repeat_byte(0xca)),
                topic_address(token_in),
                topic_address(token_out),
            ],
            data: Bytes::from(data.to_vec()),
            block_number: Some(U64::from(123u64)),
            transaction_hash: Some(H256::repeat_byte(0x77)),
            log_index: Some(U256::from(5u64)),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_swap_log() {
        let swap = decode_swap_log(&swap_log()).unwrap();
        assert_eq!(swap.pool, H160::repeat_byte(0xaa));
        assert_eq!(swap.token_in, H160::repeat_byte(0x11));
        assert_eq!(swap.token_out, H160::repeat_byte(0x22));
        assert_eq!(swap.amount_in, U256::from(1_000_000u64));
        assert_eq!(swap.amount_out, U256::from(2_000u64));
        assert_eq!(swap.block_number, 123);
        assert!(swap.event_id().ends_with("-5"));
    }

    #[test]
    fn rejects_swap_log_with_missing_topics() {
        let mut log = swap_log();
        log.topics.truncate(2);
        assert!(decode_swap_log(&log).is_err());
    }

    #[test]
    fn decodes_new_pool_log() {
        let pool = H160::repeat_byte(0xbb);
        let log = Log {
            address: H160::repeat_byte(0xfa),
            topics: vec![
                *NEW_POOL_TOPIC,
                topic_address(H160::repeat_byte(0xca)),
                topic_address(pool),
            ],
            data: Bytes::default(),
            block_number: Some(U64::from(99u64)),
            ..Default::default()
        };
        let created = decode_new_pool_log(&log).unwrap();
        assert_eq!(created.pool, pool);
        assert_eq!(created.block_number, 99);
    }

    #[test]
    fn decodes_bytes32_symbol() {
        let mut raw = [0u8; 32];
        raw[..3].copy_from_slice(b"MKR");
        let decoded = EthChainReader::decode_string(&Bytes::from(raw.to_vec())).unwrap();
        assert_eq!(decoded, "MKR");
    }
}
