//! # Token Registry
//!
//! Per-token metadata for every token referenced by a known pool, keyed by
//! canonical address. Populated once during bootstrap by walking the pool
//! set and calling each pool's token list; extended live when the factory
//! stream discovers a new pool, before that pool's swap subscription opens.
//!
//! Registration is best-effort: a failed metadata call is logged and the
//! token skipped, never an error for the registry as a whole. Blacklisted
//! symbols are rejected at registration time.

use crate::chain::ChainReader;
use crate::types::Asset;
use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct TokenRegistry {
    chain: String,
    blacklist: HashSet<String>,
    assets: RwLock<HashMap<Address, Asset>>,
}

impl TokenRegistry {
    pub fn new(chain: String, blacklist: impl IntoIterator<Item = String>) -> Self {
        Self {
            chain,
            blacklist: blacklist
                .into_iter()
                .map(|s| s.trim().to_uppercase())
                .collect(),
            assets: RwLock::new(HashMap::new()),
        }
    }

    /// Registers every distinct token across `pools`. Per-pool and per-token
    /// failures are logged and skipped.
    pub async fn bootstrap(&self, reader: &dyn ChainReader, pools: &[Address]) {
        let mut token_set: HashSet<Address> = HashSet::new();
        for &pool in pools {
            match reader.pool_tokens(pool).await {
                Ok(tokens) => token_set.extend(tokens),
                Err(e) => {
                    warn!(target: "registry", pool = ?pool, error = %e, "failed to fetch pool token list")
                }
            }
        }
        for token in token_set {
            self.register_token(reader, token).await;
        }
        let count = self.assets.read().await.len();
        debug!(target: "registry", tokens = count, "token registry bootstrapped");
    }

    /// Registers the tokens of a single pool. Used for pools discovered after
    /// bootstrap, before their swap subscription opens.
    pub async fn register_pool_tokens(&self, reader: &dyn ChainReader, pool: Address) {
        match reader.pool_tokens(pool).await {
            Ok(tokens) => {
                for token in tokens {
                    self.register_token(reader, token).await;
                }
            }
            Err(e) => {
                warn!(target: "registry", pool = ?pool, error = %e, "failed to fetch pool token list")
            }
        }
    }

    /// Fetches and stores one token's metadata. Symbol and decimals are
    /// required; a missing name is stored empty.
    pub async fn register_token(&self, reader: &dyn ChainReader, token: Address) {
        if self.assets.read().await.contains_key(&token) {
            return;
        }
        let symbol = match reader.token_symbol(token).await {
            Ok(symbol) if !symbol.is_empty() => symbol,
            Ok(_) => {
                warn!(target: "registry", token = ?token, "token has empty symbol; skipping");
                return;
            }
            Err(e) => {
                warn!(target: "registry", token = ?token, error = %e, "symbol() failed; skipping token");
                return;
            }
        };
        if self.is_blacklisted(&symbol) {
            debug!(target: "registry", token = ?token, symbol = %symbol, "symbol is blacklisted; skipping");
            return;
        }
        let decimals = match reader.token_decimals(token).await {
            Ok(decimals) => decimals,
            Err(e) => {
                warn!(target: "registry", token = ?token, symbol = %symbol, error = %e, "decimals() failed; skipping token");
                return;
            }
        };
        let name = match reader.token_name(token).await {
            Ok(name) => name,
            Err(e) => {
                warn!(target: "registry", token = ?token, symbol = %symbol, error = %e, "name() failed; storing empty name");
                String::new()
            }
        };
        self.assets.write().await.insert(
            token,
            Asset {
                address: token,
                symbol,
                name,
                decimals,
                chain: self.chain.clone(),
            },
        );
    }

    pub async fn asset(&self, token: Address) -> Option<Asset> {
        self.assets.read().await.get(&token).cloned()
    }

    pub async fn contains(&self, token: Address) -> bool {
        self.assets.read().await.contains_key(&token)
    }

    pub async fn len(&self) -> usize {
        self.assets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.assets.read().await.is_empty()
    }

    fn is_blacklisted(&self, symbol: &str) -> bool {
        self.blacklist.contains(&symbol.trim().to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_comparison_is_case_insensitive() {
        let registry = TokenRegistry::new("Ethereum".into(), vec!["scam".to_string()]);
        assert!(registry.is_blacklisted("SCAM"));
        assert!(registry.is_blacklisted(" scam "));
        assert!(!registry.is_blacklisted("DAI"));
    }
}
