//! # Swap Normalization
//!
//! Pure transformation of raw swap events into normalized swaps and canonical
//! trades: decimal scaling, wrapped-native symbol aliasing, and price/volume
//! derivation. No I/O happens here; registry lookups are done by the caller.

use crate::types::{Asset, ExchangePair, NormalizedSwap, RawSwap, Trade};
use ethers::types::U256;

/// Converts a `U256` to `f64` by folding its limbs, so amounts far beyond
/// `u64::MAX` scale without silent truncation.
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .0
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 2f64.powi(64) + limb as f64)
}

/// The real token quantity represented by a raw integer amount.
pub fn scale_amount(raw: U256, decimals: u8) -> f64 {
    u256_to_f64(raw) / 10f64.powi(decimals as i32)
}

/// Rewrites the wrapped-native symbol to the native symbol.
pub fn alias_symbol(symbol: &str, wrapped_native: &str, native: &str) -> String {
    if symbol == wrapped_native {
        native.to_string()
    } else {
        symbol.to_string()
    }
}

/// Builds the normalized swap for a raw event. Returns `None` when the buy
/// volume scales to zero: such a swap has no finite price and is never
/// emitted as a trade.
pub fn normalize_swap(
    swap: &RawSwap,
    sell_asset: &Asset,
    buy_asset: &Asset,
    wrapped_native: &str,
    native: &str,
) -> Option<NormalizedSwap> {
    let sell_volume = scale_amount(swap.amount_in, sell_asset.decimals);
    let buy_volume = scale_amount(swap.amount_out, buy_asset.decimals);
    if buy_volume == 0.0 {
        return None;
    }
    Some(NormalizedSwap {
        sell_symbol: alias_symbol(&sell_asset.symbol, wrapped_native, native),
        buy_symbol: alias_symbol(&buy_asset.symbol, wrapped_native, native),
        sell_volume,
        buy_volume,
        id: swap.event_id(),
        timestamp: chrono::Utc::now().timestamp(),
    })
}

/// Derives the canonical trade for a normalized swap on a registered pair.
pub fn trade_from_swap(
    swap: &NormalizedSwap,
    pair: &ExchangePair,
    base: Asset,
    quote: Asset,
    source: &str,
) -> Trade {
    Trade {
        symbol: pair.symbol.clone(),
        pair: swap.pair_key(),
        price: swap.sell_volume / swap.buy_volume,
        volume: swap.buy_volume,
        timestamp: swap.timestamp,
        foreign_trade_id: swap.id.clone(),
        source: source.to_string(),
        base,
        quote,
        verified_pair: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, H256};

    fn asset(symbol: &str, decimals: u8) -> Asset {
        Asset {
            address: Address::repeat_byte(symbol.as_bytes()[0]),
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            decimals,
            chain: "Ethereum".to_string(),
        }
    }

    fn raw_swap(amount_in: U256, amount_out: U256) -> RawSwap {
        RawSwap {
            pool: Address::repeat_byte(0xaa),
            token_in: Address::repeat_byte(0x11),
            token_out: Address::repeat_byte(0x22),
            amount_in,
            amount_out,
            tx_hash: H256::repeat_byte(0x33),
            log_index: U256::from(7u64),
            block_number: 1,
        }
    }

    #[test]
    fn scaling_round_trips_for_large_k() {
        // k * 10^d scales back to k within float tolerance
        for (k, d) in [(1u64, 18u8), (123u64, 6), (1_000_000_000u64, 18), (999_999_999u64, 8)] {
            let raw = U256::from(k) * U256::exp10(d as usize);
            let scaled = scale_amount(raw, d);
            assert!(
                (scaled - k as f64).abs() < 1e-9 * k as f64 + 1e-9,
                "k={k} d={d} scaled={scaled}"
            );
        }
    }

    #[test]
    fn u256_beyond_u64_converts() {
        let big = U256::from(u64::MAX) + U256::one();
        assert_eq!(u256_to_f64(big), 2f64.powi(64));
    }

    #[test]
    fn aliases_wrapped_native_on_both_sides() {
        let weth = asset("WETH", 18);
        let dai = asset("DAI", 18);
        let swap = raw_swap(U256::exp10(18), U256::exp10(18));
        let normalized = normalize_swap(&swap, &weth, &dai, "WETH", "ETH").unwrap();
        assert_eq!(normalized.sell_symbol, "ETH");
        assert_eq!(normalized.buy_symbol, "DAI");
        assert_eq!(normalized.pair_key(), "DAI-ETH");
    }

    #[test]
    fn zero_buy_volume_is_rejected() {
        let a = asset("AAA", 6);
        let b = asset("BBB", 18);
        let swap = raw_swap(U256::exp10(6), U256::zero());
        assert!(normalize_swap(&swap, &a, &b, "WETH", "ETH").is_none());
    }

    #[test]
    fn derives_price_and_volume() {
        let a = asset("AAA", 6);
        let b = asset("BBB", 18);
        // in: 1.0 AAA, out: 2.0 BBB
        let swap = raw_swap(U256::exp10(6), U256::from(2u64) * U256::exp10(18));
        let normalized = normalize_swap(&swap, &a, &b, "WETH", "ETH").unwrap();
        assert_eq!(normalized.pair_key(), "BBB-AAA");
        let pair = ExchangePair {
            foreign_name: "BBB-AAA".into(),
            quote: b.clone(),
            base: a.clone(),
            symbol: "BBB".into(),
            exchange: "TestSwap".into(),
            verified: true,
        };
        let trade = trade_from_swap(&normalized, &pair, a, b, "TestSwap");
        assert!((trade.volume - 2.0).abs() < 1e-12);
        assert!((trade.price - 0.5).abs() < 1e-12);
        assert_eq!(trade.pair, "BBB-AAA");
        assert_eq!(trade.symbol, "BBB");
        assert!(trade.verified_pair);
        assert!(trade.foreign_trade_id.ends_with("-7"));
    }
}
