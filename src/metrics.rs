//! Prometheus counters for the ingestion pipeline, registered once in the
//! default registry.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub static SWAPS_INGESTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scraper_swaps_ingested_total",
        "Raw swap events received across all pool subscriptions"
    )
    .expect("metric registration")
});

pub static TRADES_EMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scraper_trades_emitted_total",
        "Canonical trades emitted on the outbound channel"
    )
    .expect("metric registration")
});

pub static SWAPS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "scraper_swaps_dropped_total",
        "Swap events dropped before emission, by reason",
        &["reason"]
    )
    .expect("metric registration")
});

pub static RESUBSCRIPTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scraper_resubscriptions_total",
        "Successful subscription reopens handled by the dispatcher"
    )
    .expect("metric registration")
});

pub static POOLS_TRACKED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "scraper_pools_tracked",
        "Pools currently present in the pool registry"
    )
    .expect("metric registration")
});
