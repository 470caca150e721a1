//! Binary entrypoint: load configuration, initialise tracing, connect the
//! chain client pair, start the scraper, and run the watchdog sink until
//! shutdown or a frozen pipeline.

use std::sync::Arc;
use std::time::Duration;
use swap_scraper::chain::{EthChainReader, EthChainStream};
use swap_scraper::watchdog::{run_sink, LoggingTradeStore, TradeStore};
use swap_scraper::{Config, SwapScraper};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("ethers_providers=warn".parse()?)
        .add_directive("ethers=warn".parse()?);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/scraper.json".to_string());
    let config = Config::load_from_file(&config_path).await?;
    info!(exchange = %config.exchange, chain = %config.chain, "configuration loaded");

    let reader = Arc::new(EthChainReader::connect(&config.http_url)?);
    let stream = Arc::new(EthChainStream::connect(&config.ws_url).await?);

    let watchdog_delay = config.watchdog_delay();
    let requested_pairs = config.pairs.clone();
    let scraper = SwapScraper::new(config, reader, stream);
    scraper.start().await?;

    let available = scraper.fetch_available_pairs().await?;
    info!(pairs = available.len(), "enumerated available pairs");
    let mut handles = Vec::new();
    for pair in available {
        if !requested_pairs.is_empty() && !requested_pairs.contains(&pair.foreign_name) {
            continue;
        }
        match scraper.scrape_pair(pair) {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!(error = %e, "failed to register pair"),
        }
    }
    info!(pairs = handles.len(), "scraping pairs");

    let trades = scraper
        .trades()
        .await
        .ok_or_else(|| eyre::eyre!("trade channel already taken"))?;
    let store: Arc<dyn TradeStore> = Arc::new(LoggingTradeStore);
    let mut sink = tokio::spawn(run_sink(trades, store, watchdog_delay));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            scraper.close().await?;
            let _ = tokio::time::timeout(Duration::from_secs(15), sink).await;
        }
        result = &mut sink => match result {
            Ok(Ok(())) => info!("trade sink exited"),
            Ok(Err(e)) => {
                error!(error = %e, "trade sink failed");
                let _ = scraper.close().await;
                std::process::exit(1);
            }
            Err(e) => error!(error = %e, "trade sink task panicked"),
        }
    }
    Ok(())
}
