use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use marketflow::bus::{handler_fn, EventBus};
use marketflow::config::EngineConfig;
use marketflow::core::ErrorManager;
use marketflow::ingest::{StreamIngester, VenueProfile};
use marketflow::market::{TimeFrame, Venue};
use marketflow::protocol::{EventPayload, EventType};
use marketflow::storage::{CandleStore, MemoryStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Venue to ingest (spot or usdm)
    #[arg(long, default_value = "spot")]
    venue: String,

    /// Comma-separated list of symbols to subscribe (e.g., BTCUSDT,ETHUSDT)
    #[arg(short, long, default_value = "BTCUSDT,ETHUSDT")]
    symbols: String,

    /// Comma-separated list of timeframes (e.g., 1m,5m,1h)
    #[arg(short, long, default_value = "5m,1h")]
    timeframes: String,

    /// Override the venue WebSocket base URL
    #[arg(long)]
    ws_url: Option<String>,

    /// Override the venue REST base URL
    #[arg(long)]
    rest_url: Option<String>,

    /// Worker pool size for the event bus
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let venue = Venue::from_str(&args.venue).context("invalid venue")?;
    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .collect();
    let timeframes: Vec<TimeFrame> = args
        .timeframes
        .split(',')
        .map(|s| TimeFrame::from_str(s.trim()))
        .collect::<Result<_, _>>()
        .context("invalid timeframe")?;

    let mut config = EngineConfig::default();
    config.bus.num_workers = args.workers;
    config.ingest.symbols = symbols;
    config.ingest.timeframes = timeframes;
    config.ingest.ws_base_url = args.ws_url;
    config.ingest.rest_base_url = args.rest_url;
    config.validate().context("invalid configuration")?;

    info!("starting {venue} feed");
    info!("symbols: {}", config.ingest.symbols.join(","));

    let errors = Arc::new(ErrorManager::new());
    let store: Arc<dyn CandleStore> = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(config.clone(), errors.clone())?);
    bus.start().await;

    // Log every closed candle that reaches the bus.
    bus.subscribe(
        "feed-logger",
        handler_fn(|event| {
            if let EventPayload::Candle(candle) = &event.payload {
                info!(
                    "{} {} {} close={} volume={}",
                    candle.venue, candle.symbol, candle.timeframe, candle.close, candle.volume
                );
            }
            Ok(())
        }),
        vec![EventType::CandleUpdate],
        None,
        None,
    )?;

    let ingester = Arc::new(StreamIngester::new(
        VenueProfile::for_venue(venue),
        config.ingest.clone(),
        store,
        bus.clone(),
        errors,
    ));

    let feed = ingester.clone();
    let feed_task = tokio::spawn(async move { feed.run().await });

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutting down");
    ingester.stop();
    let _ = feed_task.await;
    bus.stop().await;

    Ok(())
}
