//! Closed-candle semantics through the ingest pipeline: filter, dedup,
//! persist, publish.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use marketflow::bus::{handler_fn, EventBus};
use marketflow::config::{EngineConfig, IngestConfig};
use marketflow::core::ErrorManager;
use marketflow::ingest::{StreamIngester, VenueProfile};
use marketflow::market::TimeFrame;
use marketflow::protocol::{metadata, Event, EventPayload, EventType};
use marketflow::storage::{CandleStore, MemoryStore};

const BASE: i64 = 1_638_360_000_000;

fn kline_frame(open_time: i64, closed: bool, close_price: &str) -> Vec<u8> {
    serde_json::json!({
        "stream": "btcusdt@kline_5m",
        "data": {
            "e": "kline", "E": open_time + 300_000, "s": "BTCUSDT",
            "k": {
                "t": open_time, "T": open_time + 299_999, "s": "BTCUSDT", "i": "5m",
                "f": 100, "L": 250,
                "o": "50000.0", "c": close_price, "h": "50200.0", "l": "49900.0",
                "v": "120.5", "n": 150, "x": closed,
                "q": "6037500.0", "V": "60.5", "Q": "3037500.0"
            }
        }
    })
    .to_string()
    .into_bytes()
}

struct Pipeline {
    ingester: StreamIngester,
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    published: Arc<Mutex<Vec<Event>>>,
}

async fn pipeline() -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let errors = Arc::new(ErrorManager::new());
    let bus = Arc::new(EventBus::new(EngineConfig::default(), errors.clone()).unwrap());
    bus.start().await;

    let published = Arc::new(Mutex::new(Vec::new()));
    let sink = published.clone();
    bus.subscribe(
        "capture",
        handler_fn(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        }),
        vec![EventType::CandleUpdate],
        None,
        None,
    )
    .unwrap();

    let ingester = StreamIngester::new(
        VenueProfile::spot(),
        IngestConfig {
            symbols: vec!["BTCUSDT".to_string()],
            timeframes: vec![TimeFrame::M5],
            ..IngestConfig::default()
        },
        store.clone() as Arc<dyn CandleStore>,
        bus.clone(),
        errors,
    );

    Pipeline {
        ingester,
        store,
        bus,
        published,
    }
}

async fn settle(p: &Pipeline) {
    for _ in 0..200 {
        if p.bus.get_metrics().queue_size == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn forming_frame_is_silent_closing_frame_publishes() {
    let p = pipeline().await;

    p.ingester.handle_frame(kline_frame(BASE, false, "50100.0")).await;
    settle(&p).await;
    assert_eq!(p.store.candle_count(), 0);
    assert!(p.published.lock().unwrap().is_empty());

    p.ingester.handle_frame(kline_frame(BASE, true, "50150.0")).await;
    settle(&p).await;

    assert_eq!(p.store.candle_count(), 1);
    let published = p.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let event = &published[0];
    assert_eq!(event.event_type, EventType::CandleUpdate);
    match &event.payload {
        EventPayload::Candle(envelope) => {
            assert_eq!(envelope.close.to_string(), "50150.0");
            assert_eq!(envelope.venue.as_str(), "spot");
            assert_eq!(envelope.timeframe, TimeFrame::M5);
            assert!(envelope.open_time.ends_with('Z'));
        }
        other => panic!("unexpected payload {other:?}"),
    }
    drop(published);
    p.bus.stop().await;
}

#[tokio::test]
async fn replayed_close_is_deduped_against_persistence() {
    let p = pipeline().await;

    p.ingester.handle_frame(kline_frame(BASE, true, "50150.0")).await;
    // The venue re-sends the same close after a reconnect.
    p.ingester.handle_frame(kline_frame(BASE, true, "50150.0")).await;
    // A genuinely new bar still goes through.
    p.ingester.handle_frame(kline_frame(BASE + 300_000, true, "50250.0")).await;
    settle(&p).await;

    assert_eq!(p.store.candle_count(), 2);
    assert_eq!(p.published.lock().unwrap().len(), 2);
    p.bus.stop().await;
}

#[tokio::test]
async fn published_key_is_unique_across_the_run() {
    let p = pipeline().await;
    for _ in 0..5 {
        p.ingester.handle_frame(kline_frame(BASE, true, "50150.0")).await;
    }
    settle(&p).await;

    let published = p.published.lock().unwrap();
    assert_eq!(published.len(), 1, "one publication per candle key");
    drop(published);
    assert_eq!(p.store.candle_count(), 1);
    p.bus.stop().await;
}

#[tokio::test]
async fn live_candles_carry_no_backfill_tags() {
    let p = pipeline().await;
    p.ingester.handle_frame(kline_frame(BASE, true, "50150.0")).await;
    settle(&p).await;

    let published = p.published.lock().unwrap();
    assert!(!published[0].metadata_flag(metadata::IS_GAP_FILL));
    assert!(!published[0].metadata_flag(metadata::IS_HISTORICAL));
    assert!(published[0].metadata.contains_key(metadata::PUBLISHED_AT));
    drop(published);
    p.bus.stop().await;
}

#[tokio::test]
async fn bus_refusal_is_non_fatal_for_ingestion() {
    let store = Arc::new(MemoryStore::new());
    let errors = Arc::new(ErrorManager::new());
    let bus = Arc::new(EventBus::new(EngineConfig::default(), errors.clone()).unwrap());
    // Bus never started: every publish is refused.

    let ingester = StreamIngester::new(
        VenueProfile::spot(),
        IngestConfig {
            symbols: vec!["BTCUSDT".to_string()],
            timeframes: vec![TimeFrame::M5],
            ..IngestConfig::default()
        },
        store.clone() as Arc<dyn CandleStore>,
        bus,
        errors,
    );

    ingester.handle_frame(kline_frame(BASE, true, "50150.0")).await;

    // The candle is persisted even though the publish was dropped.
    assert_eq!(store.candle_count(), 1);
}
