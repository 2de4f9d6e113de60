//! End-to-end dispatch behavior through the public bus API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marketflow::bus::{handler_fn, EventBus, HealthState};
use marketflow::config::EngineConfig;
use marketflow::core::{ErrorCategory, ErrorManager};
use marketflow::protocol::{metadata, Event, EventPayload, EventType};

fn config(workers: usize, queue: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.bus.num_workers = workers;
    config.bus.max_queue_size = queue;
    config.bus.dead_letter_queue_size = 16;
    config
}

fn candle_event() -> Event {
    Event::new(EventType::CandleUpdate, EventPayload::None)
}

async fn drain(bus: &EventBus) {
    drain_until(bus, 1).await;
}

async fn drain_until(bus: &EventBus, processed: u64) {
    for _ in 0..300 {
        let metrics = bus.get_metrics();
        if metrics.queue_size == 0 && metrics.events_processed >= processed {
            // One extra tick lets post-dispatch bookkeeping finish.
            tokio::time::sleep(Duration::from_millis(50)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn handlers_run_in_priority_order_for_one_event() {
    let bus = EventBus::new(config(4, 64), Arc::new(ErrorManager::new())).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (name, priority) in [("a", 10), ("b", 1), ("c", 5)] {
        let log = order.clone();
        bus.subscribe(
            name,
            handler_fn(move |_event| {
                log.lock().unwrap().push(name);
                Ok(())
            }),
            vec![EventType::CandleUpdate],
            Some(priority),
            None,
        )
        .unwrap();
    }

    bus.start().await;
    assert!(bus.publish(candle_event(), 0).await);
    drain(&bus).await;
    bus.stop().await;

    assert_eq!(*order.lock().unwrap(), vec!["a", "c", "b"]);
}

#[tokio::test]
async fn single_worker_preserves_priority_within_event() {
    let bus = EventBus::new(config(1, 64), Arc::new(ErrorManager::new())).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (name, priority) in [("low", 0), ("high", 9)] {
        let log = order.clone();
        bus.subscribe(
            name,
            handler_fn(move |_event| {
                log.lock().unwrap().push(name);
                Ok(())
            }),
            vec![EventType::CandleUpdate],
            Some(priority),
            None,
        )
        .unwrap();
    }

    bus.start().await;
    bus.publish(candle_event(), 0).await;
    drain(&bus).await;
    bus.stop().await;

    assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
}

#[tokio::test]
async fn retry_exhaustion_deactivates_and_dead_letters_once() {
    let bus = EventBus::new(config(2, 64), Arc::new(ErrorManager::new())).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let id = bus
        .subscribe(
            "always-fails",
            handler_fn(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("handler exploded")
            }),
            vec![EventType::CandleUpdate],
            None,
            Some(2),
        )
        .unwrap();

    bus.start().await;
    bus.publish(candle_event(), 0).await;
    drain(&bus).await;

    // Initial attempt plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let status = bus.subscription_status(id).unwrap();
    assert!(!status.is_active);
    assert_eq!(status.retry_count, 3);

    let dead = bus.get_dead_letter_events(10);
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].metadata[metadata::DEAD_LETTER_REASON],
        serde_json::Value::String("handler exploded".to_string())
    );
    assert!(dead[0]
        .metadata
        .contains_key(metadata::DEAD_LETTER_TIMESTAMP));

    // The deactivated subscription never sees another event.
    bus.publish(candle_event(), 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(bus.get_dead_letter_events(10).len(), 1);
    bus.stop().await;
}

#[tokio::test]
async fn zero_max_retries_deactivates_on_first_failure() {
    let bus = EventBus::new(config(1, 64), Arc::new(ErrorManager::new())).unwrap();
    let id = bus
        .subscribe(
            "strict",
            handler_fn(|_event| anyhow::bail!("nope")),
            vec![EventType::CandleUpdate],
            None,
            Some(0),
        )
        .unwrap();

    bus.start().await;
    bus.publish(candle_event(), 0).await;
    drain(&bus).await;
    bus.stop().await;

    assert!(!bus.subscription_status(id).unwrap().is_active);
}

#[tokio::test]
async fn overflow_drops_newest_and_reports_one_queue_error() {
    let errors = Arc::new(ErrorManager::new());
    let bus = EventBus::new(config(4, 2), errors.clone()).unwrap();
    // No workers: nothing drains the queue.
    bus.start_with_workers(0).await;

    assert!(bus.publish(candle_event(), 0).await);
    assert!(bus.publish(candle_event(), 0).await);
    assert!(!bus.publish(candle_event(), 0).await);

    let stats = errors.stats();
    assert_eq!(stats.by_category[&ErrorCategory::Queue], 1);
    bus.stop().await;
}

#[tokio::test]
async fn queue_of_one_rejects_the_second_publish() {
    let bus = EventBus::new(config(4, 1), Arc::new(ErrorManager::new())).unwrap();
    bus.start_with_workers(0).await;
    assert!(bus.publish(candle_event(), 0).await);
    assert!(!bus.publish(candle_event(), 0).await);
    bus.stop().await;
}

#[tokio::test]
async fn stop_returns_bus_to_refusing_publishes() {
    let bus = EventBus::new(config(2, 8), Arc::new(ErrorManager::new())).unwrap();
    bus.start().await;
    assert!(bus.publish(candle_event(), 0).await);
    bus.stop().await;
    assert!(!bus.publish(candle_event(), 0).await);
    assert_eq!(bus.health_check().status, HealthState::Stopped);
}

#[tokio::test]
async fn subscribe_unsubscribe_restores_counts() {
    let bus = EventBus::new(config(2, 8), Arc::new(ErrorManager::new())).unwrap();
    let before = bus.get_metrics();

    let id = bus
        .subscribe(
            "temp",
            handler_fn(|_event| Ok(())),
            vec![EventType::SmcSignal],
            None,
            None,
        )
        .unwrap();
    assert_eq!(bus.get_metrics().subscriptions, before.subscriptions + 1);

    assert!(bus.unsubscribe(id));
    let after = bus.get_metrics();
    assert_eq!(after.subscriptions, before.subscriptions);
    assert_eq!(after.active_subscriptions, before.active_subscriptions);
}

#[tokio::test]
async fn all_events_subscribers_see_every_type() {
    let bus = EventBus::new(config(2, 64), Arc::new(ErrorManager::new())).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    bus.subscribe(
        "firehose",
        handler_fn(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        vec![],
        None,
        None,
    )
    .unwrap();

    bus.start().await;
    bus.publish(Event::new(EventType::CandleUpdate, EventPayload::None), 0)
        .await;
    bus.publish(Event::new(EventType::OrderFilled, EventPayload::None), 0)
        .await;
    bus.publish(Event::new(EventType::TradingDecision, EventPayload::None), 0)
        .await;
    drain_until(&bus, 3).await;
    bus.stop().await;

    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn metrics_track_processed_and_failed_events() {
    let bus = EventBus::new(config(2, 64), Arc::new(ErrorManager::new())).unwrap();
    bus.subscribe(
        "ok",
        handler_fn(|_event| Ok(())),
        vec![EventType::CandleUpdate],
        None,
        None,
    )
    .unwrap();
    bus.subscribe(
        "broken",
        handler_fn(|_event| anyhow::bail!("down")),
        vec![EventType::OrderFilled],
        None,
        Some(0),
    )
    .unwrap();

    bus.start().await;
    bus.publish(Event::new(EventType::CandleUpdate, EventPayload::None), 0)
        .await;
    bus.publish(Event::new(EventType::OrderFilled, EventPayload::None), 0)
        .await;
    drain_until(&bus, 2).await;

    let metrics = bus.get_metrics();
    assert_eq!(metrics.events_published, 2);
    assert_eq!(metrics.events_processed, 2);
    assert_eq!(metrics.events_failed, 1);
    assert_eq!(metrics.successful_handlers, 1);
    assert_eq!(metrics.failed_handlers, 1);
    assert_eq!(metrics.dead_letter_size, 1);

    bus.reset_metrics();
    let reset = bus.get_metrics();
    assert_eq!(reset.events_published, 0);
    assert_eq!(reset.events_processed, 0);
    bus.stop().await;
}

#[tokio::test]
async fn higher_priority_events_dispatch_first_under_one_worker() {
    let bus = EventBus::new(config(1, 64), Arc::new(ErrorManager::new())).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();
    bus.subscribe(
        "collector",
        handler_fn(move |event| {
            if let EventPayload::Json(value) = &event.payload {
                log.lock().unwrap().push(value["n"].as_i64().unwrap());
            }
            Ok(())
        }),
        vec![EventType::CandleUpdate],
        None,
        None,
    )
    .unwrap();

    // Queue three events before any worker runs.
    bus.start_with_workers(0).await;
    for (n, priority) in [(1, 0), (2, 5), (3, 0)] {
        let event = Event::new(
            EventType::CandleUpdate,
            EventPayload::Json(serde_json::json!({ "n": n })),
        );
        assert!(bus.publish(event, priority).await);
    }
    bus.stop().await;

    bus.start_with_workers(1).await;
    drain_until(&bus, 3).await;
    bus.stop().await;

    // Priority 5 first, then FIFO among the equal-priority pair.
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 3]);
}
