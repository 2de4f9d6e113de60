//! Dispatch of one event to its subscription set.
//!
//! The processor enforces priority ordering, the per-subscriber circuit
//! breaker, the global concurrency cap, the per-handler deadline, and the
//! bounded retry loop. Handler failures never propagate; they come back as
//! typed dispatch errors on the outcome record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::bus::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::bus::registry::Subscription;
use crate::config::ProcessingConfig;
use crate::core::clock::Clock;
use crate::protocol::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    HandlerFailure,
    Timeout,
    CircuitBreakerOpen,
}

impl DispatchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchErrorKind::HandlerFailure => "handler_failure",
            DispatchErrorKind::Timeout => "timeout",
            DispatchErrorKind::CircuitBreakerOpen => "circuit_breaker_open",
        }
    }
}

/// One failed delivery attempt (or a breaker denial).
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub subscription_id: Uuid,
    pub subscriber_id: String,
    pub kind: DispatchErrorKind,
    pub message: String,
    /// True on the last attempt of an exhausted retry loop. Terminal errors
    /// divert the event to the dead-letter queue.
    pub terminal: bool,
}

/// Result of dispatching one event. Never an `Err`: handler failures are
/// data, not control flow.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub event_id: Uuid,
    pub successful_handlers: usize,
    pub failed_handlers: usize,
    pub errors: Vec<DispatchError>,
    pub processing_time: Duration,
}

impl DispatchOutcome {
    /// Whether a given subscription completed without any failed attempt.
    pub fn succeeded(&self, subscription_id: Uuid) -> bool {
        !self
            .errors
            .iter()
            .any(|error| error.subscription_id == subscription_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingStats {
    pub events_processed: u64,
    pub events_failed: u64,
    pub successful_handlers: u64,
    pub failed_handlers: u64,
    pub total_processing_time: Duration,
    pub circuit_breaker_trips: u64,
}

impl ProcessingStats {
    pub fn average_processing_time(&self) -> Duration {
        if self.events_processed == 0 {
            return Duration::ZERO;
        }
        self.total_processing_time / self.events_processed as u32
    }
}

pub struct EventProcessor {
    config: ProcessingConfig,
    handler_timeout: Duration,
    retry_delay: Duration,
    semaphore: Arc<Semaphore>,
    breakers: Mutex<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
    stats: Mutex<ProcessingStats>,
    clock: Arc<dyn Clock>,
}

impl EventProcessor {
    pub fn new(config: ProcessingConfig, retry_delay: Duration, clock: Arc<dyn Clock>) -> Self {
        let handler_timeout = Duration::from_secs_f64(config.max_processing_time_seconds);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_handlers));
        Self {
            config,
            handler_timeout,
            retry_delay,
            semaphore,
            breakers: Mutex::new(HashMap::new()),
            stats: Mutex::new(ProcessingStats::default()),
            clock,
        }
    }

    /// Dispatches `event` to every active subscription, highest priority
    /// first (registration order breaking ties).
    pub async fn process_event(
        &self,
        event: &Event,
        subscriptions: &[Arc<Subscription>],
    ) -> DispatchOutcome {
        let started = Instant::now();

        let mut ordered: Vec<&Arc<Subscription>> = subscriptions.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        let mut successful_handlers = 0;
        let mut failed_handlers = 0;
        let mut errors: Vec<DispatchError> = Vec::new();

        for subscription in ordered {
            if !subscription.is_active() {
                continue;
            }

            if self.config.circuit_breaker_enabled && !self.allow(&subscription.subscriber_id) {
                failed_handlers += 1;
                errors.push(DispatchError {
                    subscription_id: subscription.subscription_id,
                    subscriber_id: subscription.subscriber_id.clone(),
                    kind: DispatchErrorKind::CircuitBreakerOpen,
                    message: "circuit breaker is open".to_string(),
                    terminal: false,
                });
                continue;
            }

            let permit = self
                .semaphore
                .acquire()
                .await
                .expect("handler semaphore closed");
            let delivered = self.invoke_with_retry(event, subscription, &mut errors).await;
            drop(permit);

            if delivered {
                successful_handlers += 1;
                if self.config.circuit_breaker_enabled {
                    self.record_breaker_success(&subscription.subscriber_id);
                }
            } else {
                failed_handlers += 1;
            }
        }

        let processing_time = started.elapsed();
        if self.config.enable_metrics {
            let mut stats = self.stats.lock().expect("processor stats poisoned");
            stats.events_processed += 1;
            if !errors.is_empty() {
                stats.events_failed += 1;
            }
            stats.successful_handlers += successful_handlers as u64;
            stats.failed_handlers += failed_handlers as u64;
            stats.total_processing_time += processing_time;
        }

        DispatchOutcome {
            event_id: event.event_id,
            successful_handlers,
            failed_handlers,
            errors,
            processing_time,
        }
    }

    /// Runs the bounded retry loop for one subscription. Pushes one error per
    /// failed attempt; the last attempt is marked terminal. Returns whether
    /// the handler eventually succeeded.
    async fn invoke_with_retry(
        &self,
        event: &Event,
        subscription: &Subscription,
        errors: &mut Vec<DispatchError>,
    ) -> bool {
        let attempts = subscription.max_retries + 1;
        for attempt in 1..=attempts {
            let result =
                tokio::time::timeout(self.handler_timeout, subscription.handler.handle(event))
                    .await;

            let (kind, message) = match result {
                Ok(Ok(())) => return true,
                Ok(Err(err)) => (DispatchErrorKind::HandlerFailure, err.to_string()),
                Err(_) => (
                    DispatchErrorKind::Timeout,
                    format!("handler timeout after {:?}", self.handler_timeout),
                ),
            };

            debug!(
                "attempt {attempt}/{attempts} failed for subscriber '{}' on event {}: {message}",
                subscription.subscriber_id, event.event_id
            );
            if self.config.circuit_breaker_enabled {
                self.record_breaker_failure(&subscription.subscriber_id);
            }
            errors.push(DispatchError {
                subscription_id: subscription.subscription_id,
                subscriber_id: subscription.subscriber_id.clone(),
                kind,
                message,
                terminal: attempt == attempts,
            });

            if attempt < attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        false
    }

    fn breaker(&self, subscriber_id: &str) -> Arc<Mutex<CircuitBreaker>> {
        let mut breakers = self.breakers.lock().expect("breaker map poisoned");
        breakers
            .entry(subscriber_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(
                    BreakerConfig::default(),
                    self.clock.clone(),
                )))
            })
            .clone()
    }

    fn allow(&self, subscriber_id: &str) -> bool {
        let breaker = self.breaker(subscriber_id);
        let mut breaker = breaker.lock().expect("breaker poisoned");
        breaker.should_allow()
    }

    fn record_breaker_success(&self, subscriber_id: &str) {
        let breaker = self.breaker(subscriber_id);
        let mut breaker = breaker.lock().expect("breaker poisoned");
        breaker.record_success();
    }

    fn record_breaker_failure(&self, subscriber_id: &str) {
        let breaker = self.breaker(subscriber_id);
        let mut breaker = breaker.lock().expect("breaker poisoned");
        let was_open = breaker.state() == BreakerState::Open;
        breaker.record_failure();
        if !was_open && breaker.state() == BreakerState::Open {
            self.stats
                .lock()
                .expect("processor stats poisoned")
                .circuit_breaker_trips += 1;
        }
    }

    /// Breaker state for a subscriber, if one has been created.
    pub fn breaker_state(&self, subscriber_id: &str) -> Option<BreakerState> {
        let breakers = self.breakers.lock().expect("breaker map poisoned");
        breakers
            .get(subscriber_id)
            .map(|breaker| breaker.lock().expect("breaker poisoned").state())
    }

    pub fn stats(&self) -> ProcessingStats {
        self.stats.lock().expect("processor stats poisoned").clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().expect("processor stats poisoned") = ProcessingStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler::{handler_fn, EventHandler};
    use crate::bus::registry::SubscriptionRegistry;
    use crate::config::SubscriptionConfig;
    use crate::core::clock::{system_clock, ManualClock};
    use crate::protocol::{EventPayload, EventType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn processor() -> EventProcessor {
        EventProcessor::new(
            ProcessingConfig::default(),
            Duration::from_millis(1),
            system_clock(),
        )
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(SubscriptionConfig::default())
    }

    fn event() -> Event {
        Event::new(EventType::CandleUpdate, EventPayload::None)
    }

    fn recording_handler(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn EventHandler> {
        handler_fn(move |_event| {
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    #[tokio::test]
    async fn handlers_start_in_priority_order() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .add_subscription(
                "a",
                recording_handler(log.clone(), "a"),
                vec![EventType::CandleUpdate],
                Some(10),
                None,
            )
            .unwrap();
        registry
            .add_subscription(
                "b",
                recording_handler(log.clone(), "b"),
                vec![EventType::CandleUpdate],
                Some(1),
                None,
            )
            .unwrap();
        registry
            .add_subscription(
                "c",
                recording_handler(log.clone(), "c"),
                vec![EventType::CandleUpdate],
                Some(5),
                None,
            )
            .unwrap();

        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);
        let outcome = processor().process_event(&event(), &subs).await;

        assert_eq!(outcome.successful_handlers, 3);
        assert_eq!(outcome.failed_handlers, 0);
        assert_eq!(*log.lock().unwrap(), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_one_error_per_attempt() {
        let registry = registry();
        let id = registry
            .add_subscription(
                "flaky",
                handler_fn(|_event| anyhow::bail!("kaput")),
                vec![EventType::CandleUpdate],
                None,
                Some(2),
            )
            .unwrap();

        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);
        let outcome = processor().process_event(&event(), &subs).await;

        assert_eq!(outcome.successful_handlers, 0);
        assert_eq!(outcome.failed_handlers, 1);
        assert_eq!(outcome.errors.len(), 3);
        assert!(outcome.errors.iter().all(|e| e.subscription_id == id));
        assert!(outcome.errors.iter().all(|e| e.kind == DispatchErrorKind::HandlerFailure));
        assert_eq!(
            outcome.errors.iter().filter(|e| e.terminal).count(),
            1,
            "only the last attempt is terminal"
        );
        assert!(outcome.errors.last().unwrap().terminal);
        assert!(!outcome.succeeded(id));
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failure() {
        let registry = registry();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let id = registry
            .add_subscription(
                "transient",
                handler_fn(move |_event| {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("first attempt fails")
                    }
                    Ok(())
                }),
                vec![EventType::CandleUpdate],
                None,
                Some(2),
            )
            .unwrap();

        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);
        let outcome = processor().process_event(&event(), &subs).await;

        assert_eq!(outcome.successful_handlers, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(!outcome.errors[0].terminal);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // The subscription still had a failed attempt recorded against it.
        assert!(!outcome.succeeded(id));
    }

    #[tokio::test]
    async fn slow_handlers_hit_the_deadline() {
        tokio::time::pause();
        let registry = registry();
        registry
            .add_subscription(
                "sleeper",
                crate::bus::handler::async_handler_fn(|_event| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(())
                    })
                }),
                vec![EventType::CandleUpdate],
                None,
                Some(0),
            )
            .unwrap();

        let processor = EventProcessor::new(
            ProcessingConfig {
                max_processing_time_seconds: 1.0,
                ..ProcessingConfig::default()
            },
            Duration::from_millis(1),
            system_clock(),
        );
        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);
        let outcome = processor.process_event(&event(), &subs).await;

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, DispatchErrorKind::Timeout);
        assert!(outcome.errors[0].terminal);
    }

    #[tokio::test]
    async fn open_breaker_denies_until_reset_elapses() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .add_subscription(
                "broken",
                handler_fn(move |_event| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("down")
                }),
                vec![EventType::CandleUpdate],
                None,
                Some(0),
            )
            .unwrap();

        let processor = EventProcessor::new(
            ProcessingConfig::default(),
            Duration::from_millis(1),
            clock.clone(),
        );
        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);

        // Five events, one attempt each: the breaker trips on the fifth.
        for _ in 0..5 {
            processor.process_event(&event(), &subs).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(processor.breaker_state("broken"), Some(BreakerState::Open));

        let outcome = processor.process_event(&event(), &subs).await;
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, DispatchErrorKind::CircuitBreakerOpen);
        assert!(!outcome.errors[0].terminal);
        assert_eq!(calls.load(Ordering::SeqCst), 5, "handler must not run while open");

        // After the reset timeout the half-open probe goes through.
        clock.advance(Duration::from_secs(61));
        processor.process_event(&event(), &subs).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let stats = processor.stats();
        assert!(stats.circuit_breaker_trips >= 1);
    }

    #[tokio::test]
    async fn stats_accumulate_and_reset() {
        let registry = registry();
        registry
            .add_subscription(
                "ok",
                handler_fn(|_event| Ok(())),
                vec![EventType::CandleUpdate],
                None,
                None,
            )
            .unwrap();
        let processor = processor();
        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);

        processor.process_event(&event(), &subs).await;
        processor.process_event(&event(), &subs).await;

        let stats = processor.stats();
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.events_failed, 0);
        assert_eq!(stats.successful_handlers, 2);

        processor.reset_stats();
        assert_eq!(processor.stats().events_processed, 0);
    }

    #[tokio::test]
    async fn inactive_subscriptions_are_skipped() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = registry
            .add_subscription(
                "gone",
                handler_fn(move |_event| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                vec![EventType::CandleUpdate],
                None,
                Some(0),
            )
            .unwrap();
        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);
        registry.record_failure(id, "poisoned").unwrap();

        let outcome = processor().process_event(&event(), &subs).await;
        assert_eq!(outcome.successful_handlers, 0);
        assert_eq!(outcome.failed_handlers, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
