//! Multi-worker, priority-ordered event dispatcher.
//!
//! The bus owns the bounded priority queue, the worker pool, the
//! subscription registry, the event processor, and the dead-letter queue.
//! Publishing never blocks: a full queue drops the newest event and reports
//! a structured QUEUE error.

pub mod breaker;
pub mod dead_letter;
pub mod handler;
pub mod processor;
pub mod queue;
pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::clock::{rfc3339_ms, system_clock, Clock};
use crate::core::errors::{EngineError, EngineResult, ErrorManager};
use crate::protocol::{metadata, Event, EventType};
use crate::storage::EventStore;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use dead_letter::DeadLetterQueue;
pub use handler::{async_handler_fn, handler_fn, EventHandler};
pub use processor::{
    DispatchError, DispatchErrorKind, DispatchOutcome, EventProcessor, ProcessingStats,
};
pub use queue::{EventQueue, PushError};
pub use registry::{Subscription, SubscriptionRegistry, SubscriptionStatus};

/// How long a worker waits on an empty queue before re-checking the running
/// flag, keeping `stop()` responsive.
const WORKER_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Aggregate counters across registry, processor, and queue.
#[derive(Debug, Clone)]
pub struct BusMetrics {
    pub running: bool,
    pub workers: usize,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub events_published: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub successful_handlers: u64,
    pub failed_handlers: u64,
    pub average_processing_time: Duration,
    pub circuit_breaker_trips: u64,
    pub subscriptions: usize,
    pub active_subscriptions: usize,
    pub dead_letter_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Running,
    Stopped,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Running => "running",
            HealthState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub subscriptions: usize,
    pub active_subscriptions: usize,
    pub workers: usize,
}

pub struct EventBus {
    config: EngineConfig,
    queue: Arc<EventQueue>,
    registry: Arc<SubscriptionRegistry>,
    processor: Arc<EventProcessor>,
    dead_letters: Arc<DeadLetterQueue>,
    errors: Arc<ErrorManager>,
    event_store: Option<Arc<dyn EventStore>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    events_published: AtomicU64,
}

impl EventBus {
    /// Builds a bus from a validated configuration.
    pub fn new(config: EngineConfig, errors: Arc<ErrorManager>) -> EngineResult<Self> {
        Self::with_clock(config, errors, system_clock())
    }

    pub fn with_clock(
        config: EngineConfig,
        errors: Arc<ErrorManager>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let queue = Arc::new(EventQueue::new(config.bus.max_queue_size));
        let registry = Arc::new(SubscriptionRegistry::new(config.subscriptions.clone()));
        let processor = Arc::new(EventProcessor::new(
            config.processing.clone(),
            Duration::from_millis(config.subscriptions.retry_delay_ms),
            clock,
        ));
        let dead_letters = Arc::new(DeadLetterQueue::new(config.bus.dead_letter_queue_size));

        Ok(Self {
            config,
            queue,
            registry,
            processor,
            dead_letters,
            errors,
            event_store: None,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            events_published: AtomicU64::new(0),
        })
    }

    /// Attaches the optional event persistence backend used when
    /// `bus.enable_persistence` is set.
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// Launches the worker pool. Idempotent.
    pub async fn start(&self) {
        self.start_with_workers(self.config.bus.num_workers).await;
    }

    /// Launches a specific number of workers. Zero is allowed and leaves
    /// the queue to fill without draining.
    pub async fn start_with_workers(&self, workers: usize) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("event bus is already running");
            return;
        }
        self.queue.reopen();

        let mut handles = self.workers.lock().expect("worker handle lock poisoned");
        for index in 0..workers {
            handles.push(tokio::spawn(worker_loop(
                format!("worker-{index}"),
                self.running.clone(),
                self.queue.clone(),
                self.registry.clone(),
                self.processor.clone(),
                self.dead_letters.clone(),
                self.errors.clone(),
            )));
        }
        info!("event bus started with {workers} workers");
    }

    /// Stops the worker pool and awaits completion. Idempotent.
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.queue.close();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker handle lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("event bus stopped");
    }

    /// Enqueues an event. Never blocks on a full queue: the event is dropped,
    /// one QUEUE error is reported, and `false` is returned.
    pub async fn publish(&self, mut event: Event, priority: i32) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            debug!("publish refused: bus is not running");
            return false;
        }

        event.metadata.insert(
            metadata::PRIORITY.to_string(),
            serde_json::json!(priority),
        );
        event.metadata.insert(
            metadata::PUBLISHED_AT.to_string(),
            serde_json::Value::String(rfc3339_ms(system_clock().now_ms())),
        );

        if self.config.bus.enable_persistence {
            if let Some(store) = &self.event_store {
                if let Err(err) = store.persist_event(&event).await {
                    self.errors.report(&err).await;
                }
            }
        }

        match self.queue.push(event, priority) {
            Ok(()) => {
                self.events_published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(PushError::Full) => {
                let err = EngineError::queue(
                    "bus",
                    "publish",
                    format!(
                        "event queue full, dropping event (capacity {})",
                        self.queue.capacity()
                    ),
                )
                .with_metadata("queue_size", serde_json::json!(self.queue.len()));
                self.errors.report(&err).await;
                false
            }
            Err(PushError::Closed) => false,
        }
    }

    /// Fan-out publish; returns how many events were accepted.
    pub async fn publish_many(&self, events: Vec<Event>, priority: i32) -> usize {
        let mut accepted = 0;
        for event in events {
            if self.publish(event, priority).await {
                accepted += 1;
            }
        }
        accepted
    }

    /// Registers a handler. Empty `event_types` subscribes to everything.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        event_types: Vec<EventType>,
        priority: Option<i32>,
        max_retries: Option<u32>,
    ) -> EngineResult<Uuid> {
        self.registry
            .add_subscription(subscriber_id, handler, event_types, priority, max_retries)
    }

    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.registry.remove_subscription(subscription_id)
    }

    pub fn subscription_status(&self, subscription_id: Uuid) -> Option<SubscriptionStatus> {
        self.registry.status(subscription_id)
    }

    pub fn get_metrics(&self) -> BusMetrics {
        let stats = self.processor.stats();
        BusMetrics {
            running: self.running.load(Ordering::SeqCst),
            workers: self.workers.lock().expect("worker handle lock poisoned").len(),
            queue_size: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_processed: stats.events_processed,
            events_failed: stats.events_failed,
            successful_handlers: stats.successful_handlers,
            failed_handlers: stats.failed_handlers,
            average_processing_time: stats.average_processing_time(),
            circuit_breaker_trips: stats.circuit_breaker_trips,
            subscriptions: self.registry.subscription_count(),
            active_subscriptions: self.registry.active_subscription_count(),
            dead_letter_size: self.dead_letters.len(),
        }
    }

    pub fn health_check(&self) -> HealthStatus {
        let status = if self.running.load(Ordering::SeqCst) {
            HealthState::Running
        } else {
            HealthState::Stopped
        };
        HealthStatus {
            status,
            queue_size: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            subscriptions: self.registry.subscription_count(),
            active_subscriptions: self.registry.active_subscription_count(),
            workers: self.workers.lock().expect("worker handle lock poisoned").len(),
        }
    }

    pub fn reset_metrics(&self) {
        self.processor.reset_stats();
        self.events_published.store(0, Ordering::Relaxed);
    }

    /// Reads up to `limit` dead-letter entries without consuming them.
    pub fn get_dead_letter_events(&self, limit: usize) -> Vec<Event> {
        self.dead_letters.events(limit)
    }
}

/// One worker: pop with a bounded wait, dispatch, record outcomes, loop.
async fn worker_loop(
    name: String,
    running: Arc<AtomicBool>,
    queue: Arc<EventQueue>,
    registry: Arc<SubscriptionRegistry>,
    processor: Arc<EventProcessor>,
    dead_letters: Arc<DeadLetterQueue>,
    errors: Arc<ErrorManager>,
) {
    debug!("{name} started");
    while running.load(Ordering::SeqCst) {
        let Some(event) = queue.pop(WORKER_POP_TIMEOUT).await else {
            continue;
        };

        let subscriptions = registry.subscriptions_for_event(event.event_type);
        if subscriptions.is_empty() {
            debug!("{name}: no subscribers for {}", event.event_type);
            continue;
        }

        let outcome = processor.process_event(&event, &subscriptions).await;

        for error in &outcome.errors {
            if let Err(err) = registry.record_failure(error.subscription_id, &error.message) {
                // A racing unsubscribe can remove the record mid-dispatch.
                errors.report(&err).await;
            }
        }
        for subscription in &subscriptions {
            if subscription.is_active() && outcome.succeeded(subscription.subscription_id) {
                let _ = registry.record_success(subscription.subscription_id);
            }
        }

        if let Some(reason) = outcome
            .errors
            .iter()
            .find(|error| error.terminal)
            .map(|error| error.message.clone())
        {
            warn!(
                "{name}: event {} exhausted retries, diverting to dead letters: {reason}",
                event.event_id
            );
            dead_letters.push(event, &reason);
        }
    }
    debug!("{name} stopped");
}
