//! Ownership and indexing of subscriptions.
//!
//! The registry is the only component that mutates subscription records.
//! Reads take the shared lock; every mutation takes the exclusive lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info};
use uuid::Uuid;

use crate::bus::handler::EventHandler;
use crate::config::SubscriptionConfig;
use crate::core::clock::system_clock;
use crate::core::errors::{EngineError, EngineResult};
use crate::protocol::EventType;

#[derive(Debug, Default)]
struct SubscriptionState {
    retry_count: u32,
    last_error: Option<String>,
    processed_count: u64,
    failed_count: u64,
}

/// A registered handler with its dispatch policy and retry bookkeeping.
///
/// The handler and filter are immutable for the life of the subscription;
/// `active` flips to false exactly once, after which the subscription never
/// appears in a dispatch set again.
pub struct Subscription {
    pub subscription_id: Uuid,
    pub subscriber_id: String,
    pub handler: Arc<dyn EventHandler>,
    /// Event types this subscription receives; empty means all events.
    pub filter: HashSet<EventType>,
    pub priority: i32,
    pub max_retries: u32,
    pub created_at_ms: i64,
    /// Registration order, the tie-break for equal priorities.
    pub(crate) seq: u64,
    state: Mutex<SubscriptionState>,
    active: AtomicBool,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().expect("subscription state poisoned").retry_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("subscription state poisoned")
            .last_error
            .clone()
    }

    pub fn status(&self) -> SubscriptionStatus {
        let state = self.state.lock().expect("subscription state poisoned");
        SubscriptionStatus {
            subscription_id: self.subscription_id,
            subscriber_id: self.subscriber_id.clone(),
            is_active: self.is_active(),
            priority: self.priority,
            retry_count: state.retry_count,
            last_error: state.last_error.clone(),
            processed_count: state.processed_count,
            failed_count: state.failed_count,
        }
    }
}

/// Point-in-time snapshot of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionStatus {
    pub subscription_id: Uuid,
    pub subscriber_id: String,
    pub is_active: bool,
    pub priority: i32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub processed_count: u64,
    pub failed_count: u64,
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<Uuid, Arc<Subscription>>,
    by_type: HashMap<EventType, Vec<Arc<Subscription>>>,
    all_events: Vec<Arc<Subscription>>,
    next_seq: u64,
}

pub struct SubscriptionRegistry {
    config: SubscriptionConfig,
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(config: SubscriptionConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Registers a handler. `event_types` empty subscribes to all events.
    ///
    /// Fails with a RESOURCE error once `max_subscriptions` is reached; this
    /// is the only registry operation that surfaces an error to the
    /// subscriber.
    pub fn add_subscription(
        &self,
        subscriber_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        event_types: Vec<EventType>,
        priority: Option<i32>,
        max_retries: Option<u32>,
    ) -> EngineResult<Uuid> {
        let subscriber_id = subscriber_id.into();
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if inner.by_id.len() >= self.config.max_subscriptions {
            return Err(EngineError::resource(
                "registry",
                "add_subscription",
                format!(
                    "maximum number of subscriptions ({}) exceeded",
                    self.config.max_subscriptions
                ),
            )
            .with_metadata(
                "current_subscriptions",
                serde_json::json!(inner.by_id.len()),
            ));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let subscription = Arc::new(Subscription {
            subscription_id: Uuid::new_v4(),
            subscriber_id: subscriber_id.clone(),
            handler,
            filter: event_types.iter().copied().collect(),
            priority: priority.unwrap_or(self.config.default_priority),
            max_retries: max_retries.unwrap_or(self.config.default_max_retries),
            created_at_ms: system_clock().now_ms(),
            seq,
            state: Mutex::new(SubscriptionState::default()),
            active: AtomicBool::new(true),
        });

        let id = subscription.subscription_id;
        inner.by_id.insert(id, subscription.clone());

        if subscription.filter.is_empty() {
            sorted_insert(&mut inner.all_events, subscription);
        } else {
            for event_type in &event_types {
                let bucket = inner.by_type.entry(*event_type).or_default();
                sorted_insert(bucket, subscription.clone());
            }
        }

        info!(
            "subscriber '{}' registered as {} (priority {})",
            subscriber_id,
            id,
            priority.unwrap_or(self.config.default_priority)
        );
        Ok(id)
    }

    pub fn remove_subscription(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(subscription) = inner.by_id.remove(&id) else {
            return false;
        };

        if subscription.filter.is_empty() {
            inner.all_events.retain(|s| s.subscription_id != id);
        } else {
            for event_type in subscription.filter.iter() {
                if let Some(bucket) = inner.by_type.get_mut(event_type) {
                    bucket.retain(|s| s.subscription_id != id);
                }
            }
        }
        debug!("subscription {id} removed");
        true
    }

    /// Active subscriptions for an event type: type-specific plus all-events,
    /// deduplicated, sorted by priority descending then registration order.
    pub fn subscriptions_for_event(&self, event_type: EventType) -> Vec<Arc<Subscription>> {
        let inner = self.inner.read().expect("registry lock poisoned");

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut result: Vec<Arc<Subscription>> = Vec::new();
        let buckets = [
            inner.by_type.get(&event_type).map(Vec::as_slice).unwrap_or(&[]),
            inner.all_events.as_slice(),
        ];
        for bucket in buckets {
            for subscription in bucket {
                if subscription.is_active() && seen.insert(subscription.subscription_id) {
                    result.push(subscription.clone());
                }
            }
        }
        result.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        result
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").by_id.len()
    }

    pub fn active_subscription_count(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_id
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn status(&self, id: Uuid) -> Option<SubscriptionStatus> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_id
            .get(&id)
            .map(|s| s.status())
    }

    /// Records one failed delivery attempt. Returns true when the failure was
    /// terminal, i.e. the subscription just went inactive.
    pub fn record_failure(&self, id: Uuid, error_message: &str) -> EngineResult<bool> {
        let inner = self.inner.write().expect("registry lock poisoned");
        let subscription = inner.by_id.get(&id).ok_or_else(|| {
            EngineError::validation(
                "registry",
                "record_failure",
                format!("subscription {id} not found"),
            )
        })?;

        let mut state = subscription
            .state
            .lock()
            .expect("subscription state poisoned");
        if state.retry_count <= subscription.max_retries {
            state.retry_count += 1;
        }
        state.last_error = Some(error_message.to_string());
        state.failed_count += 1;

        if state.retry_count > subscription.max_retries && subscription.is_active() {
            subscription.active.store(false, Ordering::SeqCst);
            info!(
                "subscription {} deactivated after {} failed attempts (max_retries {})",
                id, state.retry_count, subscription.max_retries
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Records a successful delivery: resets the retry streak.
    pub fn record_success(&self, id: Uuid) -> EngineResult<()> {
        let inner = self.inner.write().expect("registry lock poisoned");
        let subscription = inner.by_id.get(&id).ok_or_else(|| {
            EngineError::validation(
                "registry",
                "record_success",
                format!("subscription {id} not found"),
            )
        })?;

        let mut state = subscription
            .state
            .lock()
            .expect("subscription state poisoned");
        state.retry_count = 0;
        state.last_error = None;
        state.processed_count += 1;
        Ok(())
    }
}

/// Inserts keeping the bucket sorted by priority descending; equal
/// priorities keep registration order.
fn sorted_insert(bucket: &mut Vec<Arc<Subscription>>, subscription: Arc<Subscription>) {
    let position = bucket.partition_point(|s| s.priority >= subscription.priority);
    bucket.insert(position, subscription);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler::handler_fn;

    fn noop_handler() -> Arc<dyn EventHandler> {
        handler_fn(|_event| Ok(()))
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(SubscriptionConfig::default())
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_counters() {
        let registry = registry();
        assert_eq!(registry.subscription_count(), 0);

        let id = registry
            .add_subscription("svc", noop_handler(), vec![EventType::CandleUpdate], None, None)
            .unwrap();
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.active_subscription_count(), 1);

        assert!(registry.remove_subscription(id));
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(registry.active_subscription_count(), 0);
        assert!(!registry.remove_subscription(id));
    }

    #[test]
    fn lookup_merges_specific_and_all_event_subscribers() {
        let registry = registry();
        let specific = registry
            .add_subscription("a", noop_handler(), vec![EventType::CandleUpdate], Some(5), None)
            .unwrap();
        let catch_all = registry
            .add_subscription("b", noop_handler(), vec![], Some(1), None)
            .unwrap();
        let other = registry
            .add_subscription("c", noop_handler(), vec![EventType::OrderFilled], Some(9), None)
            .unwrap();

        let subs = registry.subscriptions_for_event(EventType::CandleUpdate);
        let ids: Vec<Uuid> = subs.iter().map(|s| s.subscription_id).collect();
        assert_eq!(ids, vec![specific, catch_all]);
        assert!(!ids.contains(&other));
    }

    #[test]
    fn lookup_orders_by_priority_then_registration() {
        let registry = registry();
        let low = registry
            .add_subscription("low", noop_handler(), vec![EventType::CandleUpdate], Some(1), None)
            .unwrap();
        let high = registry
            .add_subscription("high", noop_handler(), vec![EventType::CandleUpdate], Some(10), None)
            .unwrap();
        let mid_first = registry
            .add_subscription("mid1", noop_handler(), vec![EventType::CandleUpdate], Some(5), None)
            .unwrap();
        let mid_second = registry
            .add_subscription("mid2", noop_handler(), vec![EventType::CandleUpdate], Some(5), None)
            .unwrap();

        let ids: Vec<Uuid> = registry
            .subscriptions_for_event(EventType::CandleUpdate)
            .iter()
            .map(|s| s.subscription_id)
            .collect();
        assert_eq!(ids, vec![high, mid_first, mid_second, low]);
    }

    #[test]
    fn saturation_is_a_resource_error() {
        let registry = SubscriptionRegistry::new(SubscriptionConfig {
            max_subscriptions: 2,
            ..SubscriptionConfig::default()
        });
        registry
            .add_subscription("a", noop_handler(), vec![], None, None)
            .unwrap();
        registry
            .add_subscription("b", noop_handler(), vec![], None, None)
            .unwrap();
        let err = registry
            .add_subscription("c", noop_handler(), vec![], None, None)
            .unwrap_err();
        assert_eq!(err.context.category, crate::core::errors::ErrorCategory::Resource);
    }

    #[test]
    fn retry_exhaustion_deactivates_terminally() {
        let registry = registry();
        let id = registry
            .add_subscription(
                "flaky",
                noop_handler(),
                vec![EventType::CandleUpdate],
                None,
                Some(2),
            )
            .unwrap();

        assert!(!registry.record_failure(id, "boom 1").unwrap());
        assert!(!registry.record_failure(id, "boom 2").unwrap());
        assert!(registry.record_failure(id, "boom 3").unwrap());

        let status = registry.status(id).unwrap();
        assert!(!status.is_active);
        assert_eq!(status.retry_count, 3);
        assert_eq!(status.last_error.as_deref(), Some("boom 3"));
        // Deactivated subscriptions disappear from dispatch sets.
        assert!(registry
            .subscriptions_for_event(EventType::CandleUpdate)
            .is_empty());
    }

    #[test]
    fn zero_max_retries_deactivates_on_first_failure() {
        let registry = registry();
        let id = registry
            .add_subscription("strict", noop_handler(), vec![], None, Some(0))
            .unwrap();
        assert!(registry.record_failure(id, "boom").unwrap());
        assert!(!registry.status(id).unwrap().is_active);
    }

    #[test]
    fn success_resets_the_retry_streak() {
        let registry = registry();
        let id = registry
            .add_subscription("svc", noop_handler(), vec![], None, Some(3))
            .unwrap();
        registry.record_failure(id, "boom").unwrap();
        registry.record_failure(id, "boom").unwrap();
        registry.record_success(id).unwrap();

        let status = registry.status(id).unwrap();
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.last_error, None);
        assert_eq!(status.processed_count, 1);
        assert_eq!(status.failed_count, 2);
        assert!(status.is_active);
    }

    #[test]
    fn unknown_ids_are_validation_errors() {
        let registry = registry();
        let missing = Uuid::new_v4();
        assert!(registry.record_failure(missing, "x").is_err());
        assert!(registry.record_success(missing).is_err());
        assert!(registry.status(missing).is_none());
    }
}
