//! Bounded capture of terminally-failed events.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::warn;

use crate::core::clock::{rfc3339_ms, system_clock};
use crate::protocol::{metadata, Event};

/// FIFO ring of events that exhausted their retries.
///
/// Overflow is drop-newest with a log record; readback never consumes.
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Stamps the failure reason and timestamp, then enqueues.
    /// Returns false when the ring is full and the event was dropped.
    pub fn push(&self, mut event: Event, reason: &str) -> bool {
        event.metadata.insert(
            metadata::DEAD_LETTER_REASON.to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        event.metadata.insert(
            metadata::DEAD_LETTER_TIMESTAMP.to_string(),
            serde_json::Value::String(rfc3339_ms(system_clock().now_ms())),
        );

        let mut entries = self.entries.lock().expect("dead letter lock poisoned");
        if entries.len() >= self.capacity {
            warn!(
                "dead letter queue full ({}), dropping event {}",
                self.capacity, event.event_id
            );
            return false;
        }
        entries.push_back(event);
        true
    }

    /// Returns up to `limit` entries, oldest first, without mutating the ring.
    pub fn events(&self, limit: usize) -> Vec<Event> {
        let entries = self.entries.lock().expect("dead letter lock poisoned");
        entries.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dead letter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventPayload, EventType};

    fn event() -> Event {
        Event::new(EventType::CandleUpdate, EventPayload::None)
    }

    #[test]
    fn push_stamps_reason_and_timestamp() {
        let dlq = DeadLetterQueue::new(8);
        assert!(dlq.push(event(), "handler exploded"));

        let entries = dlq.events(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].metadata[metadata::DEAD_LETTER_REASON],
            serde_json::Value::String("handler exploded".to_string())
        );
        assert!(entries[0]
            .metadata
            .contains_key(metadata::DEAD_LETTER_TIMESTAMP));
    }

    #[test]
    fn overflow_drops_newest() {
        let dlq = DeadLetterQueue::new(2);
        let first = event();
        let first_id = first.event_id;
        assert!(dlq.push(first, "a"));
        assert!(dlq.push(event(), "b"));
        assert!(!dlq.push(event(), "c"));

        let entries = dlq.events(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_id, first_id);
    }

    #[test]
    fn readback_does_not_consume() {
        let dlq = DeadLetterQueue::new(4);
        dlq.push(event(), "a");
        dlq.push(event(), "b");
        assert_eq!(dlq.events(1).len(), 1);
        assert_eq!(dlq.events(10).len(), 2);
        assert_eq!(dlq.len(), 2);
    }

    #[test]
    fn zero_capacity_drops_everything() {
        let dlq = DeadLetterQueue::new(0);
        assert!(!dlq.push(event(), "a"));
        assert!(dlq.is_empty());
    }
}
