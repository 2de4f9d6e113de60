//! Event records carried by the bus.
//!
//! Events form a closed sum over [`EventType`]; payload-specific fields live
//! in the tagged [`EventPayload`]. Metadata is only touched on the publish
//! path (priority / publish-time stamps, gap-fill tags, dead-letter reasons).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::clock::system_clock;
use crate::market::{CandleEnvelope, TimeFrame};

/// The canonical publication topic for closed candles.
pub const CANDLES_TOPIC: &str = "candles.v1";

/// Metadata keys stamped by the engine itself.
pub mod metadata {
    pub const PRIORITY: &str = "priority";
    pub const PUBLISHED_AT: &str = "published_at";
    pub const IS_HISTORICAL: &str = "is_historical";
    pub const IS_GAP_FILL: &str = "is_gap_fill";
    pub const DEAD_LETTER_REASON: &str = "dead_letter_reason";
    pub const DEAD_LETTER_TIMESTAMP: &str = "dead_letter_timestamp";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CandleUpdate,
    FeaturesCalculated,
    SmcSignal,
    RetestSignal,
    TradingDecision,
    OrderFilled,
    PositionUpdate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CandleUpdate => "candle_update",
            EventType::FeaturesCalculated => "features_calculated",
            EventType::SmcSignal => "smc_signal",
            EventType::RetestSignal => "retest_signal",
            EventType::TradingDecision => "trading_decision",
            EventType::OrderFilled => "order_filled",
            EventType::PositionUpdate => "position_update",
        }
    }

    /// The wire topic an event type serializes to, where one exists.
    /// `candles.v1` is the serialized form of `CandleUpdate`.
    pub fn topic(&self) -> Option<&'static str> {
        match self {
            EventType::CandleUpdate => Some(CANDLES_TOPIC),
            _ => None,
        }
    }

    /// Reverse of [`EventType::topic`].
    pub fn from_topic(topic: &str) -> Option<EventType> {
        match topic {
            CANDLES_TOPIC => Some(EventType::CandleUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged payload union. Implementers of downstream stages add variants
/// here rather than subclassing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Candle(CandleEnvelope),
    Json(serde_json::Value),
    None,
}

/// A single event flowing through the bus.
///
/// Ephemeral: created on publish, dropped after dispatch (or diverted to the
/// dead-letter queue). `event_id` is assigned at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    /// Creation time, epoch milliseconds UTC.
    pub timestamp_ms: i64,
    pub symbol: Option<String>,
    pub timeframe: Option<TimeFrame>,
    pub payload: EventPayload,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp_ms: system_clock().now_ms(),
            symbol: None,
            timeframe: None,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Builds the canonical `candles.v1` event from a candle envelope.
    pub fn candle_update(envelope: CandleEnvelope) -> Self {
        let symbol = envelope.symbol.clone();
        let timeframe = envelope.timeframe;
        Self::new(EventType::CandleUpdate, EventPayload::Candle(envelope))
            .with_symbol(symbol)
            .with_timeframe(timeframe)
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_timeframe(mut self, timeframe: TimeFrame) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Reads a boolean metadata flag, defaulting to false when absent.
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }
}
