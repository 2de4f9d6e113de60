//! Persistence ports the engine core depends on.
//!
//! The core owns no durable state. Adapters implement these traits; the only
//! requirements are per-row atomicity and idempotence under retry. All
//! monetary and size columns are fixed-point decimals.

pub mod memory;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::EngineResult;
use crate::market::{Candle, TimeFrame, Venue};
use crate::protocol::Event;

pub use memory::{MemoryEventStore, MemoryStore};

/// One indicator sample, written by downstream feature stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub timestamp_ms: i64,
    pub name: String,
    pub value: Decimal,
}

/// A supply/demand zone identified by the pattern stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: Uuid,
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub kind: String,
    pub low: Decimal,
    pub high: Decimal,
    pub created_at_ms: i64,
    pub active: bool,
}

/// A broker order record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub symbol: String,
    pub side: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: String,
    pub created_at_ms: i64,
}

/// An open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub opened_at_ms: i64,
}

/// Candle persistence port.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Idempotent on (venue, symbol, timeframe, open_time). Returns true
    /// when a new row was written, false when the row already existed.
    async fn upsert_candle(&self, candle: &Candle) -> EngineResult<bool>;

    /// Candles in chronological order, optionally bounded by open_time.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        venue: Venue,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> EngineResult<Vec<Candle>>;

    async fn get_latest_candle(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        venue: Venue,
    ) -> EngineResult<Option<Candle>>;

    async fn upsert_indicator(&self, indicator: &IndicatorValue) -> EngineResult<()>;

    async fn upsert_zone(&self, zone: &Zone) -> EngineResult<()>;

    async fn upsert_order(&self, order: &OrderRecord) -> EngineResult<()>;

    async fn get_active_positions(&self) -> EngineResult<Vec<Position>>;
}

/// Optional sink the bus writes events to before dispatch when
/// `bus.enable_persistence` is set.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn persist_event(&self, event: &Event) -> EngineResult<()>;

    /// The most recent events, oldest first.
    async fn recent_events(&self, limit: usize) -> EngineResult<Vec<Event>>;
}
