//! In-memory adapters for development and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::core::errors::EngineResult;
use crate::market::{Candle, CandleKey, TimeFrame, Venue};
use crate::protocol::Event;
use crate::storage::{
    CandleStore, EventStore, IndicatorValue, OrderRecord, Position, Zone,
};

/// Keyed candle storage backed by an ordered map, so range reads come back
/// chronological for free.
#[derive(Default)]
pub struct MemoryStore {
    candles: RwLock<BTreeMap<CandleKey, Candle>>,
    indicators: RwLock<Vec<IndicatorValue>>,
    zones: RwLock<HashMap<uuid::Uuid, Zone>>,
    orders: RwLock<HashMap<uuid::Uuid, OrderRecord>>,
    positions: RwLock<Vec<Position>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candle_count(&self) -> usize {
        self.candles.read().expect("candle store poisoned").len()
    }

    /// Seeds an open position, for tests of the position query.
    pub fn add_position(&self, position: Position) {
        self.positions
            .write()
            .expect("position store poisoned")
            .push(position);
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn upsert_candle(&self, candle: &Candle) -> EngineResult<bool> {
        let mut candles = self.candles.write().expect("candle store poisoned");
        let key = candle.key();
        if candles.contains_key(&key) {
            return Ok(false);
        }
        candles.insert(key, candle.clone());
        Ok(true)
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        venue: Venue,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> EngineResult<Vec<Candle>> {
        let candles = self.candles.read().expect("candle store poisoned");
        let result = candles
            .values()
            .filter(|candle| {
                candle.venue == venue
                    && candle.symbol == symbol
                    && candle.timeframe == timeframe
                    && start.map_or(true, |s| candle.open_time >= s)
                    && end.map_or(true, |e| candle.open_time <= e)
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(result)
    }

    async fn get_latest_candle(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        venue: Venue,
    ) -> EngineResult<Option<Candle>> {
        let candles = self.candles.read().expect("candle store poisoned");
        let latest = candles
            .values()
            .filter(|candle| {
                candle.venue == venue && candle.symbol == symbol && candle.timeframe == timeframe
            })
            .max_by_key(|candle| candle.open_time)
            .cloned();
        Ok(latest)
    }

    async fn upsert_indicator(&self, indicator: &IndicatorValue) -> EngineResult<()> {
        let mut indicators = self.indicators.write().expect("indicator store poisoned");
        if let Some(existing) = indicators.iter_mut().find(|i| {
            i.symbol == indicator.symbol
                && i.timeframe == indicator.timeframe
                && i.timestamp_ms == indicator.timestamp_ms
                && i.name == indicator.name
        }) {
            *existing = indicator.clone();
        } else {
            indicators.push(indicator.clone());
        }
        Ok(())
    }

    async fn upsert_zone(&self, zone: &Zone) -> EngineResult<()> {
        self.zones
            .write()
            .expect("zone store poisoned")
            .insert(zone.zone_id, zone.clone());
        Ok(())
    }

    async fn upsert_order(&self, order: &OrderRecord) -> EngineResult<()> {
        self.orders
            .write()
            .expect("order store poisoned")
            .insert(order.order_id, order.clone());
        Ok(())
    }

    async fn get_active_positions(&self) -> EngineResult<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .expect("position store poisoned")
            .clone())
    }
}

/// Bounded in-memory event sink.
pub struct MemoryEventStore {
    events: RwLock<VecDeque<Event>>,
    max_size: usize,
}

impl MemoryEventStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            max_size,
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn persist_event(&self, event: &Event) -> EngineResult<()> {
        let mut events = self.events.write().expect("event store poisoned");
        events.push_back(event.clone());
        while events.len() > self.max_size {
            events.pop_front();
        }
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> EngineResult<Vec<Event>> {
        let events = self.events.read().expect("event store poisoned");
        let skip = events.len().saturating_sub(limit);
        Ok(events.iter().skip(skip).cloned().collect())
    }
}
