//! Real-time market-data engine core.
//!
//! Three subsystems: a priority-ordered, fault-isolated event bus
//! ([`bus`]), the WebSocket/REST ingestion pipeline that feeds it
//! ([`ingest`]), and the persistence ports everything durable goes through
//! ([`storage`]). Closed candles flow exchange → ingester → persistence →
//! `candles.v1` → subscribers, with REST backfill covering stream gaps.

pub mod config;
pub mod core;
pub mod market;
pub mod protocol;
pub mod storage;

#[cfg(feature = "bus")]
pub mod bus;

#[cfg(feature = "ingest")]
pub mod ingest;

pub use crate::config::{BusConfig, EngineConfig, IngestConfig, ProcessingConfig, SubscriptionConfig};
pub use crate::core::{EngineError, EngineResult, ErrorCategory, ErrorManager, ErrorSeverity};
pub use crate::market::{Candle, CandleKey, TimeFrame, Venue};
pub use crate::protocol::{Event, EventPayload, EventType, CANDLES_TOPIC};

#[cfg(feature = "bus")]
pub use crate::bus::{EventBus, EventHandler};
