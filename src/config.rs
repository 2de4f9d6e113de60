//! Engine configuration with construction-time validation.
//!
//! Violations surface as CONFIGURATION errors and are fatal at startup.

use serde::{Deserialize, Serialize};

use crate::core::errors::{EngineError, EngineResult};
use crate::market::TimeFrame;

/// Queue and worker-pool settings for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_queue_size: usize,
    pub num_workers: usize,
    pub dead_letter_queue_size: usize,
    /// Persist events to the optional event store before dispatch.
    pub enable_persistence: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            num_workers: 4,
            dead_letter_queue_size: 1_000,
            enable_persistence: false,
        }
    }
}

/// Registry limits and subscription defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub max_subscriptions: usize,
    pub default_priority: i32,
    pub default_max_retries: u32,
    /// Fixed delay between handler retry attempts.
    pub retry_delay_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 1_000,
            default_priority: 0,
            default_max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

/// Per-dispatch limits for the event processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_processing_time_seconds: f64,
    pub max_concurrent_handlers: usize,
    pub circuit_breaker_enabled: bool,
    pub enable_metrics: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_processing_time_seconds: 30.0,
            max_concurrent_handlers: 10,
            circuit_breaker_enabled: true,
            enable_metrics: true,
        }
    }
}

/// Connection settings for one venue ingester.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub symbols: Vec<String>,
    pub timeframes: Vec<TimeFrame>,
    /// Overrides the venue profile's stream URL when set.
    pub ws_base_url: Option<String>,
    /// Overrides the venue profile's REST URL when set.
    pub rest_base_url: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Backfill window when neither memory nor storage knows a start point.
    pub backfill_window_hours: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            timeframes: vec![TimeFrame::M5, TimeFrame::H1],
            ws_base_url: None,
            rest_base_url: None,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 5_000,
            backfill_window_hours: 24,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bus: BusConfig,
    pub subscriptions: SubscriptionConfig,
    pub processing: ProcessingConfig,
    pub ingest: IngestConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.bus.max_queue_size == 0 {
            return Err(invalid("bus.max_queue_size must be positive"));
        }
        if self.bus.num_workers == 0 {
            return Err(invalid("bus.num_workers must be positive"));
        }
        if self.subscriptions.max_subscriptions == 0 {
            return Err(invalid("subscriptions.max_subscriptions must be positive"));
        }
        if self.processing.max_processing_time_seconds <= 0.0 {
            return Err(invalid("processing.max_processing_time_seconds must be positive"));
        }
        if self.processing.max_concurrent_handlers == 0 {
            return Err(invalid("processing.max_concurrent_handlers must be positive"));
        }
        if self.ingest.max_reconnect_attempts == 0 {
            return Err(invalid("ingest.max_reconnect_attempts must be positive"));
        }
        if self.ingest.symbols.is_empty() {
            return Err(invalid("ingest.symbols must not be empty"));
        }
        if self.ingest.timeframes.is_empty() {
            return Err(invalid("ingest.timeframes must not be empty"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> EngineError {
    EngineError::configuration("config", "validate", message)
}
