use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::core::errors::EngineError;

/// A source of timestamps for the engine.
///
/// This trait allows the caller to choose between wall-clock time (slower, but
/// standard), TSC-based time (faster, monotonic, but requires calibration),
/// and a manually driven clock for deterministic tests.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp in nanoseconds since the UNIX epoch.
    fn now_ns(&self) -> u64;

    /// Returns the current timestamp in milliseconds since the UNIX epoch.
    fn now_ms(&self) -> i64 {
        (self.now_ns() / 1_000_000) as i64
    }
}

/// A clock that uses `std::time::SystemTime`.
///
/// This is the default implementation. It is susceptible to NTP adjustments
/// and has higher latency (~20-50ns), but requires no calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        u64::try_from(timestamp.as_nanos()).expect("system time exceeds timestamp range")
    }
}

/// A clock that uses the CPU's Time-Stamp Counter (TSC) via the `quanta` crate.
///
/// This is significantly faster (~6-10ns) and monotonic. It anchors to
/// SystemTime at initialization and then uses TSC ticks to progress, ensuring
/// no backward jumps between breaker reset checks.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_nanos() as u64;

        Self {
            clock,
            start_wall_ns,
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_ns(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}

/// A manually driven clock for deterministic tests and simulation.
///
/// Time only moves when `advance` or `set_ns` is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, delta: std::time::Duration) {
        self.now_ns
            .fetch_add(delta.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

/// Shared handle to the default wall clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Formats an epoch-millisecond timestamp as RFC-3339 in UTC.
pub fn rfc3339_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .expect("timestamp out of range")
        .format(&Rfc3339)
        .expect("RFC-3339 formatting cannot fail for UTC timestamps")
}

/// Parses an RFC-3339 timestamp back to epoch milliseconds.
pub fn parse_rfc3339_ms(value: &str) -> Result<i64, EngineError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
        EngineError::validation("core", "parse_rfc3339_ms", format!("invalid timestamp: {err}"))
    })?;
    Ok((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}
