//! Per-subscriber fault gate.
//!
//! Closed → Open once `failure_threshold` consecutive failures accumulate;
//! Open → HalfOpen after `reset_timeout` has elapsed since the last failure;
//! HalfOpen → Closed after `success_threshold` successes, and any failure in
//! HalfOpen reopens the breaker.

use std::sync::Arc;
use std::time::Duration;

use crate::core::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_ns: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_ns: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a request may pass. An Open breaker whose reset timeout has
    /// elapsed transitions to HalfOpen and lets the probe through.
    pub fn should_allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed_ns = self
                    .last_failure_ns
                    .map(|last| self.clock.now_ns().saturating_sub(last))
                    .unwrap_or(u64::MAX);
                if elapsed_ns > self.config.reset_timeout.as_nanos() as u64 {
                    self.state = BreakerState::HalfOpen;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            // A success report while Open leaves the breaker untouched; the
            // reset timeout governs recovery.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure_ns = Some(self.clock.now_ns());
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.success_count = 0;
            }
            BreakerState::Open => {
                self.failure_count += 1;
            }
        }
    }
}
