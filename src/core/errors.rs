//! Structured error taxonomy and the process-wide error manager.
//!
//! Every fault in the engine is reported as an [`EngineError`] carrying a
//! category, severity, and rich [`ErrorContext`]. The [`ErrorManager`] fans
//! each report through its registered handlers: a severity-mapped logger, a
//! metrics aggregator, and an opt-in exponential-backoff retry handler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::clock::{system_clock, Clock};

/// How many error contexts the metrics handler retains for readback.
const RECENT_ERRORS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Subscription,
    Processing,
    Queue,
    Configuration,
    Network,
    Timeout,
    Resource,
    Validation,
    CircuitBreaker,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Subscription => "subscription",
            ErrorCategory::Processing => "processing",
            ErrorCategory::Queue => "queue",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Validation => "validation",
            ErrorCategory::CircuitBreaker => "circuit_breaker",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rich context attached to every engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_id: Uuid,
    pub timestamp_ms: i64,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub correlation_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl ErrorContext {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            error_id: Uuid::new_v4(),
            timestamp_ms: system_clock().now_ms(),
            category,
            severity,
            component: component.into(),
            operation: operation.into(),
            metadata: HashMap::new(),
            correlation_id: None,
            retry_count: 0,
            max_retries: 3,
        }
    }
}

/// A structured engine error: message plus taxonomy context.
#[derive(Debug, thiserror::Error)]
#[error("{} error in {}.{}: {message}", .context.category, .context.component, .context.operation)]
pub struct EngineError {
    pub message: String,
    pub context: ErrorContext,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            context: ErrorContext::new(category, severity, component, operation),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.metadata.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.context.correlation_id = Some(id.into());
        self
    }

    pub fn subscription(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Subscription,
            ErrorSeverity::Medium,
            component,
            operation,
            message,
        )
    }

    /// Registry saturation and other capacity exhaustion.
    pub fn resource(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Resource,
            ErrorSeverity::High,
            component,
            operation,
            message,
        )
    }

    pub fn processing(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Processing,
            ErrorSeverity::Medium,
            component,
            operation,
            message,
        )
    }

    pub fn queue(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Queue,
            ErrorSeverity::High,
            component,
            operation,
            message,
        )
    }

    /// Configuration violations are fatal at startup.
    pub fn configuration(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Configuration,
            ErrorSeverity::High,
            component,
            operation,
            message,
        )
    }

    pub fn network(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Network,
            ErrorSeverity::Medium,
            component,
            operation,
            message,
        )
    }

    pub fn timeout(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            ErrorSeverity::Medium,
            component,
            operation,
            message,
        )
    }

    pub fn validation(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::Validation,
            ErrorSeverity::Medium,
            component,
            operation,
            message,
        )
    }

    pub fn circuit_breaker(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCategory::CircuitBreaker,
            ErrorSeverity::High,
            component,
            operation,
            message,
        )
    }
}

/// Aggregated view over everything the metrics handler has seen.
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub by_severity: HashMap<ErrorSeverity, u64>,
    pub recent: Vec<ErrorContext>,
    pub rate_per_minute: f64,
    pub last_reset_ms: i64,
}

/// A sink for structured errors. Returns whether the error was handled.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, error: &EngineError) -> bool;
}

/// Logs each error at a level derived from its severity.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl ErrorHandler for LogHandler {
    async fn handle(&self, err: &EngineError) -> bool {
        let ctx = &err.context;
        match ctx.severity {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                "[{}] {}.{}: {} (error_id={}, severity={}, retries={}/{})",
                ctx.category,
                ctx.component,
                ctx.operation,
                err.message,
                ctx.error_id,
                ctx.severity,
                ctx.retry_count,
                ctx.max_retries,
            ),
            ErrorSeverity::Medium => warn!(
                "[{}] {}.{}: {} (error_id={})",
                ctx.category, ctx.component, ctx.operation, err.message, ctx.error_id,
            ),
            ErrorSeverity::Low => info!(
                "[{}] {}.{}: {} (error_id={})",
                ctx.category, ctx.component, ctx.operation, err.message, ctx.error_id,
            ),
        }
        true
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total_errors: u64,
    by_category: HashMap<ErrorCategory, u64>,
    by_severity: HashMap<ErrorSeverity, u64>,
    recent: VecDeque<ErrorContext>,
    last_reset_ms: i64,
}

/// Tracks error totals, a bounded ring of recent contexts, and a rate.
pub struct MetricsHandler {
    state: Mutex<MetricsState>,
    clock: Arc<dyn Clock>,
}

impl MetricsHandler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let last_reset_ms = clock.now_ms();
        Self {
            state: Mutex::new(MetricsState {
                last_reset_ms,
                ..MetricsState::default()
            }),
            clock,
        }
    }

    pub fn stats(&self) -> ErrorStats {
        let state = self.state.lock().expect("error metrics lock poisoned");
        let now_ms = self.clock.now_ms();
        let minute_ago = now_ms - 60_000;
        let rate_per_minute = state
            .recent
            .iter()
            .filter(|ctx| ctx.timestamp_ms >= minute_ago)
            .count() as f64;

        ErrorStats {
            total_errors: state.total_errors,
            by_category: state.by_category.clone(),
            by_severity: state.by_severity.clone(),
            recent: state.recent.iter().cloned().collect(),
            rate_per_minute,
            last_reset_ms: state.last_reset_ms,
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("error metrics lock poisoned");
        *state = MetricsState {
            last_reset_ms: self.clock.now_ms(),
            ..MetricsState::default()
        };
    }
}

#[async_trait]
impl ErrorHandler for MetricsHandler {
    async fn handle(&self, err: &EngineError) -> bool {
        let mut state = self.state.lock().expect("error metrics lock poisoned");
        state.total_errors += 1;
        *state.by_category.entry(err.context.category).or_insert(0) += 1;
        *state.by_severity.entry(err.context.severity).or_insert(0) += 1;
        state.recent.push_back(err.context.clone());
        while state.recent.len() > RECENT_ERRORS {
            state.recent.pop_front();
        }
        true
    }
}

/// Sleeps an exponential backoff for retryable categories.
///
/// Opt-in: only errors whose category is in `categories` are considered.
/// Configuration and validation errors, and anything CRITICAL, are never
/// retried.
pub struct RetryBackoffHandler {
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    max_retries: u32,
    categories: HashSet<ErrorCategory>,
}

impl RetryBackoffHandler {
    pub fn new(categories: HashSet<ErrorCategory>) -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_retries: 3,
            categories,
        }
    }

    fn should_retry(&self, err: &EngineError) -> bool {
        if matches!(
            err.context.category,
            ErrorCategory::Configuration | ErrorCategory::Validation
        ) {
            return false;
        }
        if err.context.severity == ErrorSeverity::Critical {
            return false;
        }
        self.categories.contains(&err.context.category)
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(retry_count as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryBackoffHandler {
    fn default() -> Self {
        Self::new(HashSet::from([ErrorCategory::Network, ErrorCategory::Timeout]))
    }
}

#[async_trait]
impl ErrorHandler for RetryBackoffHandler {
    async fn handle(&self, err: &EngineError) -> bool {
        if !self.should_retry(err) {
            return false;
        }
        let retry_count = err.context.retry_count;
        if retry_count >= self.max_retries {
            warn!(
                "retries exhausted for error {} ({}/{})",
                err.context.error_id, retry_count, self.max_retries
            );
            return false;
        }
        let delay = self.backoff(retry_count);
        debug!(
            "backing off {:?} before retry {} of error {}",
            delay,
            retry_count + 1,
            err.context.error_id
        );
        tokio::time::sleep(delay).await;
        true
    }
}

/// Central error sink. Fans every report through the registered handlers.
///
/// One manager is constructed at startup and passed explicitly (by `Arc`) to
/// the bus, ingesters, and backfill engine.
pub struct ErrorManager {
    handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,
    metrics: Arc<MetricsHandler>,
}

impl ErrorManager {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(MetricsHandler::new(clock));
        let handlers: Vec<Arc<dyn ErrorHandler>> = vec![
            Arc::new(LogHandler),
            metrics.clone(),
            Arc::new(RetryBackoffHandler::default()),
        ];
        Self {
            handlers: RwLock::new(handlers),
            metrics,
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn ErrorHandler>) {
        self.handlers
            .write()
            .expect("error handler lock poisoned")
            .push(handler);
    }

    /// Reports an error to every handler. Returns true if any handler
    /// accepted it. Handler panics are not caught; handlers are expected to
    /// be infallible.
    pub async fn report(&self, error: &EngineError) -> bool {
        let handlers: Vec<Arc<dyn ErrorHandler>> = self
            .handlers
            .read()
            .expect("error handler lock poisoned")
            .clone();
        let mut handled = false;
        for handler in handlers {
            handled |= handler.handle(error).await;
        }
        handled
    }

    pub fn stats(&self) -> ErrorStats {
        self.metrics.stats()
    }

    pub fn reset_stats(&self) {
        self.metrics.reset();
    }
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new()
    }
}
