//! REST catch-up over intervals missed while the stream was down.
//!
//! Each (symbol, timeframe) pair fills independently and concurrently:
//! paginate forward from the last known close, dedup against persistence,
//! upsert, and publish tagged candles. Rate limits back off exponentially
//! and abort the task after a bounded number of attempts; venue timestamp
//! drift retries the same window, widening `recvWindow` where the venue
//! supports it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::bus::EventBus;
use crate::core::clock::{system_clock, Clock};
use crate::core::errors::{EngineError, EngineResult, ErrorManager};
use crate::ingest::{candle_exists, publish_candle, VenueProfile};
use crate::market::{candle_from_rest, RestKline, TimeFrame};
use crate::storage::CandleStore;

/// Venue page limit for a single klines request.
const MAX_BATCH: usize = 1000;
/// Attempt budget for HTTP 429 responses before a task aborts.
const MAX_RATE_LIMIT_ATTEMPTS: u32 = 3;
/// Attempt budget for -1021 drift recovery before a task aborts.
const MAX_DRIFT_RETRIES: u32 = 3;
/// Backoff ceiling for rate-limit sleeps.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Pause between successful pages, to stay under the venue rate limit.
const BATCH_DELAY: Duration = Duration::from_millis(100);
/// recvWindow applied after a drift error on venues that accept it.
const WIDENED_RECV_WINDOW_MS: u64 = 60_000;
/// Binance error code for client/server timestamp drift.
const TIME_DRIFT_CODE: i64 = -1021;

/// Why a backfill is running; selects the metadata tag on published candles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillReason {
    /// Catch-up after a stream disconnect.
    GapFill,
    /// Initial warm-up from REST history.
    Historical,
}

/// One (symbol, timeframe) pair to fill.
#[derive(Debug, Clone)]
pub struct BackfillTask {
    pub symbol: String,
    pub timeframe: TimeFrame,
    /// Close time of the last candle seen on the stream, when known.
    pub last_close_ms: Option<i64>,
    pub reason: BackfillReason,
}

pub(crate) struct KlineRequest {
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub start_time_ms: i64,
    pub limit: usize,
    pub recv_window_ms: Option<u64>,
}

/// Decoded venue response, separating the recovery paths the engine must
/// recognize from plain transport failures.
pub(crate) enum KlineResponse {
    Klines(Vec<RestKline>),
    RateLimited { retry_after_secs: u64 },
    VenueError { code: i64, message: String },
}

#[async_trait]
pub(crate) trait KlineFetcher: Send + Sync {
    async fn fetch(&self, request: &KlineRequest) -> EngineResult<KlineResponse>;
}

/// reqwest-backed fetcher against the venue klines endpoint.
struct HttpKlineFetcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpKlineFetcher {
    fn new(profile: &VenueProfile) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            endpoint: profile.klines_url(),
        }
    }
}

#[async_trait]
impl KlineFetcher for HttpKlineFetcher {
    async fn fetch(&self, request: &KlineRequest) -> EngineResult<KlineResponse> {
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", request.symbol.clone()),
            ("interval", request.timeframe.to_string()),
            ("startTime", request.start_time_ms.to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(window) = request.recv_window_ms {
            query.push(("recvWindow", window.to_string()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|err| {
                EngineError::network(
                    "backfill",
                    "fetch_klines",
                    format!("klines request failed: {err}"),
                )
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok())
                .unwrap_or(60);
            return Ok(KlineResponse::RateLimited { retry_after_secs });
        }
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            return Ok(KlineResponse::VenueError {
                code: body.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: body
                    .get("msg")
                    .and_then(|m| m.as_str())
                    .unwrap_or("bad request")
                    .to_string(),
            });
        }
        if !status.is_success() {
            return Err(EngineError::network(
                "backfill",
                "fetch_klines",
                format!("klines request returned HTTP {status}"),
            ));
        }

        let rows: Vec<RestKline> = response.json().await.map_err(|err| {
            EngineError::network(
                "backfill",
                "fetch_klines",
                format!("malformed klines response: {err}"),
            )
        })?;
        Ok(KlineResponse::Klines(rows))
    }
}

pub struct BackfillEngine {
    profile: VenueProfile,
    store: Arc<dyn CandleStore>,
    bus: Arc<EventBus>,
    errors: Arc<ErrorManager>,
    fetcher: Arc<dyn KlineFetcher>,
    clock: Arc<dyn Clock>,
    backfill_window: Duration,
}

impl BackfillEngine {
    pub fn new(
        profile: VenueProfile,
        store: Arc<dyn CandleStore>,
        bus: Arc<EventBus>,
        errors: Arc<ErrorManager>,
        backfill_window: Duration,
    ) -> Self {
        let fetcher = Arc::new(HttpKlineFetcher::new(&profile));
        Self::with_fetcher(profile, store, bus, errors, backfill_window, fetcher)
    }

    pub(crate) fn with_fetcher(
        profile: VenueProfile,
        store: Arc<dyn CandleStore>,
        bus: Arc<EventBus>,
        errors: Arc<ErrorManager>,
        backfill_window: Duration,
        fetcher: Arc<dyn KlineFetcher>,
    ) -> Self {
        Self {
            profile,
            store,
            bus,
            errors,
            fetcher,
            clock: system_clock(),
            backfill_window,
        }
    }

    /// Fills every task concurrently. Individual task failures are reported
    /// and do not abort the rest.
    pub async fn run(&self, tasks: Vec<BackfillTask>) {
        let jobs = tasks.into_iter().map(|task| self.fill_pair(task));
        futures_util::future::join_all(jobs).await;
    }

    async fn fill_pair(&self, task: BackfillTask) {
        match self.fill_pair_inner(&task).await {
            Ok(0) => debug!(
                "backfill found nothing to do for {} {}",
                task.symbol, task.timeframe
            ),
            Ok(count) => info!(
                "backfill recovered {count} candles for {} {}",
                task.symbol, task.timeframe
            ),
            Err(err) => {
                self.errors.report(&err).await;
            }
        }
    }

    async fn fill_pair_inner(&self, task: &BackfillTask) -> EngineResult<u64> {
        let mut start = self.start_point(task).await?;
        let mut recovered = 0u64;
        let mut rate_limit_attempt: u32 = 0;
        let mut drift_retries: u32 = 0;
        let mut recv_window_ms: Option<u64> = None;

        loop {
            let now = self.clock.now_ms();
            if start >= now {
                break;
            }
            let needed = ((now - start) / task.timeframe.duration_ms()) as usize;
            let limit = needed.min(MAX_BATCH);
            if limit == 0 {
                break;
            }

            let request = KlineRequest {
                symbol: task.symbol.clone(),
                timeframe: task.timeframe,
                start_time_ms: start,
                limit,
                recv_window_ms,
            };

            match self.fetcher.fetch(&request).await? {
                KlineResponse::RateLimited { retry_after_secs } => {
                    let exponent = rate_limit_attempt;
                    rate_limit_attempt += 1;
                    if rate_limit_attempt > MAX_RATE_LIMIT_ATTEMPTS {
                        return Err(EngineError::network(
                            "backfill",
                            "fill_pair",
                            format!(
                                "rate limit budget exhausted for {} {}, aborting backfill",
                                task.symbol, task.timeframe
                            ),
                        ));
                    }
                    let delay = Duration::from_secs(retry_after_secs << exponent).min(MAX_BACKOFF);
                    warn!(
                        "rate limited on {} {}, retrying in {:?} (attempt {rate_limit_attempt})",
                        task.symbol, task.timeframe, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                KlineResponse::VenueError { code, message } if code == TIME_DRIFT_CODE => {
                    drift_retries += 1;
                    if drift_retries > MAX_DRIFT_RETRIES {
                        return Err(EngineError::network(
                            "backfill",
                            "fill_pair",
                            format!(
                                "timestamp drift persists for {} {}: {message}",
                                task.symbol, task.timeframe
                            ),
                        ));
                    }
                    self.log_drift_guidance(&message);
                    if self.profile.recv_window_recovery {
                        recv_window_ms = Some(WIDENED_RECV_WINDOW_MS);
                    }
                    // Retry the same window.
                }
                KlineResponse::VenueError { code, message } => {
                    return Err(EngineError::network(
                        "backfill",
                        "fill_pair",
                        format!("venue rejected klines request (code {code}): {message}"),
                    ));
                }
                KlineResponse::Klines(rows) => {
                    if rows.is_empty() {
                        break;
                    }
                    let last_close = rows.last().map(|row| row.6).unwrap_or(start);

                    for row in &rows {
                        let candle = candle_from_rest(
                            row,
                            &task.symbol,
                            task.timeframe,
                            self.profile.venue,
                        )?;
                        if candle_exists(&self.store, &candle).await? {
                            continue;
                        }
                        if self.store.upsert_candle(&candle).await? {
                            let gap_fill = task.reason == BackfillReason::GapFill;
                            if publish_candle(&self.bus, &candle, gap_fill, true).await {
                                recovered += 1;
                            }
                        }
                    }

                    rate_limit_attempt = 0;
                    start = last_close + 1;
                    tokio::time::sleep(BATCH_DELAY).await;
                }
            }
        }
        Ok(recovered)
    }

    /// Start of the missing interval: stream memory, else the latest
    /// persisted close, else a fixed window back from now.
    async fn start_point(&self, task: &BackfillTask) -> EngineResult<i64> {
        if let Some(last_close) = task.last_close_ms {
            return Ok(last_close);
        }
        if let Some(latest) = self
            .store
            .get_latest_candle(&task.symbol, task.timeframe, self.profile.venue)
            .await?
        {
            return Ok(latest.close_time);
        }
        Ok(self.clock.now_ms() - self.backfill_window.as_millis() as i64)
    }

    fn log_drift_guidance(&self, message: &str) {
        warn!(
            "venue reported timestamp drift (code {TIME_DRIFT_CODE}): {message}; \
             check NTP sync{}",
            if self.profile.recv_window_recovery {
                ", retrying with widened recvWindow"
            } else {
                ""
            }
        );
    }
}
