//! Streaming kline ingestion over a combined WebSocket subscription.
//!
//! One ingester per venue. Only closed candles leave this module: a frame
//! with `x=false` is dropped before it touches persistence or the bus.
//! Disconnects trigger a bounded reconnect loop; every reconnection runs a
//! gap backfill before frame processing resumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::bus::EventBus;
use crate::config::IngestConfig;
use crate::core::errors::{EngineError, EngineResult, ErrorManager};
use crate::ingest::backfill::{BackfillEngine, BackfillReason, BackfillTask};
use crate::ingest::{candle_exists, publish_candle, VenueProfile};
use crate::market::codec::{CombinedFrame, KlineFrame};
use crate::market::{candle_from_ws, Candle, TimeFrame};
use crate::storage::CandleStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct StreamIngester {
    profile: VenueProfile,
    config: IngestConfig,
    store: Arc<dyn CandleStore>,
    bus: Arc<EventBus>,
    errors: Arc<ErrorManager>,
    backfill: BackfillEngine,
    running: Arc<AtomicBool>,
    stop_notify: Notify,
    reconnect_count: AtomicU32,
    last_close: Mutex<HashMap<(String, TimeFrame), i64>>,
}

impl StreamIngester {
    pub fn new(
        profile: VenueProfile,
        config: IngestConfig,
        store: Arc<dyn CandleStore>,
        bus: Arc<EventBus>,
        errors: Arc<ErrorManager>,
    ) -> Self {
        let profile = profile.with_overrides(
            config.ws_base_url.as_deref(),
            config.rest_base_url.as_deref(),
        );
        let backfill = BackfillEngine::new(
            profile.clone(),
            store.clone(),
            bus.clone(),
            errors.clone(),
            Duration::from_secs(config.backfill_window_hours as u64 * 3600),
        );
        Self {
            profile,
            config,
            store,
            bus,
            errors,
            backfill,
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Notify::new(),
            reconnect_count: AtomicU32::new(0),
            last_close: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Connect loop with a bounded reconnect budget. Returns once `stop()`
    /// is called or the budget is exhausted.
    pub async fn run(&self) -> EngineResult<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut attempts: u32 = 0;
        let mut reconnected = false;

        while self.is_running() && attempts < self.config.max_reconnect_attempts {
            match self.connect().await {
                Ok(mut socket) => {
                    info!(
                        "{} stream connected ({} symbols x {} timeframes)",
                        self.profile.venue,
                        self.config.symbols.len(),
                        self.config.timeframes.len()
                    );
                    attempts = 0;

                    if reconnected {
                        self.backfill.run(self.backfill_plan()).await;
                    }

                    if let Err(err) = self.read_loop(&mut socket).await {
                        self.errors.report(&err).await;
                    }
                    let _ = socket.close(None).await;
                }
                Err(err) => {
                    self.errors.report(&err).await;
                }
            }

            if !self.is_running() {
                break;
            }
            reconnected = true;
            attempts += 1;
            self.reconnect_count.fetch_add(1, Ordering::SeqCst);
            warn!(
                "{} stream disconnected, reconnecting in {}ms (attempt {attempts}/{})",
                self.profile.venue, self.config.reconnect_delay_ms, self.config.max_reconnect_attempts
            );
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;
        }

        self.running.store(false, Ordering::SeqCst);
        if attempts >= self.config.max_reconnect_attempts {
            return Err(EngineError::network(
                "ingest",
                "run",
                format!(
                    "{} stream gave up after {attempts} reconnect attempts",
                    self.profile.venue
                ),
            ));
        }
        Ok(())
    }

    /// Flips the running flag and wakes the frame loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn connect(&self) -> EngineResult<WsStream> {
        let url = self
            .profile
            .combined_stream_url(&self.config.symbols, &self.config.timeframes)?;
        debug!("connecting to {url}");
        let (socket, _) = connect_async(url).await.map_err(|err| {
            EngineError::network(
                "ingest",
                "connect",
                format!("{} websocket connect failed: {err}", self.profile.venue),
            )
        })?;
        Ok(socket)
    }

    async fn read_loop(&self, socket: &mut WsStream) -> EngineResult<()> {
        loop {
            if !self.is_running() {
                return Ok(());
            }
            tokio::select! {
                _ = self.stop_notify.notified() => return Ok(()),
                message = socket.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(text.into_bytes()).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(EngineError::network(
                            "ingest",
                            "read_loop",
                            format!("{} websocket closed", self.profile.venue),
                        ));
                    }
                    Some(Err(err)) => {
                        return Err(EngineError::network(
                            "ingest",
                            "read_loop",
                            format!("{} websocket error: {err}", self.profile.venue),
                        ));
                    }
                    _ => {}
                },
            }
        }
    }

    /// Decodes one raw frame and runs the closed-candle pipeline on it.
    /// Exposed so captured streams can be replayed through the ingester.
    pub async fn handle_frame(&self, mut bytes: Vec<u8>) {
        let frame = match simd_json::from_slice::<CombinedFrame<KlineFrame>>(&mut bytes) {
            Ok(wrapper) => wrapper.data,
            Err(err) => {
                debug!("ignoring non-kline frame: {err}");
                return;
            }
        };

        // Forming candles are dropped silently; only x=true leaves here.
        if !frame.bar.closed {
            return;
        }

        let candle = match candle_from_ws(&frame.bar, self.profile.venue) {
            Ok(candle) => candle,
            Err(err) => {
                self.errors.report(&err).await;
                return;
            }
        };

        self.note_close(&candle);
        self.ingest_candle(candle).await;
    }

    /// Dedup against persistence, upsert, publish. Candles that already have
    /// a row are skipped entirely.
    async fn ingest_candle(&self, candle: Candle) {
        match candle_exists(&self.store, &candle).await {
            Ok(true) => {
                debug!(
                    "skipping duplicate candle {} {} open {}",
                    candle.symbol, candle.timeframe, candle.open_time
                );
                return;
            }
            Ok(false) => {}
            Err(err) => {
                self.errors.report(&err).await;
                return;
            }
        }

        match self.store.upsert_candle(&candle).await {
            // A concurrent writer beat us to the row; the dedup property
            // still holds because the row is identical.
            Ok(false) => return,
            Ok(true) => {}
            Err(err) => {
                self.errors.report(&err).await;
                return;
            }
        }

        if publish_candle(&self.bus, &candle, false, false).await {
            info!(
                "closed candle {} {} {} O:{} H:{} L:{} C:{} V:{}",
                candle.venue,
                candle.symbol,
                candle.timeframe,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.base_volume
            );
        }
    }

    fn note_close(&self, candle: &Candle) {
        self.last_close
            .lock()
            .expect("last close map poisoned")
            .insert(
                (candle.symbol.clone(), candle.timeframe),
                candle.close_time,
            );
    }

    /// One backfill task per configured (symbol, timeframe) pair, seeded
    /// with the close time last seen on the stream.
    pub(crate) fn backfill_plan(&self) -> Vec<BackfillTask> {
        let last_close = self.last_close.lock().expect("last close map poisoned");
        let mut plan = Vec::with_capacity(self.config.symbols.len() * self.config.timeframes.len());
        for symbol in &self.config.symbols {
            for timeframe in &self.config.timeframes {
                plan.push(BackfillTask {
                    symbol: symbol.clone(),
                    timeframe: *timeframe,
                    last_close_ms: last_close.get(&(symbol.clone(), *timeframe)).copied(),
                    reason: BackfillReason::GapFill,
                });
            }
        }
        plan
    }
}
