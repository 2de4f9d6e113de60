//! Exchange connectors: streaming ingestion and REST gap backfill.

pub mod backfill;
pub mod stream;

use std::sync::Arc;

use log::warn;

use crate::bus::EventBus;
use crate::core::errors::EngineResult;
use crate::market::{Candle, CandleEnvelope, TimeFrame, Venue};
use crate::protocol::{metadata, Event};
use crate::storage::CandleStore;

pub use backfill::{BackfillEngine, BackfillReason, BackfillTask};
pub use stream::StreamIngester;

/// Endpoint set and venue-specific behavior for one market.
#[derive(Debug, Clone)]
pub struct VenueProfile {
    pub venue: Venue,
    pub ws_base_url: String,
    pub rest_base_url: String,
    pub klines_path: &'static str,
    /// Whether the venue accepts a widened `recvWindow` after a timestamp
    /// drift error (code -1021).
    pub recv_window_recovery: bool,
}

impl VenueProfile {
    pub fn spot() -> Self {
        Self {
            venue: Venue::Spot,
            ws_base_url: "wss://stream.binance.com:9443".to_string(),
            rest_base_url: "https://api.binance.com".to_string(),
            klines_path: "/api/v3/klines",
            recv_window_recovery: false,
        }
    }

    pub fn usdm() -> Self {
        Self {
            venue: Venue::UsdM,
            ws_base_url: "wss://fstream.binance.com".to_string(),
            rest_base_url: "https://fapi.binance.com".to_string(),
            klines_path: "/fapi/v1/klines",
            recv_window_recovery: true,
        }
    }

    pub fn for_venue(venue: Venue) -> Self {
        match venue {
            Venue::Spot => Self::spot(),
            Venue::UsdM => Self::usdm(),
        }
    }

    /// Applies config URL overrides where present.
    pub fn with_overrides(mut self, ws: Option<&str>, rest: Option<&str>) -> Self {
        if let Some(ws) = ws {
            self.ws_base_url = ws.trim_end_matches('/').to_string();
        }
        if let Some(rest) = rest {
            self.rest_base_url = rest.trim_end_matches('/').to_string();
        }
        self
    }

    /// Combined-stream URL subscribing every (symbol, timeframe) pair.
    pub fn combined_stream_url(
        &self,
        symbols: &[String],
        timeframes: &[TimeFrame],
    ) -> EngineResult<url::Url> {
        let mut streams = Vec::with_capacity(symbols.len() * timeframes.len());
        for symbol in symbols {
            for timeframe in timeframes {
                streams.push(format!("{}@kline_{}", symbol.to_lowercase(), timeframe));
            }
        }

        let mut url = url::Url::parse(&self.ws_base_url).map_err(|err| {
            crate::core::errors::EngineError::configuration(
                "ingest",
                "combined_stream_url",
                format!("invalid ws_base_url '{}': {err}", self.ws_base_url),
            )
        })?;
        url.set_path("/stream");
        url.set_query(Some(&format!("streams={}", streams.join("/"))));
        Ok(url)
    }

    pub fn klines_url(&self) -> String {
        format!("{}{}", self.rest_base_url, self.klines_path)
    }
}

/// Publishes one candle on `candles.v1`, tagging the recovery path that
/// produced it. A refused publish is non-fatal: the persisted row remains
/// the source of truth.
pub(crate) async fn publish_candle(
    bus: &EventBus,
    candle: &Candle,
    gap_fill: bool,
    historical: bool,
) -> bool {
    let mut event = Event::candle_update(CandleEnvelope::from_candle(candle));
    if gap_fill {
        event = event.with_metadata(metadata::IS_GAP_FILL, serde_json::Value::Bool(true));
    }
    if historical {
        event = event.with_metadata(metadata::IS_HISTORICAL, serde_json::Value::Bool(true));
    }

    let accepted = bus.publish(event, 0).await;
    if !accepted {
        warn!(
            "bus refused candle {} {} {} (open {}); persisted row is still authoritative",
            candle.venue, candle.symbol, candle.timeframe, candle.open_time
        );
    }
    accepted
}

/// Whether the persistence port already holds this candle's row.
pub(crate) async fn candle_exists(
    store: &Arc<dyn CandleStore>,
    candle: &Candle,
) -> EngineResult<bool> {
    let existing = store
        .get_candles(
            &candle.symbol,
            candle.timeframe,
            candle.venue,
            Some(candle.open_time),
            Some(candle.open_time),
            1,
        )
        .await?;
    Ok(!existing.is_empty())
}
