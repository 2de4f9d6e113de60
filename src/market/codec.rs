//! Deserializers for the two venue kline encodings.
//!
//! WebSocket frames carry named single-letter fields; REST rows are
//! positional arrays. Both decode prices into `Decimal` straight from the
//! venue strings, so the precision on the wire is the precision in the
//! candle.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::clock::rfc3339_ms;
use crate::core::errors::EngineError;
use crate::market::{Candle, TimeFrame, Venue};

/// Combined-stream wrapper: `{"stream": "...", "data": {...}}`.
#[derive(Deserialize, Debug)]
pub struct CombinedFrame<T> {
    #[allow(dead_code)]
    pub stream: String,
    pub data: T,
}

/// A `kline` event frame from the WebSocket stream.
#[derive(Deserialize, Debug)]
pub struct KlineFrame {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub bar: KlineBar,
}

/// The nested `k` object of a kline frame.
#[derive(Deserialize, Debug)]
pub struct KlineBar {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v")]
    pub base_volume: Decimal,
    #[serde(rename = "n")]
    pub trade_count: u64,
    /// Whether the interval has fully elapsed.
    #[serde(rename = "x")]
    pub closed: bool,
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
    #[serde(rename = "V")]
    pub taker_buy_base: Decimal,
    #[serde(rename = "Q")]
    pub taker_buy_quote: Decimal,
}

/// One positional row of a REST klines response:
/// `[open_time, o, h, l, c, v, close_time, q, n, V, Q, ignore]`.
#[derive(Deserialize, Debug)]
pub struct RestKline(
    pub i64,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub i64,
    pub Decimal,
    pub u64,
    pub Decimal,
    pub Decimal,
    pub serde_json::Value,
);

/// Builds a candle from a WebSocket kline bar.
pub fn candle_from_ws(bar: &KlineBar, venue: Venue) -> Result<Candle, EngineError> {
    let timeframe: TimeFrame = bar.interval.parse()?;
    let candle = Candle {
        venue,
        symbol: bar.symbol.clone(),
        timeframe,
        open_time: bar.open_time,
        close_time: bar.close_time,
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        base_volume: bar.base_volume,
        quote_volume: bar.quote_volume,
        trade_count: bar.trade_count,
        taker_buy_base: bar.taker_buy_base,
        taker_buy_quote: bar.taker_buy_quote,
    };
    candle.validate()?;
    Ok(candle)
}

/// Builds a candle from a REST kline row.
pub fn candle_from_rest(
    row: &RestKline,
    symbol: &str,
    timeframe: TimeFrame,
    venue: Venue,
) -> Result<Candle, EngineError> {
    let candle = Candle {
        venue,
        symbol: symbol.to_string(),
        timeframe,
        open_time: row.0,
        close_time: row.6,
        open: row.1,
        high: row.2,
        low: row.3,
        close: row.4,
        base_volume: row.5,
        quote_volume: row.7,
        trade_count: row.8,
        taker_buy_base: row.9,
        taker_buy_quote: row.10,
    };
    candle.validate()?;
    Ok(candle)
}

/// The serialized `candles.v1` payload.
///
/// Times are RFC-3339 UTC; prices and volumes serialize as decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleEnvelope {
    pub venue: Venue,
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub open_time: String,
    pub close_time: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: u64,
}

impl CandleEnvelope {
    pub fn from_candle(candle: &Candle) -> Self {
        Self {
            venue: candle.venue,
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe,
            open_time: rfc3339_ms(candle.open_time),
            close_time: rfc3339_ms(candle.close_time),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.base_volume,
            quote_volume: candle.quote_volume,
            trades: candle.trade_count,
        }
    }
}
