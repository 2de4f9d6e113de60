//! Market data model: venues, bar widths, and the immutable OHLCV candle.

pub mod codec;

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::errors::EngineError;

pub use codec::{candle_from_rest, candle_from_ws, CandleEnvelope, KlineFrame, RestKline};

/// Exchange market the data originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Spot,
    #[serde(rename = "usdm")]
    UsdM,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Spot => "spot",
            Venue::UsdM => "usdm",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(Venue::Spot),
            "usdm" => Ok(Venue::UsdM),
            other => Err(EngineError::validation(
                "market",
                "parse_venue",
                format!("unknown venue: {other}"),
            )),
        }
    }
}

/// Fixed enumeration of bar widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeFrame {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl TimeFrame {
    pub const ALL: [TimeFrame; 12] = [
        TimeFrame::M1,
        TimeFrame::M3,
        TimeFrame::M5,
        TimeFrame::M15,
        TimeFrame::M30,
        TimeFrame::H1,
        TimeFrame::H2,
        TimeFrame::H4,
        TimeFrame::H6,
        TimeFrame::H8,
        TimeFrame::H12,
        TimeFrame::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M1 => "1m",
            TimeFrame::M3 => "3m",
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::M30 => "30m",
            TimeFrame::H1 => "1h",
            TimeFrame::H2 => "2h",
            TimeFrame::H4 => "4h",
            TimeFrame::H6 => "6h",
            TimeFrame::H8 => "8h",
            TimeFrame::H12 => "12h",
            TimeFrame::D1 => "1d",
        }
    }

    /// Width of one bar in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            TimeFrame::M1 => 60_000,
            TimeFrame::M3 => 180_000,
            TimeFrame::M5 => 300_000,
            TimeFrame::M15 => 900_000,
            TimeFrame::M30 => 1_800_000,
            TimeFrame::H1 => 3_600_000,
            TimeFrame::H2 => 7_200_000,
            TimeFrame::H4 => 14_400_000,
            TimeFrame::H6 => 21_600_000,
            TimeFrame::H8 => 28_800_000,
            TimeFrame::H12 => 43_200_000,
            TimeFrame::D1 => 86_400_000,
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeFrame {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeFrame::ALL
            .iter()
            .find(|tf| tf.as_str() == s)
            .copied()
            .ok_or_else(|| {
                EngineError::validation(
                    "market",
                    "parse_timeframe",
                    format!("unknown timeframe: {s}"),
                )
            })
    }
}

/// Unique identity of a candle row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandleKey {
    pub venue: Venue,
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub open_time: i64,
}

/// An immutable OHLCV bar.
///
/// Prices and volumes are fixed-point decimals carrying the exact precision
/// delivered by the venue. Once a candle is persisted it is a read-only fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub venue: Venue,
    pub symbol: String,
    pub timeframe: TimeFrame,
    /// Bar open, epoch milliseconds UTC.
    pub open_time: i64,
    /// Bar close, epoch milliseconds UTC.
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub base_volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_buy_base: Decimal,
    pub taker_buy_quote: Decimal,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            venue: self.venue,
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            open_time: self.open_time,
        }
    }

    /// Checks the OHLC shape invariants.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.open_time >= self.close_time {
            return Err(EngineError::validation(
                "market",
                "validate_candle",
                format!(
                    "open_time {} must precede close_time {}",
                    self.open_time, self.close_time
                ),
            ));
        }
        if self.low > self.high {
            return Err(EngineError::validation(
                "market",
                "validate_candle",
                format!("low {} above high {}", self.low, self.high),
            ));
        }
        for (name, price) in [("open", self.open), ("close", self.close)] {
            if price < self.low || price > self.high {
                return Err(EngineError::validation(
                    "market",
                    "validate_candle",
                    format!("{name} {price} outside [{}, {}]", self.low, self.high),
                ));
            }
        }
        Ok(())
    }
}
