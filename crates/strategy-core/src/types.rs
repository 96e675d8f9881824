use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// OHLCV candle. Providers return these in ascending timestamp order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for longs, -1 for shorts.
    pub fn direction(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Entry,
    Exit,
}

/// Instruction emitted by a strategy for the current candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub side: Side,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Explicit position size; bypasses risk-based sizing when set.
    #[serde(default)]
    pub size: Option<Decimal>,
    /// Fraction of balance at risk for this entry (overrides the run default).
    #[serde(default)]
    pub risk: Option<f64>,
}

impl Signal {
    pub fn entry(side: Side) -> Self {
        Self {
            kind: SignalKind::Entry,
            side,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            size: None,
            risk: None,
        }
    }

    /// Exit whatever position is open. The side is informational only.
    pub fn exit(side: Side) -> Self {
        Self {
            kind: SignalKind::Exit,
            ..Self::entry(side)
        }
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.take_profit = Some(price);
        self
    }

    pub fn with_size(mut self, size: Decimal) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_risk(mut self, risk: f64) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// An open position. At most one exists per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    /// Fill price after spread and slippage.
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl Position {
    /// Mark-to-market P&L at `price`, before commission.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.size * self.side.direction()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
}

/// A closed round trip. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    /// Net of commission.
    pub profit: Decimal,
    pub commission: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

/// A single strategy parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Flag(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Named parameter set. Ordered so signatures and exports are stable.
pub type StrategyParameters = BTreeMap<String, ParamValue>;

/// Read a numeric parameter, falling back to `default` when absent or not numeric.
pub fn param_f64(params: &StrategyParameters, name: &str, default: f64) -> f64 {
    params.get(name).and_then(ParamValue::as_f64).unwrap_or(default)
}

/// Read a boolean parameter, falling back to `default`.
pub fn param_bool(params: &StrategyParameters, name: &str, default: bool) -> bool {
    params.get(name).and_then(ParamValue::as_bool).unwrap_or(default)
}

/// Stable textual key for a parameter set (used for memoisation).
pub fn parameter_signature(params: &StrategyParameters) -> String {
    params
        .iter()
        .map(|(k, v)| match v {
            ParamValue::Number(n) => format!("{k}={n}"),
            ParamValue::Flag(b) => format!("{k}={b}"),
            ParamValue::Text(s) => format!("{k}={s}"),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Closed time interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `days` days ending at `end`.
    pub fn trailing(end: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.start >= self.end {
            return Err(EngineError::Configuration(format!(
                "date range start {} must precede end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Whole days covered by the range.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Snapshot handed to a strategy at each candle.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub timestamp: DateTime<Utc>,
    /// Close of the current candle.
    pub price: Decimal,
    pub balance: Decimal,
    pub equity: Decimal,
    pub position: Option<&'a Position>,
    /// Every candle up to and including the current one.
    pub candles: &'a [Candle],
}

impl<'a> StrategyContext<'a> {
    /// Index of the current candle within the replayed series.
    pub fn index(&self) -> usize {
        self.candles.len().saturating_sub(1)
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }
}
