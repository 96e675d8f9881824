use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Candle, EngineError, EngineResult, MarketDataProvider};

/// One symbol/timeframe series as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSeries {
    pub symbol: String,
    pub timeframe: String,
    #[serde(default)]
    pub spread: f64,
    pub candles: Vec<Candle>,
}

/// In-process market data keyed by `(symbol, timeframe)`.
///
/// Used by the CLI (loaded from a JSON file) and as a test fixture.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketData {
    series: HashMap<(String, String), Vec<Candle>>,
    spreads: HashMap<String, f64>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a series. Candles are sorted by timestamp.
    pub fn insert(&mut self, symbol: &str, timeframe: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        self.series
            .insert((symbol.to_string(), timeframe.to_string()), candles);
    }

    pub fn with_series(mut self, symbol: &str, timeframe: &str, candles: Vec<Candle>) -> Self {
        self.insert(symbol, timeframe, candles);
        self
    }

    pub fn set_spread(&mut self, symbol: &str, spread: f64) {
        self.spreads.insert(symbol.to_string(), spread);
    }

    pub fn with_spread(mut self, symbol: &str, spread: f64) -> Self {
        self.set_spread(symbol, spread);
        self
    }

    /// Parse either a single series object or an array of series.
    pub fn from_json_str(raw: &str) -> EngineResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| EngineError::MarketData(format!("invalid candle JSON: {e}")))?;
        let series: Vec<CandleSeries> = if value.is_array() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value(value).map(|s| vec![s])
        }
        .map_err(|e| EngineError::MarketData(format!("invalid candle series: {e}")))?;

        let mut data = Self::new();
        for s in series {
            data.set_spread(&s.symbol, s.spread);
            data.insert(&s.symbol, &s.timeframe, s.candles);
        }
        Ok(data)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::MarketData(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Every registered `(symbol, timeframe)` pair.
    pub fn series_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.series.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// First and last timestamp of a series, if present.
    pub fn span(&self, symbol: &str, timeframe: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let candles = self
            .series
            .get(&(symbol.to_string(), timeframe.to_string()))?;
        Some((candles.first()?.timestamp, candles.last()?.timestamp))
    }
}

impl MarketDataProvider for InMemoryMarketData {
    fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Candle>> {
        let candles = self
            .series
            .get(&(symbol.to_string(), timeframe.to_string()))
            .ok_or_else(|| {
                EngineError::MarketData(format!("no series for {symbol} {timeframe}"))
            })?;
        Ok(candles
            .iter()
            .filter(|c| c.timestamp >= start && c.timestamp <= end)
            .cloned()
            .collect())
    }

    fn get_spread(&self, symbol: &str) -> f64 {
        self.spreads.get(symbol).copied().unwrap_or(0.0)
    }
}
