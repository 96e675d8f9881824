use chrono::{DateTime, Utc};

use crate::{Candle, EngineResult, Signal, StrategyContext, StrategyParameters};

/// A trading strategy as seen by the evaluation engines.
///
/// Implementations are fixed at construction and must be deterministic for a
/// given context and parameter set if callers rely on idempotent backtests.
/// `Send + Sync` lets batch operations replay the same strategy from several
/// worker threads.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn symbol(&self) -> &str;
    fn timeframe(&self) -> &str;
    fn default_parameters(&self) -> StrategyParameters;
    fn execute(&self, context: &StrategyContext<'_>, parameters: &StrategyParameters) -> Vec<Signal>;
}

/// Source of historical candles and spreads.
pub trait MarketDataProvider: Send + Sync {
    /// Ascending candles for `symbol`/`timeframe` within `[start, end]`.
    fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Candle>>;

    /// Fractional bid/ask spread (0.0002 = 2 bps).
    fn get_spread(&self, symbol: &str) -> f64;
}
