use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use strategy_core::Strategy;

use crate::models::{BacktestResult, MonteCarloResult};

/// Bundle a strategy's identity, its backtest, an optional Monte Carlo run
/// and the configuration that produced them into one JSON document.
pub fn export_results<C: Serialize + ?Sized>(
    strategy: &dyn Strategy,
    backtest: &BacktestResult,
    monte_carlo: Option<&MonteCarloResult>,
    config: &C,
) -> serde_json::Result<Value> {
    Ok(json!({
        "strategy": {
            "name": strategy.name(),
            "symbol": strategy.symbol(),
            "timeframe": strategy.timeframe(),
            "parameters": backtest.parameters,
        },
        "backtest": serde_json::to_value(backtest)?,
        "monte_carlo": monte_carlo.map(serde_json::to_value).transpose()?,
        "config": serde_json::to_value(config)?,
        "exported_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

pub fn export_results_pretty<C: Serialize + ?Sized>(
    strategy: &dyn Strategy,
    backtest: &BacktestResult,
    monte_carlo: Option<&MonteCarloResult>,
    config: &C,
) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&export_results(strategy, backtest, monte_carlo, config)?)
}
