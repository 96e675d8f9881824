use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, SecondsFormat};
use rayon::prelude::*;
use rayon::ThreadPool;
use strategy_core::{
    stats, Candle, DateRange, EngineError, EngineResult, MarketDataProvider, ProgressHandle,
    RunTracker, Strategy, StrategyParameters,
};
use tracing::{debug, info, warn};

use crate::engine::{load_candles, resolve_spread, slice_candles, Replay};
use crate::genetic::GeneticSearch;
use crate::metrics::calculate_metrics;
use crate::models::*;

/// Robustness at or above this counts as an efficient window.
const EFFICIENT_ROBUSTNESS: f64 = 0.7;

/// One in-sample / out-of-sample window pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    pub index: usize,
    pub in_sample: DateRange,
    pub out_of_sample: DateRange,
}

/// Rolling windows over `config.range`, advancing by
/// `floor(out_sample_days * (1 - overlap / 100))` days.
pub fn build_windows(config: &WalkForwardConfig) -> EngineResult<Vec<WindowSpec>> {
    let step_days = (config.out_sample_days as f64 * (1.0 - config.overlap_pct / 100.0)).floor() as i64;
    if step_days < 1 {
        return Err(EngineError::Configuration(format!(
            "window step is {step_days} days; lower the overlap or lengthen the out-of-sample window"
        )));
    }

    let in_len = Duration::days(config.in_sample_days);
    let out_len = Duration::days(config.out_sample_days);
    let mut windows = Vec::new();
    let mut start = config.range.start;
    while start + in_len + out_len <= config.range.end {
        let split = start + in_len;
        windows.push(WindowSpec {
            index: windows.len(),
            in_sample: DateRange::new(start, split),
            out_of_sample: DateRange::new(split, split + out_len),
        });
        start += Duration::days(step_days);
    }
    Ok(windows)
}

/// out-of-sample / in-sample return, 0 unless the in-sample return is positive.
pub fn robustness(in_sample_return: f64, out_of_sample_return: f64) -> f64 {
    if in_sample_return > 0.0 {
        out_of_sample_return / in_sample_return
    } else {
        0.0
    }
}

/// Mean, spread and coefficient of variation of each optimised parameter.
pub fn parameter_stability(ranges: &[ParameterRange], periods: &[WalkForwardPeriod]) -> Vec<ParameterStability> {
    ranges
        .iter()
        .map(|range| {
            let values: Vec<f64> = periods
                .iter()
                .filter_map(|p| p.parameters.get(&range.name).and_then(|v| v.as_f64()))
                .collect();
            let mean = stats::mean(&values);
            let std_dev = stats::population_std_dev(&values);
            ParameterStability {
                name: range.name.clone(),
                mean,
                std_dev,
                stability_score: if mean.abs() < 1e-12 {
                    None
                } else {
                    Some(std_dev / mean.abs())
                },
            }
        })
        .collect()
}

fn summarize(periods: &[WalkForwardPeriod]) -> WalkForwardSummary {
    if periods.is_empty() {
        return WalkForwardSummary::default();
    }
    let n = periods.len() as f64;
    let compounded = periods
        .iter()
        .fold(1.0, |acc, p| acc * (1.0 + p.out_of_sample_return / 100.0));
    let oos: Vec<&PerformanceMetrics> = periods.iter().map(|p| &p.out_of_sample_metrics).collect();
    let robustness: Vec<f64> = periods.iter().map(|p| p.robustness).collect();

    WalkForwardSummary {
        total_return: (compounded - 1.0) * 100.0,
        average_sharpe: oos.iter().map(|m| m.sharpe_ratio).sum::<f64>() / n,
        worst_drawdown: oos.iter().map(|m| m.max_drawdown).fold(0.0, f64::min),
        average_win_rate: oos.iter().map(|m| m.win_rate).sum::<f64>() / n,
        average_profit_factor: oos.iter().map(|m| m.profit_factor).sum::<f64>() / n,
        average_robustness: stats::mean(&robustness),
        optimization_efficiency: robustness.iter().filter(|r| **r >= EFFICIENT_ROBUSTNESS).count() as f64 / n,
    }
}

/// Walk-forward validator: optimise in-sample, replay out-of-sample, repeat.
pub struct WalkForwardAnalyzer {
    provider: Arc<dyn MarketDataProvider>,
    pool: Arc<ThreadPool>,
    tracker: RunTracker,
    history: Mutex<Vec<WalkForwardResult>>,
}

impl WalkForwardAnalyzer {
    pub fn new(provider: Arc<dyn MarketDataProvider>, pool: Arc<ThreadPool>) -> Self {
        Self {
            provider,
            pool,
            tracker: RunTracker::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn run_analysis(&self, strategy: &dyn Strategy, config: &WalkForwardConfig) -> EngineResult<WalkForwardResult> {
        config.validate()?;
        let windows = build_windows(config)?;
        if windows.is_empty() {
            return Err(EngineError::Data(format!(
                "range of {} days fits no {}+{} day window",
                config.range.days(),
                config.in_sample_days,
                config.out_sample_days
            )));
        }
        let guard = self.tracker.begin("walk-forward")?;

        let candles = load_candles(self.provider.as_ref(), strategy.symbol(), strategy.timeframe(), &config.range)?;
        let spread = resolve_spread(self.provider.as_ref(), strategy.symbol(), &config.execution);
        let seed = config.seed.unwrap_or_else(rand::random);
        info!(
            strategy = strategy.name(),
            windows = windows.len(),
            in_sample_days = config.in_sample_days,
            out_sample_days = config.out_sample_days,
            seed,
            "starting walk-forward analysis"
        );

        let total = windows.len();
        let finished = AtomicUsize::new(0);
        let periods: Vec<Option<WalkForwardPeriod>> = self.pool.install(|| {
            windows
                .par_iter()
                .map(|window| {
                    if guard.is_cancelled() {
                        return Err(EngineError::Cancelled("walk-forward".to_string()));
                    }
                    let period = self.analyze_window(strategy, config, &candles, spread, seed, window, &|| {
                        guard.is_cancelled()
                    })?;
                    let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                    guard.set_progress(done as f64 / total as f64 * 100.0);
                    Ok(period)
                })
                .collect::<EngineResult<Vec<_>>>()
        })?;
        guard.check_cancelled()?;

        let periods: Vec<WalkForwardPeriod> = periods.into_iter().flatten().collect();
        if periods.is_empty() {
            return Err(EngineError::Data(
                "no walk-forward window contained candles on both sides".to_string(),
            ));
        }

        let is_returns: Vec<f64> = periods.iter().map(|p| p.in_sample_return).collect();
        let oos_returns: Vec<f64> = periods.iter().map(|p| p.out_of_sample_return).collect();
        let result = WalkForwardResult {
            id: format!(
                "wf_{}_{}_{}",
                strategy.symbol(),
                config.range.start.to_rfc3339_opts(SecondsFormat::Millis, true),
                seed
            ),
            strategy_name: strategy.name().to_string(),
            symbol: strategy.symbol().to_string(),
            summary: summarize(&periods),
            predictive_power: stats::pearson_correlation(&is_returns, &oos_returns),
            parameter_stability: parameter_stability(&config.parameter_ranges, &periods),
            periods,
            seed,
        };
        info!(
            periods = result.periods.len(),
            total_return = result.summary.total_return,
            robustness = result.summary.average_robustness,
            efficiency = result.summary.optimization_efficiency,
            "walk-forward analysis complete"
        );

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        guard.complete();
        Ok(result)
    }

    /// Optimise one window in-sample and replay the winner out-of-sample.
    /// `None` when either side of the window has no candles.
    #[allow(clippy::too_many_arguments)]
    fn analyze_window(
        &self,
        strategy: &dyn Strategy,
        config: &WalkForwardConfig,
        candles: &[Candle],
        spread: f64,
        seed: u64,
        window: &WindowSpec,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> EngineResult<Option<WalkForwardPeriod>> {
        let in_sample = slice_candles(candles, window.in_sample.start, window.in_sample.end);
        let out_of_sample = slice_candles(candles, window.out_of_sample.start, window.out_of_sample.end);
        if in_sample.is_empty() || out_of_sample.is_empty() {
            warn!(window = window.index, "skipping walk-forward window without candles");
            return Ok(None);
        }

        let search = GeneticSearch {
            strategy,
            candles: in_sample,
            ranges: &config.parameter_ranges,
            target: config.target,
            genetic: &config.genetic,
            execution: &config.execution,
            spread,
            initial_balance: config.initial_balance,
        };
        let outcome = search.run(seed.wrapping_add(window.index as u64), cancelled, &|_| {})?;
        let parameters: StrategyParameters = outcome
            .best()
            .map(|b| b.parameters.clone())
            .unwrap_or_else(|| strategy.default_parameters());

        let in_metrics = self.replay_metrics(strategy, &parameters, config, spread, in_sample);
        let out_metrics = self.replay_metrics(strategy, &parameters, config, spread, out_of_sample);
        let in_sample_return = in_metrics.total_return_pct;
        let out_of_sample_return = out_metrics.total_return_pct;
        debug!(
            window = window.index,
            in_sample_return,
            out_of_sample_return,
            "walk-forward window evaluated"
        );

        Ok(Some(WalkForwardPeriod {
            window: window.index,
            in_sample: window.in_sample,
            out_of_sample: window.out_of_sample,
            parameters,
            in_sample_return,
            out_of_sample_return,
            in_sample_metrics: in_metrics,
            out_of_sample_metrics: out_metrics,
            robustness: robustness(in_sample_return, out_of_sample_return),
        }))
    }

    fn replay_metrics(
        &self,
        strategy: &dyn Strategy,
        parameters: &StrategyParameters,
        config: &WalkForwardConfig,
        spread: f64,
        candles: &[Candle],
    ) -> PerformanceMetrics {
        let outcome = Replay::new(strategy, parameters, &config.execution, spread, config.initial_balance).run(candles);
        calculate_metrics(&outcome.trades, &outcome.equity_curve, config.initial_balance)
    }

    pub fn progress(&self) -> f64 {
        self.tracker.progress()
    }

    pub fn is_running(&self) -> bool {
        self.tracker.is_running()
    }

    pub fn handle(&self) -> ProgressHandle {
        self.tracker.handle()
    }

    pub fn history(&self) -> Vec<WalkForwardResult> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
