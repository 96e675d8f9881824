use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rayon::ThreadPool;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde_json::json;
use strategy_core::*;

use crate::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn price(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap().round_dp(6)
}

/// Helper: daily candle with explicit OHLC.
fn candle(day: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        timestamp: t0() + Duration::days(day),
        open: price(open),
        high: price(high),
        low: price(low),
        close: price(close),
        volume: 1_000.0,
    }
}

/// Helper: candles whose OHLC all equal the close.
fn series(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| candle(i as i64, c, c, c, c))
        .collect()
}

fn rising(n: usize) -> Vec<Candle> {
    series(&(0..n).map(|i| 100.0 + i as f64).collect::<Vec<_>>())
}

/// Helper: noisy sine wave with a slight drift.
fn wave(n: usize, phase: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let c = 100.0 + 5.0 * (i as f64 * 0.3 + phase).sin() + 0.05 * i as f64;
            candle(i as i64, c * 0.999, c * 1.01, c * 0.99, c)
        })
        .collect()
}

fn range_for(n: usize) -> DateRange {
    DateRange::new(t0(), t0() + Duration::days(n as i64 - 1))
}

fn provider(entries: &[(&str, Vec<Candle>)]) -> Arc<dyn MarketDataProvider> {
    let mut data = InMemoryMarketData::new();
    for (symbol, candles) in entries {
        data.insert(symbol, "1d", candles.clone());
    }
    Arc::new(data)
}

fn pool() -> Arc<ThreadPool> {
    Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
}

/// Emits pre-scripted signals keyed by candle index.
struct Scripted {
    symbol: String,
    script: BTreeMap<usize, Vec<Signal>>,
}

impl Scripted {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            script: BTreeMap::new(),
        }
    }

    fn at(mut self, index: usize, signal: Signal) -> Self {
        self.script.entry(index).or_default().push(signal);
        self
    }
}

impl Strategy for Scripted {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn timeframe(&self) -> &str {
        "1d"
    }

    fn default_parameters(&self) -> StrategyParameters {
        StrategyParameters::new()
    }

    fn execute(&self, context: &StrategyContext<'_>, _parameters: &StrategyParameters) -> Vec<Signal> {
        self.script.get(&context.index()).cloned().unwrap_or_default()
    }
}

/// Buys one unit on the first candle and exits after `hold` candles.
struct HoldFor {
    symbol: String,
}

impl HoldFor {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
        }
    }
}

impl Strategy for HoldFor {
    fn name(&self) -> &str {
        "HoldFor"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn timeframe(&self) -> &str {
        "1d"
    }

    fn default_parameters(&self) -> StrategyParameters {
        StrategyParameters::from([("hold".to_string(), ParamValue::Number(5.0))])
    }

    fn execute(&self, context: &StrategyContext<'_>, parameters: &StrategyParameters) -> Vec<Signal> {
        let hold = param_f64(parameters, "hold", 5.0).round() as usize;
        let mut signals = Vec::new();
        if context.index() == 0 {
            signals.push(Signal::entry(Side::Buy).with_size(dec!(1)));
        }
        if context.index() == hold {
            signals.push(Signal::exit(Side::Buy));
        }
        signals
    }
}

/// Holds like [`HoldFor`] but cancels its own run on the first candle.
struct CancelsRun {
    inner: HoldFor,
    handle: ProgressHandle,
}

impl CancelsRun {
    fn new(symbol: &str, handle: ProgressHandle) -> Self {
        Self {
            inner: HoldFor::new(symbol),
            handle,
        }
    }
}

impl Strategy for CancelsRun {
    fn name(&self) -> &str {
        "CancelsRun"
    }

    fn symbol(&self) -> &str {
        self.inner.symbol()
    }

    fn timeframe(&self) -> &str {
        "1d"
    }

    fn default_parameters(&self) -> StrategyParameters {
        self.inner.default_parameters()
    }

    fn execute(&self, context: &StrategyContext<'_>, parameters: &StrategyParameters) -> Vec<Signal> {
        self.handle.cancel();
        self.inner.execute(context, parameters)
    }
}

fn assert_cancelled<T: std::fmt::Debug>(outcome: EngineResult<T>, handle: &ProgressHandle) {
    assert!(matches!(outcome, Err(EngineError::Cancelled(_))), "{outcome:?}");
    assert_eq!(handle.poll().status, RunStatus::Cancelled);
    assert!(!handle.is_running());
}

// =============================================================================
// Backtest engine
// =============================================================================

#[test]
fn test_flat_market_without_signals() {
    let candles = series(&[100.0; 100]);
    let engine = BacktestEngine::new(provider(&[("FLAT", candles)]));
    let config = BacktestConfig::new(Arc::new(Scripted::new("FLAT")), range_for(100), dec!(10000));

    let result = engine.run_backtest(&config).unwrap();

    assert!(result.trades.is_empty());
    assert_eq!(result.metrics.total_trades, 0);
    assert_eq!(result.metrics.total_pnl, Decimal::ZERO);
    assert_eq!(result.metrics.win_rate, 0.0);
    assert_eq!(result.metrics.max_drawdown, 0.0);
    assert_eq!(result.equity_curve.len(), 100);
    assert!(result.equity_curve.iter().all(|p| p.equity == dec!(10000)));
    assert_eq!(result.final_balance, dec!(10000));
}

#[test]
fn test_round_trip_profit() {
    let candles = series(&(0..20).map(|i| if i >= 10 { 110.0 } else { 100.0 }).collect::<Vec<_>>());
    let strategy = Scripted::new("RT")
        .at(0, Signal::entry(Side::Buy).with_size(dec!(1)))
        .at(10, Signal::exit(Side::Buy));
    let engine = BacktestEngine::new(provider(&[("RT", candles)]));
    let config = BacktestConfig::new(Arc::new(strategy), range_for(20), dec!(10000));

    let result = engine.run_backtest(&config).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.profit, dec!(10));
    assert_eq!(trade.exit_reason, ExitReason::Signal);
    assert_eq!(result.final_balance, dec!(10010));
    assert_eq!(result.metrics.winning_trades, 1);
    assert_eq!(result.metrics.win_rate, 1.0);
}

#[test]
fn test_equity_after_close_adds_trade_profit() {
    let candles = wave(40, 0.0);
    let strategy = Scripted::new("EQ")
        .at(3, Signal::entry(Side::Buy).with_size(dec!(2)))
        .at(17, Signal::exit(Side::Buy));
    let engine = BacktestEngine::new(provider(&[("EQ", candles)]));
    let config = BacktestConfig::new(Arc::new(strategy), range_for(40), dec!(10000));

    let result = engine.run_backtest(&config).unwrap();

    let before_entry = result.equity_curve[2].equity;
    let after_close = result.equity_curve[17].equity;
    assert_eq!(after_close, before_entry + result.trades[0].profit);
}

#[test]
fn test_stop_loss_and_take_profit() {
    // Day 3 dips to 94, day 5 spikes to 106
    let mut candles = series(&[100.0; 10]);
    candles[3] = candle(3, 100.0, 100.0, 94.0, 99.0);
    candles[5] = candle(5, 100.0, 106.0, 100.0, 101.0);

    let stopped = Scripted::new("SL").at(
        0,
        Signal::entry(Side::Buy)
            .with_size(dec!(1))
            .with_stop_loss(dec!(95))
            .with_take_profit(dec!(105)),
    );
    let engine = BacktestEngine::new(provider(&[("SL", candles.clone()), ("TP", candles)]));
    let result = engine
        .run_backtest(&BacktestConfig::new(Arc::new(stopped), range_for(10), dec!(10000)))
        .unwrap();
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].exit_reason, ExitReason::StopLoss);
    assert_eq!(result.trades[0].exit_price, dec!(95));
    assert_eq!(result.trades[0].profit, dec!(-5));

    // Entry on day 4 skips the dip and meets the target
    let target = Scripted::new("TP").at(
        4,
        Signal::entry(Side::Buy)
            .with_size(dec!(1))
            .with_stop_loss(dec!(95))
            .with_take_profit(dec!(105)),
    );
    let result = engine
        .run_backtest(&BacktestConfig::new(Arc::new(target), range_for(10), dec!(10000)))
        .unwrap();
    assert_eq!(result.trades[0].exit_reason, ExitReason::TakeProfit);
    assert_eq!(result.trades[0].profit, dec!(5));
}

#[test]
fn test_stop_wins_when_both_levels_touched() {
    let mut candles = series(&[100.0; 5]);
    candles[2] = candle(2, 100.0, 110.0, 90.0, 100.0);
    let strategy = Scripted::new("TIE").at(
        0,
        Signal::entry(Side::Buy)
            .with_size(dec!(1))
            .with_stop_loss(dec!(95))
            .with_take_profit(dec!(105)),
    );
    let engine = BacktestEngine::new(provider(&[("TIE", candles)]));
    let result = engine
        .run_backtest(&BacktestConfig::new(Arc::new(strategy), range_for(5), dec!(10000)))
        .unwrap();
    assert_eq!(result.trades[0].exit_reason, ExitReason::StopLoss);
}

#[test]
fn test_gapped_stop_fills_at_open() {
    // Day 3 opens below the long stop and above the short stop
    let mut long_candles = series(&[100.0; 6]);
    long_candles[3] = candle(3, 90.0, 92.0, 88.0, 91.0);
    let mut short_candles = series(&[100.0; 6]);
    short_candles[3] = candle(3, 110.0, 112.0, 108.0, 109.0);

    let long = Scripted::new("GL").at(0, Signal::entry(Side::Buy).with_size(dec!(1)).with_stop_loss(dec!(95)));
    let short = Scripted::new("GS").at(0, Signal::entry(Side::Sell).with_size(dec!(1)).with_stop_loss(dec!(105)));
    let engine = BacktestEngine::new(provider(&[("GL", long_candles), ("GS", short_candles)]));

    let result = engine
        .run_backtest(&BacktestConfig::new(Arc::new(long), range_for(6), dec!(10000)))
        .unwrap();
    assert_eq!(result.trades[0].exit_reason, ExitReason::StopLoss);
    assert_eq!(result.trades[0].exit_price, dec!(90));
    assert_eq!(result.trades[0].profit, dec!(-10));

    let result = engine
        .run_backtest(&BacktestConfig::new(Arc::new(short), range_for(6), dec!(10000)))
        .unwrap();
    assert_eq!(result.trades[0].exit_reason, ExitReason::StopLoss);
    assert_eq!(result.trades[0].exit_price, dec!(110));
    assert_eq!(result.trades[0].profit, dec!(-10));
}

#[test]
fn test_tight_stop_size_capped_by_leverage() {
    let strategy = Scripted::new("TIGHT").at(
        0,
        Signal::entry(Side::Buy).with_stop_loss(dec!(0.99999999999999999999999999)),
    );
    let engine = BacktestEngine::new(provider(&[("TIGHT", series(&[1.0; 5]))]));
    let config = BacktestConfig::new(Arc::new(strategy), range_for(5), dec!(1000000));

    let result = engine.run_backtest(&config).unwrap();

    // 10x leverage on a 1,000,000 balance at a price of 1
    assert_eq!(result.positions.len(), 1);
    assert_eq!(result.positions[0].size, dec!(10000000));
    assert!(!engine.is_running());
}

#[test]
fn test_result_uses_configured_symbol() {
    let strategy = Scripted::new("OTHER")
        .at(0, Signal::entry(Side::Buy).with_size(dec!(1)))
        .at(3, Signal::exit(Side::Buy));
    let engine = BacktestEngine::new(provider(&[("DATA", rising(6))]));
    let mut config = BacktestConfig::new(Arc::new(strategy), range_for(6), dec!(10000));
    config.symbol = "DATA".to_string();

    let result = engine.run_backtest(&config).unwrap();

    assert_eq!(result.symbol, "DATA");
    assert!(result.id.starts_with("DATA_1d_"));
    assert!(result.positions.iter().all(|p| p.symbol == "DATA"));
    assert!(result.trades.iter().all(|t| t.symbol == "DATA"));
}

#[test]
fn test_drawdown_never_negative() {
    let candles = wave(150, 0.5);
    let engine = BacktestEngine::new(provider(&[("WAVE", candles)]));
    let config = BacktestConfig::new(Arc::new(SmaCrossover::new("WAVE", "1d")), range_for(150), dec!(10000));

    let result = engine.run_backtest(&config).unwrap();

    assert!(!result.trades.is_empty());
    assert!(result.equity_curve.iter().all(|p| p.drawdown >= 0.0));
    assert!(result.drawdown_curve.iter().all(|p| p.drawdown >= 0.0));
    assert!(result.metrics.max_drawdown <= 0.0);
}

#[test]
fn test_backtest_is_idempotent_and_cached() {
    let candles = wave(120, 1.0);
    let engine = BacktestEngine::new(provider(&[("IDEM", candles)]));
    let config = BacktestConfig::new(Arc::new(SmaCrossover::new("IDEM", "1d")), range_for(120), dec!(10000));

    let first = engine.run_backtest(&config).unwrap();
    let second = engine.run_backtest(&config).unwrap();

    assert_eq!(first.trades, second.trades);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(first.id, engine.result_id(&config));
    assert_eq!(engine.results().len(), 1);
    assert_eq!(engine.result(&first.id), Some(second));
    assert_eq!(engine.progress(), 100.0);

    engine.clear_results();
    assert!(engine.result(&first.id).is_none());
}

/// Calls back into the engine that is replaying it.
struct Reentrant {
    engine: Arc<BacktestEngine>,
    nested: BacktestConfig,
    seen: Mutex<Option<EngineResult<BacktestResult>>>,
}

impl Strategy for Reentrant {
    fn name(&self) -> &str {
        "Reentrant"
    }

    fn symbol(&self) -> &str {
        "RE"
    }

    fn timeframe(&self) -> &str {
        "1d"
    }

    fn default_parameters(&self) -> StrategyParameters {
        StrategyParameters::new()
    }

    fn execute(&self, context: &StrategyContext<'_>, _parameters: &StrategyParameters) -> Vec<Signal> {
        if context.index() == 0 {
            let outcome = self.engine.run_backtest(&self.nested);
            *self.seen.lock().unwrap() = Some(outcome);
        }
        Vec::new()
    }
}

#[test]
fn test_reentrant_backtest_is_rejected() {
    let engine = Arc::new(BacktestEngine::new(provider(&[("RE", rising(10))])));
    let nested = BacktestConfig::new(Arc::new(Scripted::new("RE")), range_for(10), dec!(1000));
    let strategy = Arc::new(Reentrant {
        engine: engine.clone(),
        nested: nested.clone(),
        seen: Mutex::new(None),
    });

    engine
        .run_backtest(&BacktestConfig::new(strategy.clone(), range_for(10), dec!(1000)))
        .unwrap();

    let seen = strategy.seen.lock().unwrap().take().unwrap();
    assert!(matches!(seen, Err(EngineError::Concurrency(_))));
    assert!(!engine.is_running());
    assert!(engine.run_backtest(&nested).is_ok());
}

#[test]
fn test_backtest_input_errors() {
    let engine = BacktestEngine::new(provider(&[("DATA", rising(10))]));

    let missing_symbol = BacktestConfig::new(Arc::new(Scripted::new("")), range_for(10), dec!(1000));
    assert!(matches!(
        engine.run_backtest(&missing_symbol),
        Err(EngineError::Configuration(_))
    ));

    let later = DateRange::new(t0() + Duration::days(100), t0() + Duration::days(200));
    let empty = BacktestConfig::new(Arc::new(Scripted::new("DATA")), later, dec!(1000));
    assert!(matches!(engine.run_backtest(&empty), Err(EngineError::Data(_))));

    let broke = BacktestConfig::new(Arc::new(Scripted::new("DATA")), range_for(10), dec!(0));
    assert!(matches!(engine.run_backtest(&broke), Err(EngineError::Configuration(_))));
    assert!(!engine.is_running());
}

// =============================================================================
// Monte Carlo simulator
// =============================================================================

fn mc_config(n: usize) -> MonteCarloConfig {
    let mut config = MonteCarloConfig::new(dec!(10000), t0() + Duration::days(n as i64 - 1));
    config.num_simulations = 60;
    config.time_horizon_days = n as i64;
    config.seed = Some(42);
    config
}

#[test]
fn test_monte_carlo_interval_and_determinism() {
    let settings = EngineSettings::default();
    let data = provider(&[("MC", wave(90, 0.2))]);
    let first = MonteCarloSimulator::new(data.clone(), pool(), &settings);
    let second = MonteCarloSimulator::new(data, pool(), &settings);
    let strategy = HoldFor::new("MC");

    let a = first.run_simulation(&strategy, &mc_config(90)).unwrap();
    let b = second.run_simulation(&strategy, &mc_config(90)).unwrap();

    assert!(a.confidence_interval.lower <= a.confidence_interval.upper);
    assert!(a.worst_case <= a.best_case);
    assert!((0.0..=1.0).contains(&a.probability_of_profit));
    assert_eq!(a.num_simulations, 60);
    assert_eq!(a.seed, 42);
    assert_eq!(a.return_distribution, b.return_distribution);
    assert_eq!(a.expected_return, b.expected_return);
    assert_eq!(first.history().len(), 1);
}

#[test]
fn test_monte_carlo_rejects_bad_config() {
    let sim = MonteCarloSimulator::new(provider(&[("MC", wave(30, 0.0))]), pool(), &EngineSettings::default());
    let mut config = mc_config(30);
    config.num_simulations = 0;
    assert!(matches!(
        sim.run_simulation(&HoldFor::new("MC"), &config),
        Err(EngineError::Configuration(_))
    ));
    assert!(!sim.is_running());
}

#[test]
fn test_monte_carlo_cancelled_mid_run() {
    let sim = MonteCarloSimulator::new(provider(&[("MC", wave(90, 0.2))]), pool(), &EngineSettings::default());
    let strategy = CancelsRun::new("MC", sim.handle());

    let outcome = sim.run_simulation(&strategy, &mc_config(90));

    assert_cancelled(outcome, &sim.handle());
    assert!(!sim.is_running());
    assert!(sim.history().is_empty());
}

// =============================================================================
// Genetic optimizer
// =============================================================================

#[test]
fn test_genetic_best_dominates_evaluated() {
    let optimizer = GeneticOptimizer::new(provider(&[("GA", rising(30))]), pool());
    let config = OptimizationConfig {
        parameter_ranges: vec![ParameterRange::new("hold", 0.0, 10.0, 1.0)],
        target: OptimizationTarget::TotalReturn,
        genetic: GeneticSettings {
            population_size: 10,
            generations: 3,
            ..GeneticSettings::default()
        },
        range: range_for(30),
        initial_balance: dec!(10000),
        execution: ExecutionSettings::default(),
        seed: Some(9),
    };

    let report = optimizer.optimize_strategy(&HoldFor::new("GA"), &config).unwrap();

    assert!(!report.evaluated.is_empty());
    assert!(report.evaluated.iter().all(|r| report.best.fitness >= r.fitness));
    let hold = param_f64(&report.best.parameters, "hold", -1.0);
    assert!((0.0..=10.0).contains(&hold));
    assert_eq!(report.generations_completed, 3);
    assert_eq!(report.best_backtest.parameters, report.best.parameters);
    assert_eq!(optimizer.history().len(), 1);
}

#[test]
fn test_genetic_cancelled_between_generations() {
    let optimizer = GeneticOptimizer::new(provider(&[("GA", rising(30))]), pool());
    let config = OptimizationConfig {
        parameter_ranges: vec![ParameterRange::new("hold", 0.0, 10.0, 1.0)],
        target: OptimizationTarget::TotalReturn,
        genetic: GeneticSettings {
            population_size: 6,
            generations: 4,
            ..GeneticSettings::default()
        },
        range: range_for(30),
        initial_balance: dec!(10000),
        execution: ExecutionSettings::default(),
        seed: Some(2),
    };
    let strategy = CancelsRun::new("GA", optimizer.handle());

    let outcome = optimizer.optimize_strategy(&strategy, &config);

    assert_cancelled(outcome, &optimizer.handle());
    assert!(!optimizer.is_running());
    assert!(optimizer.history().is_empty());
}

// =============================================================================
// Walk-forward analyzer
// =============================================================================

#[test]
fn test_walk_forward_robustness_convention() {
    let analyzer = WalkForwardAnalyzer::new(provider(&[("WF", wave(150, 0.0))]), pool());
    let config = WalkForwardConfig {
        range: range_for(150),
        in_sample_days: 30,
        out_sample_days: 15,
        overlap_pct: 0.0,
        initial_balance: dec!(10000),
        target: OptimizationTarget::TotalReturn,
        parameter_ranges: vec![ParameterRange::new("hold", 1.0, 12.0, 1.0)],
        genetic: GeneticSettings {
            population_size: 6,
            generations: 2,
            ..GeneticSettings::default()
        },
        execution: ExecutionSettings::default(),
        seed: Some(3),
    };

    let result = analyzer.run_analysis(&HoldFor::new("WF"), &config).unwrap();

    assert!(!result.periods.is_empty());
    for period in &result.periods {
        if period.in_sample_return <= 0.0 {
            assert_eq!(period.robustness, 0.0);
        }
        assert!(period.out_of_sample.start >= period.in_sample.end);
    }
    assert_eq!(result.parameter_stability.len(), 1);
    assert!((0.0..=1.0).contains(&result.summary.optimization_efficiency));
}

#[test]
fn test_walk_forward_needs_a_window() {
    let analyzer = WalkForwardAnalyzer::new(provider(&[("WF", wave(20, 0.0))]), pool());
    let config = WalkForwardConfig {
        range: range_for(20),
        in_sample_days: 30,
        out_sample_days: 15,
        overlap_pct: 0.0,
        initial_balance: dec!(10000),
        target: OptimizationTarget::SharpeRatio,
        parameter_ranges: vec![ParameterRange::new("hold", 1.0, 5.0, 1.0)],
        genetic: GeneticSettings::default(),
        execution: ExecutionSettings::default(),
        seed: Some(1),
    };
    assert!(matches!(
        analyzer.run_analysis(&HoldFor::new("WF"), &config),
        Err(EngineError::Data(_))
    ));
}

#[test]
fn test_walk_forward_cancelled_between_windows() {
    let analyzer = WalkForwardAnalyzer::new(provider(&[("WF", wave(150, 0.0))]), pool());
    let config = WalkForwardConfig {
        range: range_for(150),
        in_sample_days: 30,
        out_sample_days: 15,
        overlap_pct: 0.0,
        initial_balance: dec!(10000),
        target: OptimizationTarget::TotalReturn,
        parameter_ranges: vec![ParameterRange::new("hold", 1.0, 12.0, 1.0)],
        genetic: GeneticSettings {
            population_size: 4,
            generations: 2,
            ..GeneticSettings::default()
        },
        execution: ExecutionSettings::default(),
        seed: Some(4),
    };
    let strategy = CancelsRun::new("WF", analyzer.handle());

    let outcome = analyzer.run_analysis(&strategy, &config);

    assert_cancelled(outcome, &analyzer.handle());
    assert!(!analyzer.is_running());
    assert!(analyzer.history().is_empty());
}

// =============================================================================
// Portfolio optimizer
// =============================================================================

fn portfolio_config(n: usize, target: PortfolioTarget) -> PortfolioConfig {
    let mut config = PortfolioConfig::new(range_for(n), dec!(10000), target);
    config.stress_simulations = Some(8);
    config.seed = Some(5);
    config
}

#[test]
fn test_risk_parity_splits_identical_strategies() {
    let candles = wave(80, 0.3);
    let optimizer = PortfolioOptimizer::new(
        provider(&[("AAA", candles.clone()), ("BBB", candles)]),
        pool(),
        &EngineSettings::default(),
    );
    let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(HoldFor::new("AAA")), Arc::new(HoldFor::new("BBB"))];

    let result = optimizer
        .optimize_portfolio(&strategies, &portfolio_config(80, PortfolioTarget::RiskParity))
        .unwrap();

    assert!((result.weights[0] - 0.5).abs() < 1e-9);
    assert!((result.weights[1] - 0.5).abs() < 1e-9);
    assert!(result.converged);
    assert_eq!(result.stress_tests.len(), default_stress_scenarios().len());
}

#[test]
fn test_portfolio_weights_respect_bounds() {
    let optimizer = PortfolioOptimizer::new(
        provider(&[("X", wave(150, 0.0)), ("Y", wave(150, 1.7)), ("Z", wave(150, 3.1))]),
        pool(),
        &EngineSettings::default(),
    );
    let strategies: Vec<Arc<dyn Strategy>> = vec![
        Arc::new(SmaCrossover::new("X", "1d")),
        Arc::new(SmaCrossover::new("Y", "1d")),
        Arc::new(SmaCrossover::new("Z", "1d")),
    ];

    for target in [
        PortfolioTarget::Sharpe,
        PortfolioTarget::Return,
        PortfolioTarget::RiskParity,
        PortfolioTarget::MinVariance,
    ] {
        let mut config = portfolio_config(150, target);
        config.constraints.min_weight = 0.2;
        config.constraints.max_weight = 0.5;
        let result = optimizer.optimize_portfolio(&strategies, &config).unwrap();

        assert!((result.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9, "{target:?}");
        for w in &result.weights {
            assert!(*w >= 0.2 - 1e-9 && *w <= 0.5 + 1e-9, "{target:?} weight {w}");
        }
        assert_eq!(result.covariance.len(), 3);
        assert_eq!(result.allocations.len(), 3);
        assert!(result.metrics.max_drawdown <= 0.0);
    }
    assert_eq!(optimizer.history().len(), 4);
}

#[test]
fn test_portfolio_rejects_infeasible_bounds() {
    let optimizer = PortfolioOptimizer::new(provider(&[("A", rising(30)), ("B", rising(30))]), pool(), &EngineSettings::default());
    let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(HoldFor::new("A")), Arc::new(HoldFor::new("B"))];
    let mut config = portfolio_config(30, PortfolioTarget::Sharpe);
    config.constraints.min_weight = 0.6;

    assert!(matches!(
        optimizer.optimize_portfolio(&strategies, &config),
        Err(EngineError::Configuration(_))
    ));
    assert!(matches!(
        optimizer.optimize_portfolio(&[], &portfolio_config(30, PortfolioTarget::Sharpe)),
        Err(EngineError::Configuration(_))
    ));
}

#[test]
fn test_portfolio_cancelled_after_backtests() {
    let candles = wave(80, 0.3);
    let optimizer = PortfolioOptimizer::new(
        provider(&[("AAA", candles.clone()), ("BBB", candles)]),
        pool(),
        &EngineSettings::default(),
    );
    let strategies: Vec<Arc<dyn Strategy>> = vec![
        Arc::new(CancelsRun::new("AAA", optimizer.handle())),
        Arc::new(HoldFor::new("BBB")),
    ];

    let outcome = optimizer.optimize_portfolio(&strategies, &portfolio_config(80, PortfolioTarget::Sharpe));

    assert_cancelled(outcome, &optimizer.handle());
    assert!(!optimizer.is_running());
    assert!(optimizer.history().is_empty());
}

// =============================================================================
// Export
// =============================================================================

#[test]
fn test_export_document_shape() {
    let data = provider(&[("EXP", wave(60, 0.0))]);
    let strategy: Arc<dyn Strategy> = Arc::new(HoldFor::new("EXP"));
    let engine = BacktestEngine::new(data.clone());
    let backtest = engine
        .run_backtest(&BacktestConfig::new(strategy.clone(), range_for(60), dec!(10000)))
        .unwrap();
    let mut config = mc_config(60);
    config.num_simulations = 10;
    let mc = MonteCarloSimulator::new(data, pool(), &EngineSettings::default())
        .run_simulation(strategy.as_ref(), &config)
        .unwrap();

    let doc = export_results(strategy.as_ref(), &backtest, Some(&mc), &json!({"source": "test"})).unwrap();

    assert_eq!(doc["strategy"]["name"], "HoldFor");
    assert_eq!(doc["strategy"]["symbol"], "EXP");
    assert_eq!(doc["strategy"]["parameters"]["hold"], 5.0);
    assert_eq!(doc["backtest"]["id"], backtest.id.as_str());
    assert_eq!(doc["monte_carlo"]["num_simulations"], 10);
    assert_eq!(doc["config"]["source"], "test");
    assert!(doc["exported_at"].is_string());

    let bare = export_results(strategy.as_ref(), &backtest, None, &config).unwrap();
    assert!(bare["monte_carlo"].is_null());
    assert!(export_results_pretty(strategy.as_ref(), &backtest, None, &config)
        .unwrap()
        .contains('\n'));
}
