use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::SecondsFormat;
use rayon::prelude::*;
use rayon::ThreadPool;
use rust_decimal::prelude::*;
use strategy_core::{
    stats, DateRange, EngineError, EngineResult, MarketDataProvider, ProgressHandle, RunTracker,
    Strategy, StrategyParameters,
};
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::engine::{load_candles, Replay};
use crate::models::*;
use crate::synthetic::{shocked_spread, PathGenerator};

/// Equity curves kept on a result.
const MAX_STORED_CURVES: usize = 100;

/// Per-simulation statistics.
#[derive(Debug, Clone)]
pub(crate) struct SimulationOutcome {
    pub final_return: f64,
    pub max_drawdown: f64,
    pub step_returns: Vec<f64>,
    pub equity: Vec<f64>,
}

/// Everything needed to replay one strategy over synthetic paths.
pub(crate) struct PathBatch<'a> {
    pub strategy: &'a dyn Strategy,
    pub parameters: &'a StrategyParameters,
    pub execution: &'a ExecutionSettings,
    pub spread: f64,
    pub initial_capital: Decimal,
    pub generator: &'a PathGenerator,
    pub shock: Option<&'a MarketShock>,
}

impl PathBatch<'_> {
    /// Simulation `index` of a run seeded with `seed`. Independent of the
    /// order in which simulations execute.
    pub fn simulate(&self, seed: u64, index: usize) -> SimulationOutcome {
        let path = self.generator.generate(seed.wrapping_add(index as u64), self.shock);
        let replay = Replay::new(
            self.strategy,
            self.parameters,
            self.execution,
            self.spread,
            self.initial_capital,
        );
        let outcome = replay.run(&path);
        let equity = outcome.equity_values(self.initial_capital);
        let initial = self.initial_capital.to_f64().unwrap_or(0.0);
        let last = equity.last().copied().unwrap_or(initial);
        SimulationOutcome {
            final_return: if initial > 0.0 { (last - initial) / initial } else { 0.0 },
            max_drawdown: stats::max_drawdown_fraction(&equity),
            step_returns: stats::step_returns(&equity),
            equity,
        }
    }
}

/// Run `count` simulations on `pool`, collected in index order.
///
/// `on_done` fires after each simulation; `cancelled` is polled before each.
pub(crate) fn run_batch(
    pool: &ThreadPool,
    batch: &PathBatch<'_>,
    seed: u64,
    count: usize,
    cancelled: &(dyn Fn() -> bool + Sync),
    on_done: &(dyn Fn(usize) + Sync),
) -> Option<Vec<SimulationOutcome>> {
    let done = AtomicUsize::new(0);
    pool.install(|| {
        (0..count)
            .into_par_iter()
            .map(|i| {
                if cancelled() {
                    return None;
                }
                let outcome = batch.simulate(seed, i);
                on_done(done.fetch_add(1, Ordering::Relaxed) + 1);
                Some(outcome)
            })
            .collect::<Option<Vec<_>>>()
    })
}

/// Monte Carlo risk simulator: replays a strategy over bootstrapped
/// synthetic futures and aggregates the distribution of outcomes.
pub struct MonteCarloSimulator {
    provider: Arc<dyn MarketDataProvider>,
    pool: Arc<ThreadPool>,
    default_block_size: usize,
    tracker: RunTracker,
    history: Mutex<Vec<MonteCarloResult>>,
}

impl MonteCarloSimulator {
    pub fn new(provider: Arc<dyn MarketDataProvider>, pool: Arc<ThreadPool>, settings: &EngineSettings) -> Self {
        Self {
            provider,
            pool,
            default_block_size: settings.mc_block_size,
            tracker: RunTracker::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn run_simulation(&self, strategy: &dyn Strategy, config: &MonteCarloConfig) -> EngineResult<MonteCarloResult> {
        config.validate()?;
        let guard = self.tracker.begin("monte carlo")?;

        // 1. Base history ending at the anchor date
        let range = DateRange::trailing(config.as_of, config.time_horizon_days);
        let candles = load_candles(self.provider.as_ref(), strategy.symbol(), strategy.timeframe(), &range)?;
        let block_size = config.block_size.unwrap_or(self.default_block_size);
        let generator = PathGenerator::new(&candles, block_size)?;

        let parameters = config
            .parameters
            .clone()
            .unwrap_or_else(|| strategy.default_parameters());
        let spread = shocked_spread(
            self.provider.get_spread(strategy.symbol()),
            config.execution.use_spread,
            config.shock.as_ref(),
        );
        let seed = config.seed.unwrap_or_else(rand::random);
        info!(
            strategy = strategy.name(),
            simulations = config.num_simulations,
            steps = generator.steps(),
            block_size,
            seed,
            shock = config.shock.map(|s| s.name()),
            "starting monte carlo simulation"
        );

        // 2. Simulate on the pool
        let batch = PathBatch {
            strategy,
            parameters: &parameters,
            execution: &config.execution,
            spread,
            initial_capital: config.initial_capital,
            generator: &generator,
            shock: config.shock.as_ref(),
        };
        let n = config.num_simulations;
        let outcomes = run_batch(
            &self.pool,
            &batch,
            seed,
            n,
            &|| guard.is_cancelled(),
            &|done| guard.set_progress(done as f64 / n as f64 * 100.0),
        );
        guard.check_cancelled()?;
        let outcomes = outcomes.ok_or_else(|| EngineError::Cancelled("monte carlo".to_string()))?;

        // 3. Aggregate
        let mut result = aggregate(&outcomes, config);
        result.id = format!(
            "mc_{}_{}_{}",
            strategy.symbol(),
            config.as_of.to_rfc3339_opts(SecondsFormat::Millis, true),
            seed
        );
        result.strategy_name = strategy.name().to_string();
        result.symbol = strategy.symbol().to_string();
        result.seed = seed;
        result.shock = config.shock.map(|s| s.name().to_string());

        if result.risk_metrics.standard_deviation == 0.0 {
            warn!(strategy = strategy.name(), "simulated step returns have no variance");
        }
        info!(
            expected_return = result.expected_return,
            lower = result.confidence_interval.lower,
            upper = result.confidence_interval.upper,
            probability_of_profit = result.probability_of_profit,
            "monte carlo simulation complete"
        );

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        guard.complete();
        Ok(result)
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

    pub fn history(&self) -> Vec<MonteCarloResult> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Distribution statistics over completed simulations.
fn aggregate(outcomes: &[SimulationOutcome], config: &MonteCarloConfig) -> MonteCarloResult {
    let n = outcomes.len();
    let mut returns: Vec<f64> = outcomes.iter().map(|o| o.final_return).collect();
    stats::sort_ascending(&mut returns);
    let drawdowns: Vec<f64> = outcomes.iter().map(|o| o.max_drawdown).collect();

    // Empirical interval, narrowed so lower never passes upper
    let k = ((n as f64 * (1.0 - config.confidence_interval)).floor() as usize).min(n.saturating_sub(1) / 2);
    let (lower, upper) = if n > 0 {
        (returns[k], returns[n - 1 - k])
    } else {
        (0.0, 0.0)
    };

    let mut pooled: Vec<f64> = outcomes.iter().flat_map(|o| o.step_returns.iter().copied()).collect();
    let pooled_mean = stats::mean(&pooled);
    let pooled_std = stats::population_std_dev(&pooled);
    let days = config.trading_days_per_year;
    let sharpe_ratio = if pooled_std > 1e-12 {
        (pooled_mean * days - config.risk_free_rate) / (pooled_std * days.sqrt())
    } else {
        0.0
    };
    let skewness = stats::skewness(&pooled);
    let kurtosis = stats::excess_kurtosis(&pooled);
    stats::sort_ascending(&mut pooled);

    MonteCarloResult {
        id: String::new(),
        strategy_name: String::new(),
        symbol: String::new(),
        num_simulations: n,
        seed: 0,
        shock: None,
        expected_return: stats::mean(&returns),
        worst_case: returns.first().copied().unwrap_or(0.0),
        best_case: returns.last().copied().unwrap_or(0.0),
        confidence_interval: ConfidenceInterval {
            level: config.confidence_interval,
            lower,
            upper,
        },
        max_drawdown: DrawdownStats {
            mean: stats::mean(&drawdowns),
            worst: drawdowns.iter().copied().fold(0.0, f64::max),
            best: drawdowns.iter().copied().reduce(f64::min).unwrap_or(0.0),
        },
        sharpe_ratio,
        probability_of_profit: if n > 0 {
            returns.iter().filter(|r| **r > 0.0).count() as f64 / n as f64
        } else {
            0.0
        },
        risk_metrics: RiskMetrics {
            value_at_risk_95: stats::value_at_risk(&pooled, 0.95),
            conditional_var_95: stats::conditional_value_at_risk(&pooled, 0.95),
            standard_deviation: pooled_std,
            skewness,
            kurtosis,
        },
        return_distribution: returns,
        equity_curves: outcomes
            .iter()
            .take(MAX_STORED_CURVES)
            .map(|o| o.equity.clone())
            .collect(),
    }
}
