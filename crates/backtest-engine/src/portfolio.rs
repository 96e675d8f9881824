use std::sync::{Arc, Mutex};

use chrono::SecondsFormat;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use rayon::ThreadPool;
use strategy_core::{
    stats, Candle, EngineError, EngineResult, MarketDataProvider, ProgressHandle, RunTracker,
    Strategy,
};
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::engine::{load_candles, resolve_spread, Replay};
use crate::models::*;
use crate::monte_carlo::{run_batch, PathBatch};
use crate::synthetic::{shocked_spread, PathGenerator};

const FRONTIER_POINTS: usize = 50;
const SHARPE_ITERATIONS: usize = 1000;
const SHARPE_LEARNING_RATE: f64 = 0.01;
const MIN_VARIANCE_ITERATIONS: usize = 1000;
/// Weight of the squared target-return miss in the min-variance objective.
const TARGET_PENALTY: f64 = 100.0;
const RISK_PARITY_ITERATIONS: usize = 100;
const RISK_PARITY_TOLERANCE: f64 = 1e-6;

/// Inclusive per-strategy weight bounds.
#[derive(Debug, Clone, Copy)]
pub struct WeightBounds {
    pub min: f64,
    pub max: f64,
}

impl From<&PortfolioConstraints> for WeightBounds {
    fn from(c: &PortfolioConstraints) -> Self {
        Self {
            min: c.min_weight,
            max: c.max_weight,
        }
    }
}

/// Euclidean projection of `v` onto `{sum(w) = 1, min <= w_i <= max}`.
///
/// Solves `sum(clamp(v_i - tau, min, max)) = 1` for the shift `tau` by
/// bisection. Bounds must be feasible (`n * min <= 1 <= n * max`).
pub fn project_weights(v: &DVector<f64>, bounds: WeightBounds) -> DVector<f64> {
    let WeightBounds { min, max } = bounds;
    let shifted_sum = |tau: f64| v.iter().map(|x| (x - tau).clamp(min, max)).sum::<f64>();

    // shifted_sum(lo) = n * max >= 1, shifted_sum(hi) = n * min <= 1
    let mut lo = v.min() - max;
    let mut hi = v.max() - min;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if shifted_sum(mid) > 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= f64::EPSILON * hi.abs().max(1.0) {
            break;
        }
    }
    let tau = 0.5 * (lo + hi);
    v.map(|x| (x - tau).clamp(min, max))
}

fn equal_weights(n: usize, bounds: WeightBounds) -> DVector<f64> {
    project_weights(&DVector::from_element(n, 1.0 / n as f64), bounds)
}

/// Sample covariance (n-1) of equal-length return series, one per column.
pub fn covariance_matrix(series: &[Vec<f64>]) -> DMatrix<f64> {
    let n = series.len();
    let t = series.first().map(|s| s.len()).unwrap_or(0);
    if n == 0 || t < 2 {
        return DMatrix::zeros(n, n);
    }
    let means: Vec<f64> = series.iter().map(|s| stats::mean(s)).collect();
    let centered = DMatrix::from_fn(t, n, |row, col| series[col][row] - means[col]);
    let cov = centered.transpose() * &centered / (t - 1) as f64;
    // exact symmetry
    (&cov + cov.transpose()) * 0.5
}

/// Correlation from covariance; zero-variance rows get 1 on the diagonal and 0 elsewhere.
pub fn correlation_matrix(cov: &DMatrix<f64>) -> DMatrix<f64> {
    let n = cov.nrows();
    DMatrix::from_fn(n, n, |i, j| {
        let (si, sj) = (cov[(i, i)].max(0.0).sqrt(), cov[(j, j)].max(0.0).sqrt());
        if i == j {
            1.0
        } else if si < 1e-12 || sj < 1e-12 {
            0.0
        } else {
            (cov[(i, j)] / (si * sj)).clamp(-1.0, 1.0)
        }
    })
}

/// Weights plus convergence diagnostics.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub weights: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
}

fn portfolio_volatility(w: &DVector<f64>, cov: &DMatrix<f64>) -> f64 {
    (w.transpose() * cov * w)[(0, 0)].max(0.0).sqrt()
}

/// Projected gradient ascent on the Sharpe ratio.
pub fn max_sharpe(mu: &DVector<f64>, cov: &DMatrix<f64>, risk_free: f64, bounds: WeightBounds) -> SolverOutcome {
    let mut w = equal_weights(mu.len(), bounds);
    let mut delta = f64::INFINITY;
    for _ in 0..SHARPE_ITERATIONS {
        let sigma = portfolio_volatility(&w, cov);
        let gradient = if sigma < 1e-12 {
            mu.clone()
        } else {
            let excess = w.dot(mu) - risk_free;
            mu / sigma - (cov * &w) * (excess / sigma.powi(3))
        };
        let next = project_weights(&(&w + gradient * SHARPE_LEARNING_RATE), bounds);
        delta = (&next - &w).amax();
        w = next;
    }
    SolverOutcome {
        weights: w,
        converged: delta < 1e-8,
        iterations: SHARPE_ITERATIONS,
    }
}

/// Greedy: everyone gets `min`, the rest flows to the highest means up to `max`.
pub fn max_return(mu: &DVector<f64>, bounds: WeightBounds) -> SolverOutcome {
    let n = mu.len();
    let mut w = DVector::from_element(n, bounds.min);
    let mut budget = 1.0 - bounds.min * n as f64;
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| mu[b].partial_cmp(&mu[a]).unwrap_or(std::cmp::Ordering::Equal));
    for i in order {
        let add = (bounds.max - bounds.min).min(budget).max(0.0);
        w[i] += add;
        budget -= add;
    }
    SolverOutcome {
        weights: w,
        converged: true,
        iterations: 1,
    }
}

/// Projected gradient descent on `w'Sw`, optionally penalising a miss of `target`.
pub fn min_variance(mu: &DVector<f64>, cov: &DMatrix<f64>, target: Option<f64>, bounds: WeightBounds) -> SolverOutcome {
    let n = mu.len();
    let mut w = equal_weights(n, bounds);

    // 1 / Lipschitz bound of the gradient (Gershgorin on S plus the penalty term)
    let row_bound = (0..n)
        .map(|i| cov.row(i).iter().map(|x| x.abs()).sum::<f64>())
        .fold(0.0, f64::max);
    let penalty_bound = if target.is_some() { TARGET_PENALTY * mu.norm_squared() } else { 0.0 };
    let lipschitz = 2.0 * (row_bound + penalty_bound);
    if lipschitz < 1e-18 {
        return SolverOutcome {
            weights: w,
            converged: true,
            iterations: 0,
        };
    }
    let step = 1.0 / lipschitz;

    for iteration in 1..=MIN_VARIANCE_ITERATIONS {
        let mut gradient = (cov * &w) * 2.0;
        if let Some(t) = target {
            gradient += mu * (2.0 * TARGET_PENALTY * (w.dot(mu) - t));
        }
        let next = project_weights(&(&w - gradient * step), bounds);
        let delta = (&next - &w).amax();
        w = next;
        if delta < 1e-10 {
            return SolverOutcome {
                weights: w,
                converged: true,
                iterations: iteration,
            };
        }
    }
    SolverOutcome {
        weights: w,
        converged: false,
        iterations: MIN_VARIANCE_ITERATIONS,
    }
}

/// Fraction of portfolio variance contributed by each weight. Zeros when the
/// portfolio has no variance.
pub fn risk_contributions(w: &DVector<f64>, cov: &DMatrix<f64>) -> DVector<f64> {
    let marginal = cov * w;
    let variance = w.dot(&marginal);
    if variance < 1e-18 {
        return DVector::zeros(w.len());
    }
    w.component_mul(&marginal) / variance
}

/// Equal risk contributions via damped Newton on `Sy = b / y`.
pub fn risk_parity(cov: &DMatrix<f64>, bounds: WeightBounds) -> SolverOutcome {
    let n = cov.nrows();
    let budget = 1.0 / n as f64;
    if (0..n).any(|i| cov[(i, i)] < 1e-18) {
        warn!("risk parity undefined with a zero-variance strategy, using equal weights");
        return SolverOutcome {
            weights: equal_weights(n, bounds),
            converged: false,
            iterations: 0,
        };
    }

    // Inverse-volatility start, scaled so y'Sy = 1
    let mut y = DVector::from_fn(n, |i, _| 1.0 / cov[(i, i)].sqrt());
    let scale = (y.transpose() * cov * &y)[(0, 0)].sqrt();
    if scale > 0.0 {
        y /= scale;
    }

    let dispersion = |y: &DVector<f64>| {
        let w = y / y.sum();
        risk_contributions(&w, cov).iter().map(|rc| (rc - budget).abs()).fold(0.0, f64::max)
    };

    let mut iterations = 0;
    let mut converged = dispersion(&y) < RISK_PARITY_TOLERANCE;
    while !converged && iterations < RISK_PARITY_ITERATIONS {
        iterations += 1;
        let residual = cov * &y - y.map(|yi| budget / yi);
        let jacobian = cov + DMatrix::from_diagonal(&y.map(|yi| budget / (yi * yi)));
        let Some(newton) = jacobian.lu().solve(&residual) else {
            warn!(iterations, "risk parity jacobian is singular");
            break;
        };

        // Damp until every coordinate stays positive
        let mut alpha = 1.0;
        let mut candidate = &y - &newton * alpha;
        while candidate.iter().any(|v| *v <= 0.0) && alpha > 1e-12 {
            alpha *= 0.5;
            candidate = &y - &newton * alpha;
        }
        if candidate.iter().any(|v| *v <= 0.0) {
            break;
        }
        y = candidate;
        converged = dispersion(&y) < RISK_PARITY_TOLERANCE;
    }

    let raw = &y / y.sum();
    SolverOutcome {
        weights: project_weights(&raw, bounds),
        converged,
        iterations,
    }
}

/// Minimum-variance portfolios for evenly spaced return targets between the
/// lowest and highest strategy mean.
pub fn efficient_frontier(mu: &DVector<f64>, cov: &DMatrix<f64>, risk_free: f64, bounds: WeightBounds) -> Vec<FrontierPoint> {
    let (lo, hi) = (mu.min(), mu.max());
    (0..FRONTIER_POINTS)
        .map(|k| {
            let target = lo + (hi - lo) * k as f64 / (FRONTIER_POINTS - 1) as f64;
            let w = min_variance(mu, cov, Some(target), bounds).weights;
            let expected_return = w.dot(mu);
            let volatility = portfolio_volatility(&w, cov);
            FrontierPoint {
                expected_return,
                volatility,
                sharpe_ratio: sharpe(expected_return, volatility, risk_free),
                weights: w.iter().copied().collect(),
            }
        })
        .collect()
}

fn sharpe(expected_return: f64, volatility: f64, risk_free: f64) -> f64 {
    if volatility < 1e-12 {
        0.0
    } else {
        (expected_return - risk_free) / volatility
    }
}

/// Per-period returns of the weighted combination.
fn weighted_series(series: &[Vec<f64>], w: &DVector<f64>) -> Vec<f64> {
    let t = series.first().map(|s| s.len()).unwrap_or(0);
    (0..t)
        .map(|k| series.iter().zip(w.iter()).map(|(s, wi)| s[k] * wi).sum())
        .collect()
}

fn max_drawdown_pct(returns: &[f64]) -> f64 {
    let mut value = 1.0;
    let mut values = Vec::with_capacity(returns.len() + 1);
    values.push(value);
    for r in returns {
        value *= 1.0 + r;
        values.push(value);
    }
    let dd = stats::max_drawdown_fraction(&values);
    if dd > 0.0 {
        -dd * 100.0
    } else {
        0.0
    }
}

/// One strategy's replayed history.
struct StrategyHistory {
    candles: Vec<Candle>,
    returns: Vec<f64>,
    spread: f64,
}

/// Allocates capital across strategies from their backtested return streams.
pub struct PortfolioOptimizer {
    provider: Arc<dyn MarketDataProvider>,
    pool: Arc<ThreadPool>,
    periods_per_year: f64,
    stress_simulations: usize,
    block_size: usize,
    tracker: RunTracker,
    history: Mutex<Vec<PortfolioResult>>,
}

impl PortfolioOptimizer {
    pub fn new(provider: Arc<dyn MarketDataProvider>, pool: Arc<ThreadPool>, settings: &EngineSettings) -> Self {
        Self {
            provider,
            pool,
            periods_per_year: settings.periods_per_year,
            stress_simulations: settings.stress_simulations,
            block_size: settings.mc_block_size,
            tracker: RunTracker::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn optimize_portfolio(
        &self,
        strategies: &[Arc<dyn Strategy>],
        config: &PortfolioConfig,
    ) -> EngineResult<PortfolioResult> {
        if strategies.is_empty() {
            return Err(EngineError::Configuration("at least one strategy is required".to_string()));
        }
        config.constraints.validate(strategies.len())?;
        config.range.validate()?;
        validate_balance(config.initial_balance)?;
        config.execution.validate()?;
        let periods_per_year = config.periods_per_year.unwrap_or(self.periods_per_year);
        if !(periods_per_year > 0.0) {
            return Err(EngineError::Configuration("periods_per_year must be positive".to_string()));
        }
        let guard = self.tracker.begin("portfolio optimization")?;
        let bounds = WeightBounds::from(&config.constraints);
        info!(
            strategies = strategies.len(),
            target = ?config.target,
            "starting portfolio optimization"
        );

        // 1. Backtest every strategy
        let histories: Vec<StrategyHistory> = self.pool.install(|| {
            strategies
                .par_iter()
                .map(|s| self.replay_history(s.as_ref(), config))
                .collect::<EngineResult<Vec<_>>>()
        })?;
        guard.set_progress(40.0);
        guard.check_cancelled()?;

        // 2. Align return series
        let common = histories.iter().map(|h| h.returns.len()).min().unwrap_or(0);
        if common < 2 {
            return Err(EngineError::Data(format!(
                "portfolio needs at least two common returns, got {common}"
            )));
        }
        let series: Vec<Vec<f64>> = histories.iter().map(|h| h.returns[..common].to_vec()).collect();

        // 3. Annualised estimates
        let mu = DVector::from_iterator(series.len(), series.iter().map(|s| stats::mean(s) * periods_per_year));
        let cov = covariance_matrix(&series) * periods_per_year;
        let correlation = correlation_matrix(&cov);
        let rf = config.risk_free_rate;

        // 4. Solve
        let solved = match config.target {
            PortfolioTarget::Sharpe => max_sharpe(&mu, &cov, rf, bounds),
            PortfolioTarget::Return => max_return(&mu, bounds),
            PortfolioTarget::RiskParity => risk_parity(&cov, bounds),
            PortfolioTarget::MinVariance => min_variance(&mu, &cov, config.constraints.target_return, bounds),
        };
        if !solved.converged {
            warn!(
                target = ?config.target,
                iterations = solved.iterations,
                "portfolio solver stopped before converging"
            );
        }
        let w = solved.weights.clone();
        let frontier = efficient_frontier(&mu, &cov, rf, bounds);
        guard.set_progress(60.0);
        guard.check_cancelled()?;

        // 5. Metrics and decomposition
        let volatility = portfolio_volatility(&w, &cov);
        let expected_return = w.dot(&mu);
        let contributions = risk_contributions(&w, &cov);
        let weighted = weighted_series(&series, &w);
        let risks: Vec<f64> = (0..w.len()).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
        let metrics = PortfolioMetrics {
            expected_return,
            volatility,
            sharpe_ratio: sharpe(expected_return, volatility, rf),
            max_drawdown: max_drawdown_pct(&weighted),
            diversification_ratio: if volatility < 1e-12 {
                1.0
            } else {
                w.iter().zip(&risks).map(|(wi, si)| wi * si).sum::<f64>() / volatility
            },
            risk_parity_dispersion: stats::population_std_dev(contributions.as_slice()),
        };

        let portfolio_variance = stats::sample_covariance(&weighted, &weighted);
        let risk_decomposition = strategies
            .iter()
            .zip(&series)
            .zip(&risks)
            .map(|((s, r), &total_sigma)| {
                let beta = if portfolio_variance < 1e-18 {
                    0.0
                } else {
                    stats::sample_covariance(r, &weighted) / portfolio_variance
                };
                let systematic = beta * volatility;
                let specific = (total_sigma.powi(2) - systematic.powi(2)).max(0.0).sqrt();
                RiskDecomposition {
                    strategy_name: s.name().to_string(),
                    beta,
                    systematic_risk: systematic,
                    specific_risk: specific,
                    total_risk: (systematic.powi(2) + specific.powi(2)).sqrt(),
                }
            })
            .collect();

        let allocations = strategies
            .iter()
            .enumerate()
            .map(|(i, s)| StrategyAllocation {
                strategy_name: s.name().to_string(),
                symbol: s.symbol().to_string(),
                weight: w[i],
                expected_return: mu[i],
                risk: risks[i],
                sharpe_ratio: sharpe(mu[i], risks[i], rf),
                return_contribution: w[i] * mu[i],
                risk_contribution: contributions[i],
            })
            .collect();

        // 6. Stress scenarios
        let stress_tests = self.stress_test(
            strategies,
            &histories,
            &w,
            config,
            &|| guard.is_cancelled(),
            &|fraction| guard.set_progress(60.0 + 40.0 * fraction),
        )?;
        guard.check_cancelled()?;

        let result = PortfolioResult {
            id: format!(
                "portfolio_{}_{}",
                strategies.iter().map(|s| s.symbol()).collect::<Vec<_>>().join("+"),
                config.range.start.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            target: config.target,
            weights: w.iter().copied().collect(),
            allocations,
            constraint_violations: constraint_violations(&config.constraints, &metrics),
            metrics,
            covariance: to_rows(&cov),
            correlation: to_rows(&correlation),
            efficient_frontier: frontier,
            risk_decomposition,
            stress_tests,
            converged: solved.converged,
            iterations: solved.iterations,
        };
        info!(
            expected_return = result.metrics.expected_return,
            volatility = result.metrics.volatility,
            sharpe = result.metrics.sharpe_ratio,
            violations = result.constraint_violations.len(),
            "portfolio optimization complete"
        );

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        guard.complete();
        Ok(result)
    }

    fn replay_history(&self, strategy: &dyn Strategy, config: &PortfolioConfig) -> EngineResult<StrategyHistory> {
        let candles = load_candles(self.provider.as_ref(), strategy.symbol(), strategy.timeframe(), &config.range)?;
        let spread = resolve_spread(self.provider.as_ref(), strategy.symbol(), &config.execution);
        let parameters = strategy.default_parameters();
        let outcome = Replay::new(strategy, &parameters, &config.execution, spread, config.initial_balance).run(&candles);
        let returns = stats::step_returns(&outcome.equity_values(config.initial_balance));
        Ok(StrategyHistory {
            candles,
            returns,
            spread: self.provider.get_spread(strategy.symbol()),
        })
    }

    /// Shocked Monte Carlo paths per strategy with shared seeds, combined
    /// simulation by simulation with the portfolio weights.
    fn stress_test(
        &self,
        strategies: &[Arc<dyn Strategy>],
        histories: &[StrategyHistory],
        w: &DVector<f64>,
        config: &PortfolioConfig,
        cancelled: &(dyn Fn() -> bool + Sync),
        on_progress: &dyn Fn(f64),
    ) -> EngineResult<Vec<StressTestResult>> {
        let simulations = config.stress_simulations.unwrap_or(self.stress_simulations).max(1);
        let seed = config.seed.unwrap_or_else(rand::random);
        let generators = histories
            .iter()
            .map(|h| PathGenerator::new(&h.candles, self.block_size))
            .collect::<EngineResult<Vec<_>>>()?;

        let scenarios = default_stress_scenarios();
        let total = (scenarios.len() * strategies.len()) as f64;
        let mut finished = 0usize;
        let mut results = Vec::new();
        for scenario in scenarios {
            let mut combined = vec![0.0; simulations];
            for (i, strategy) in strategies.iter().enumerate() {
                let parameters = strategy.default_parameters();
                let batch = PathBatch {
                    strategy: strategy.as_ref(),
                    parameters: &parameters,
                    execution: &config.execution,
                    spread: shocked_spread(histories[i].spread, config.execution.use_spread, Some(&scenario.shock)),
                    initial_capital: config.initial_balance,
                    generator: &generators[i],
                    shock: Some(&scenario.shock),
                };
                let outcomes = run_batch(&self.pool, &batch, seed, simulations, cancelled, &|_| {})
                    .ok_or_else(|| EngineError::Cancelled("portfolio optimization".to_string()))?;
                for (slot, outcome) in combined.iter_mut().zip(&outcomes) {
                    *slot += w[i] * outcome.final_return;
                }
                finished += 1;
                on_progress(finished as f64 / total);
            }
            results.push(StressTestResult {
                scenario: scenario.name,
                shock: scenario.shock,
                impact: combined.iter().copied().fold(f64::INFINITY, f64::min),
                mean_return: stats::mean(&combined),
            });
        }
        Ok(results)
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

    pub fn history(&self) -> Vec<PortfolioResult> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn to_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

fn constraint_violations(constraints: &PortfolioConstraints, metrics: &PortfolioMetrics) -> Vec<String> {
    let mut notes = Vec::new();
    if let Some(target) = constraints.target_return {
        if metrics.expected_return < target - 1e-9 {
            notes.push(format!(
                "expected return {:.4} is below the target {:.4}",
                metrics.expected_return, target
            ));
        }
    }
    if let Some(limit) = constraints.max_drawdown {
        if metrics.max_drawdown < limit {
            notes.push(format!(
                "max drawdown {:.2}% exceeds the limit {:.2}%",
                metrics.max_drawdown, limit
            ));
        }
    }
    if let Some(floor) = constraints.min_sharpe {
        if metrics.sharpe_ratio < floor {
            notes.push(format!(
                "sharpe ratio {:.3} is below the minimum {:.3}",
                metrics.sharpe_ratio, floor
            ));
        }
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: WeightBounds = WeightBounds { min: 0.0, max: 1.0 };

    fn assert_valid(w: &DVector<f64>, bounds: WeightBounds) {
        assert!((w.sum() - 1.0).abs() < 1e-9, "sum {}", w.sum());
        for x in w.iter() {
            assert!(*x >= bounds.min - 1e-12 && *x <= bounds.max + 1e-12, "weight {x}");
        }
    }

    fn sample_cov() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[0.04, 0.006, 0.002, 0.006, 0.09, 0.009, 0.002, 0.009, 0.01])
    }

    #[test]
    fn test_projection_satisfies_bounds() {
        let bounds = WeightBounds { min: 0.1, max: 0.5 };
        for raw in [
            vec![3.0, -1.0, 0.2, 0.0],
            vec![0.25, 0.25, 0.25, 0.25],
            vec![100.0, 0.0, 0.0, 0.0],
            vec![-5.0, -5.0, -5.0, -4.0],
        ] {
            let w = project_weights(&DVector::from_vec(raw), bounds);
            assert_valid(&w, bounds);
        }
    }

    #[test]
    fn test_projection_keeps_feasible_points() {
        let v = DVector::from_vec(vec![0.2, 0.3, 0.5]);
        let w = project_weights(&v, OPEN);
        assert!((&w - &v).amax() < 1e-12);
    }

    #[test]
    fn test_covariance_and_correlation() {
        let a = vec![0.01, -0.02, 0.03, 0.0];
        let b: Vec<f64> = a.iter().map(|x| x * 2.0).collect();
        let flat = vec![0.0; 4];
        let cov = covariance_matrix(&[a.clone(), b, flat]);
        assert!((cov[(0, 0)] - stats::sample_covariance(&a, &a)).abs() < 1e-15);
        assert_eq!(cov[(0, 1)], cov[(1, 0)]);
        let corr = correlation_matrix(&cov);
        assert!((corr[(0, 1)] - 1.0).abs() < 1e-12);
        assert_eq!(corr[(2, 2)], 1.0);
        assert_eq!(corr[(0, 2)], 0.0);
    }

    #[test]
    fn test_every_solver_returns_feasible_weights() {
        let mu = DVector::from_vec(vec![0.08, 0.12, 0.05]);
        let cov = sample_cov();
        let bounds = WeightBounds { min: 0.05, max: 0.6 };
        assert_valid(&max_sharpe(&mu, &cov, 0.02, bounds).weights, bounds);
        assert_valid(&max_return(&mu, bounds).weights, bounds);
        assert_valid(&min_variance(&mu, &cov, None, bounds).weights, bounds);
        assert_valid(&min_variance(&mu, &cov, Some(0.1), bounds).weights, bounds);
        assert_valid(&risk_parity(&cov, bounds).weights, bounds);
    }

    #[test]
    fn test_max_return_is_greedy() {
        let mu = DVector::from_vec(vec![0.08, 0.12, 0.05]);
        let w = max_return(&mu, WeightBounds { min: 0.1, max: 0.6 }).weights;
        assert!((w[1] - 0.6).abs() < 1e-12);
        assert!((w[0] - 0.3).abs() < 1e-12);
        assert!((w[2] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_min_variance_prefers_low_risk() {
        let mu = DVector::from_vec(vec![0.08, 0.12, 0.05]);
        let solved = min_variance(&mu, &sample_cov(), None, OPEN);
        assert!(solved.converged);
        // the 1% variance asset dominates
        assert!(solved.weights[2] > solved.weights[0]);
        assert!(solved.weights[2] > solved.weights[1]);
    }

    #[test]
    fn test_risk_parity_equalises_contributions() {
        let solved = risk_parity(&sample_cov(), OPEN);
        assert!(solved.converged);
        let rc = risk_contributions(&solved.weights, &sample_cov());
        for c in rc.iter() {
            assert!((c - 1.0 / 3.0).abs() < 1e-5, "contribution {c}");
        }
    }

    #[test]
    fn test_risk_parity_identical_assets_split_evenly() {
        let cov = DMatrix::from_element(2, 2, 0.04);
        let solved = risk_parity(&cov, OPEN);
        assert!((solved.weights[0] - 0.5).abs() < 1e-9);
        assert!((solved.weights[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_frontier_spans_strategy_means() {
        let mu = DVector::from_vec(vec![0.08, 0.12, 0.05]);
        let frontier = efficient_frontier(&mu, &sample_cov(), 0.02, OPEN);
        assert_eq!(frontier.len(), FRONTIER_POINTS);
        for point in &frontier {
            assert!((point.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            assert!(point.volatility >= 0.0);
        }
    }

    #[test]
    fn test_constraint_violations_are_reported() {
        let constraints = PortfolioConstraints {
            target_return: Some(0.2),
            max_drawdown: Some(-5.0),
            min_sharpe: Some(1.0),
            ..PortfolioConstraints::default()
        };
        let metrics = PortfolioMetrics {
            expected_return: 0.1,
            max_drawdown: -10.0,
            sharpe_ratio: 0.5,
            ..PortfolioMetrics::default()
        };
        assert_eq!(constraint_violations(&constraints, &metrics).len(), 3);
        assert!(constraint_violations(&PortfolioConstraints::default(), &metrics).is_empty());
    }

    #[test]
    fn test_infeasible_bounds_rejected() {
        let tight = PortfolioConstraints {
            min_weight: 0.4,
            ..PortfolioConstraints::default()
        };
        assert!(matches!(tight.validate(3), Err(EngineError::Configuration(_))));
        let narrow = PortfolioConstraints {
            max_weight: 0.3,
            ..PortfolioConstraints::default()
        };
        assert!(matches!(narrow.validate(3), Err(EngineError::Configuration(_))));
        assert!(narrow.validate(4).is_ok());
    }
}
