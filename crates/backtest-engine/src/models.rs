use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strategy_core::{
    DateRange, EngineError, EngineResult, Position, Strategy, StrategyParameters, Trade,
};

/// Friction and sizing model shared by every replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub commission_rate: f64, // as decimal, e.g. 0.001 = 0.1% of entry notional
    pub slippage_rate: f64,   // as decimal, applied against the trader on every fill
    pub use_spread: bool,     // add the provider spread to buy-side fills
    /// Default fraction of balance at risk per entry when the signal carries none.
    pub risk_fraction: f64,
    /// Position notional is capped at `balance * max_leverage`.
    pub max_leverage: f64,
    /// Close positions intrabar when a stop-loss or take-profit is touched.
    pub enforce_stops: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            commission_rate: 0.0,
            slippage_rate: 0.0,
            use_spread: false,
            risk_fraction: 0.01,
            max_leverage: 10.0,
            enforce_stops: true,
        }
    }
}

impl ExecutionSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.commission_rate >= 0.0) || !(self.slippage_rate >= 0.0) {
            return Err(EngineError::Configuration(format!(
                "commission ({}) and slippage ({}) must be non-negative",
                self.commission_rate, self.slippage_rate
            )));
        }
        if !(self.risk_fraction > 0.0 && self.risk_fraction <= 1.0) {
            return Err(EngineError::Configuration(format!(
                "risk fraction must be in (0, 1], got {}",
                self.risk_fraction
            )));
        }
        if !(self.max_leverage > 0.0) {
            return Err(EngineError::Configuration(format!(
                "max leverage must be positive, got {}",
                self.max_leverage
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_balance(balance: Decimal) -> EngineResult<()> {
    if balance <= Decimal::ZERO {
        return Err(EngineError::Configuration(format!(
            "initial balance must be positive, got {balance}"
        )));
    }
    Ok(())
}

// --- Backtest ---

/// Configuration for a single backtest run.
#[derive(Clone)]
pub struct BacktestConfig {
    pub strategy: Arc<dyn Strategy>,
    pub parameters: StrategyParameters,
    pub symbol: String,
    pub timeframe: String,
    pub range: DateRange,
    pub initial_balance: Decimal,
    pub execution: ExecutionSettings,
}

impl BacktestConfig {
    /// Config using the strategy's own symbol, timeframe and default parameters.
    pub fn new(strategy: Arc<dyn Strategy>, range: DateRange, initial_balance: Decimal) -> Self {
        Self {
            parameters: strategy.default_parameters(),
            symbol: strategy.symbol().to_string(),
            timeframe: strategy.timeframe().to_string(),
            strategy,
            range,
            initial_balance,
            execution: ExecutionSettings::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: StrategyParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionSettings) -> Self {
        self.execution = execution;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Configuration("symbol is required".to_string()));
        }
        if self.timeframe.trim().is_empty() {
            return Err(EngineError::Configuration("timeframe is required".to_string()));
        }
        self.range.validate()?;
        validate_balance(self.initial_balance)?;
        self.execution.validate()
    }
}

impl fmt::Debug for BacktestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BacktestConfig")
            .field("strategy", &self.strategy.name())
            .field("parameters", &self.parameters)
            .field("symbol", &self.symbol)
            .field("timeframe", &self.timeframe)
            .field("range", &self.range)
            .field("initial_balance", &self.initial_balance)
            .field("execution", &self.execution)
            .finish()
    }
}

/// A point on the equity curve, one per replayed candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub balance: Decimal,
    pub drawdown: f64, // percent below the running equity peak, >= 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub timestamp: DateTime<Utc>,
    pub drawdown: f64,
    /// Consecutive candles spent below the peak, including this one.
    pub duration: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReturn {
    pub year: i32,
    pub month: u32,
    pub return_pct: f64,
}

/// Derived performance snapshot. Every field is finite.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_pnl: Decimal,
    pub total_return_pct: f64,
    pub total_commission: Decimal,
    pub win_rate: f64, // 0-1 fraction
    pub average_win: f64,
    pub average_loss: f64, // magnitude
    /// Gross wins / gross losses. 0 when there are no losing trades.
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
    /// Deepest drawdown as a non-positive percentage (-12.5 = 12.5% below peak).
    pub max_drawdown: f64,
    pub risk_reward_ratio: f64,
    pub trades_per_day: f64,
}

/// Result of a completed backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub timeframe: String,
    pub parameters: StrategyParameters,
    pub range: DateRange,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub final_equity: Decimal,
    pub trades: Vec<Trade>,
    /// Every position opened during the run, in opening order.
    pub positions: Vec<Position>,
    /// Position still open when the data ran out.
    pub open_position: Option<Position>,
    pub metrics: PerformanceMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub drawdown_curve: Vec<DrawdownPoint>,
    pub monthly_returns: Vec<MonthlyReturn>,
}

// --- Monte Carlo ---

/// Named distortion applied to synthetic paths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MarketShock {
    /// Total drift added over the path, e.g. -0.2 = a 20% decline.
    ReturnShift(f64),
    VolatilityMultiplier(f64),
    /// Target pairwise correlation with a shared market factor.
    CorrelationOverride(f64),
    SpreadMultiplier(f64),
}

impl MarketShock {
    pub fn name(&self) -> &'static str {
        match self {
            MarketShock::ReturnShift(_) => "return_shift",
            MarketShock::VolatilityMultiplier(_) => "volatility_multiplier",
            MarketShock::CorrelationOverride(_) => "correlation_override",
            MarketShock::SpreadMultiplier(_) => "spread_multiplier",
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let ok = match *self {
            MarketShock::ReturnShift(v) => v.is_finite() && v > -1.0,
            MarketShock::VolatilityMultiplier(v) | MarketShock::SpreadMultiplier(v) => {
                v.is_finite() && v >= 0.0
            }
            MarketShock::CorrelationOverride(v) => (0.0..=1.0).contains(&v),
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::Configuration(format!("invalid shock {self:?}")))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    pub shock: MarketShock,
}

/// The four standard portfolio stress scenarios.
pub fn default_stress_scenarios() -> Vec<StressScenario> {
    vec![
        StressScenario {
            name: "Market Crash".to_string(),
            shock: MarketShock::ReturnShift(-0.2),
        },
        StressScenario {
            name: "High Volatility".to_string(),
            shock: MarketShock::VolatilityMultiplier(2.0),
        },
        StressScenario {
            name: "Correlation Breakdown".to_string(),
            shock: MarketShock::CorrelationOverride(0.5),
        },
        StressScenario {
            name: "Liquidity Crisis".to_string(),
            shock: MarketShock::SpreadMultiplier(3.0),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    pub initial_capital: Decimal,
    pub num_simulations: usize,
    pub time_horizon_days: i64,
    pub confidence_interval: f64, // e.g. 0.95
    pub risk_free_rate: f64,      // annual
    pub trading_days_per_year: f64,
    /// End of the base history window.
    pub as_of: DateTime<Utc>,
    /// Strategy defaults when absent.
    #[serde(default)]
    pub parameters: Option<StrategyParameters>,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub shock: Option<MarketShock>,
    /// Engine default when absent.
    #[serde(default)]
    pub block_size: Option<usize>,
    /// Random when absent; the seed used is reported in the result.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl MonteCarloConfig {
    pub fn new(initial_capital: Decimal, as_of: DateTime<Utc>) -> Self {
        Self {
            initial_capital,
            num_simulations: 1000,
            time_horizon_days: 252,
            confidence_interval: 0.95,
            risk_free_rate: 0.02,
            trading_days_per_year: 252.0,
            as_of,
            parameters: None,
            execution: ExecutionSettings::default(),
            shock: None,
            block_size: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.num_simulations == 0 {
            return Err(EngineError::Configuration(
                "num_simulations must be at least 1".to_string(),
            ));
        }
        if self.time_horizon_days < 1 {
            return Err(EngineError::Configuration(
                "time_horizon_days must be at least 1".to_string(),
            ));
        }
        if !(self.confidence_interval > 0.0 && self.confidence_interval < 1.0) {
            return Err(EngineError::Configuration(format!(
                "confidence_interval must be in (0, 1), got {}",
                self.confidence_interval
            )));
        }
        if !(self.trading_days_per_year > 0.0) {
            return Err(EngineError::Configuration(
                "trading_days_per_year must be positive".to_string(),
            ));
        }
        if self.block_size == Some(0) {
            return Err(EngineError::Configuration("block_size must be at least 1".to_string()));
        }
        if let Some(shock) = &self.shock {
            shock.validate()?;
        }
        validate_balance(self.initial_capital)?;
        self.execution.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub level: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Max drawdown across simulations, as positive fractions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DrawdownStats {
    pub mean: f64,
    pub worst: f64,
    pub best: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub value_at_risk_95: f64,
    pub conditional_var_95: f64,
    pub standard_deviation: f64,
    pub skewness: f64,
    pub kurtosis: f64, // excess
}

/// Aggregated outcome of a Monte Carlo run. Returns are fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub num_simulations: usize,
    pub seed: u64,
    pub shock: Option<String>,
    pub expected_return: f64,
    pub worst_case: f64,
    pub best_case: f64,
    pub confidence_interval: ConfidenceInterval,
    pub max_drawdown: DrawdownStats,
    pub sharpe_ratio: f64,
    pub probability_of_profit: f64,
    pub risk_metrics: RiskMetrics,
    /// Final returns, ascending.
    pub return_distribution: Vec<f64>,
    /// Equity paths of the first simulations (at most 100).
    pub equity_curves: Vec<Vec<f64>>,
}

// --- Genetic optimisation ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParameterRange {
    pub fn new(name: &str, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
            step,
        }
    }

    /// Highest grid index; the grid is `min + k * step` for `k` in `0..=steps()`.
    pub fn steps(&self) -> usize {
        ((self.max - self.min) / self.step + 1e-9).floor().max(0.0) as usize
    }

    pub fn value_at(&self, k: usize) -> f64 {
        self.min + k as f64 * self.step
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Configuration("parameter range needs a name".to_string()));
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.step.is_finite()) {
            return Err(EngineError::Configuration(format!(
                "parameter range {} must be finite",
                self.name
            )));
        }
        if self.step <= 0.0 || self.max < self.min {
            return Err(EngineError::Configuration(format!(
                "parameter range {} needs step > 0 and max >= min",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationTarget {
    TotalReturn,
    SharpeRatio,
    ProfitFactor,
    RiskAdjustedReturn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneticSettings {
    pub population_size: usize,
    pub generations: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
}

impl Default for GeneticSettings {
    fn default() -> Self {
        Self {
            population_size: 50,
            generations: 10,
            crossover_rate: 0.8,
            mutation_rate: 0.1,
        }
    }
}

impl GeneticSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if self.population_size < 2 {
            return Err(EngineError::Configuration(
                "population_size must be at least 2".to_string(),
            ));
        }
        if self.generations == 0 {
            return Err(EngineError::Configuration("generations must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.crossover_rate) || !(0.0..=1.0).contains(&self.mutation_rate)
        {
            return Err(EngineError::Configuration(
                "crossover_rate and mutation_rate must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub parameter_ranges: Vec<ParameterRange>,
    pub target: OptimizationTarget,
    #[serde(default)]
    pub genetic: GeneticSettings,
    pub range: DateRange,
    pub initial_balance: Decimal,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl OptimizationConfig {
    pub fn validate(&self) -> EngineResult<()> {
        validate_search(&self.parameter_ranges, &self.genetic)?;
        self.range.validate()?;
        validate_balance(self.initial_balance)?;
        self.execution.validate()
    }
}

pub(crate) fn validate_search(ranges: &[ParameterRange], genetic: &GeneticSettings) -> EngineResult<()> {
    if ranges.is_empty() {
        return Err(EngineError::Configuration(
            "at least one parameter range is required".to_string(),
        ));
    }
    for range in ranges {
        range.validate()?;
    }
    genetic.validate()
}

/// One evaluated parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub parameters: StrategyParameters,
    pub fitness: f64,
    pub metrics: PerformanceMetrics,
    /// Generation in which this parameter set was first evaluated.
    pub generation: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub id: String,
    pub strategy_name: String,
    pub target: OptimizationTarget,
    pub best: OptimizationResult,
    /// Full replay of the best parameters.
    pub best_backtest: BacktestResult,
    /// Every distinct individual evaluated, best first.
    pub evaluated: Vec<OptimizationResult>,
    pub generations_completed: usize,
    pub seed: u64,
}

// --- Walk-forward ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub range: DateRange,
    pub in_sample_days: i64,
    pub out_sample_days: i64,
    /// Window overlap in percent, 0 <= x < 100.
    pub overlap_pct: f64,
    pub initial_balance: Decimal,
    pub target: OptimizationTarget,
    pub parameter_ranges: Vec<ParameterRange>,
    #[serde(default)]
    pub genetic: GeneticSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl WalkForwardConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.in_sample_days < 1 || self.out_sample_days < 1 {
            return Err(EngineError::Configuration(format!(
                "in-sample ({}) and out-of-sample ({}) windows must be at least one day",
                self.in_sample_days, self.out_sample_days
            )));
        }
        if !(self.overlap_pct >= 0.0 && self.overlap_pct < 100.0) {
            return Err(EngineError::Configuration(format!(
                "overlap must be in [0, 100), got {}",
                self.overlap_pct
            )));
        }
        validate_search(&self.parameter_ranges, &self.genetic)?;
        self.range.validate()?;
        validate_balance(self.initial_balance)?;
        self.execution.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardPeriod {
    pub window: usize,
    pub in_sample: DateRange,
    pub out_of_sample: DateRange,
    pub parameters: StrategyParameters,
    pub in_sample_return: f64, // percent
    pub out_of_sample_return: f64,
    pub in_sample_metrics: PerformanceMetrics,
    pub out_of_sample_metrics: PerformanceMetrics,
    /// out-of-sample / in-sample return; 0 when the in-sample return is not positive.
    pub robustness: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WalkForwardSummary {
    /// Out-of-sample returns compounded across windows, percent.
    pub total_return: f64,
    pub average_sharpe: f64,
    pub worst_drawdown: f64,
    pub average_win_rate: f64,
    pub average_profit_factor: f64,
    pub average_robustness: f64,
    /// Fraction of windows with robustness >= 0.7.
    pub optimization_efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStability {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
    /// Coefficient of variation; undefined when the mean is zero.
    pub stability_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub periods: Vec<WalkForwardPeriod>,
    pub summary: WalkForwardSummary,
    /// Pearson correlation of in-sample vs out-of-sample returns.
    pub predictive_power: f64,
    pub parameter_stability: Vec<ParameterStability>,
    pub seed: u64,
}

// --- Portfolio ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortfolioTarget {
    Sharpe,
    Return,
    RiskParity,
    MinVariance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioConstraints {
    pub min_weight: f64,
    pub max_weight: f64,
    /// Annualised.
    #[serde(default)]
    pub target_return: Option<f64>,
    /// Non-positive percentage floor, e.g. -20.0.
    #[serde(default)]
    pub max_drawdown: Option<f64>,
    #[serde(default)]
    pub min_sharpe: Option<f64>,
}

impl Default for PortfolioConstraints {
    fn default() -> Self {
        Self {
            min_weight: 0.0,
            max_weight: 1.0,
            target_return: None,
            max_drawdown: None,
            min_sharpe: None,
        }
    }
}

impl PortfolioConstraints {
    /// Rejects bounds under which no weight vector can sum to one.
    pub fn validate(&self, n: usize) -> EngineResult<()> {
        let (lo, hi) = (self.min_weight, self.max_weight);
        if !(lo.is_finite() && hi.is_finite()) || lo < 0.0 || hi > 1.0 || lo > hi {
            return Err(EngineError::Configuration(format!(
                "weight bounds [{lo}, {hi}] must satisfy 0 <= min <= max <= 1"
            )));
        }
        let n = n as f64;
        if n * lo > 1.0 + 1e-12 || n * hi < 1.0 - 1e-12 {
            return Err(EngineError::Configuration(format!(
                "weight bounds [{lo}, {hi}] are infeasible for {n} strategies"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioConfig {
    pub range: DateRange,
    pub initial_balance: Decimal,
    pub risk_free_rate: f64, // annual
    #[serde(default)]
    pub constraints: PortfolioConstraints,
    pub target: PortfolioTarget,
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Engine default when absent.
    #[serde(default)]
    pub periods_per_year: Option<f64>,
    #[serde(default)]
    pub stress_simulations: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl PortfolioConfig {
    pub fn new(range: DateRange, initial_balance: Decimal, target: PortfolioTarget) -> Self {
        Self {
            range,
            initial_balance,
            risk_free_rate: 0.02,
            constraints: PortfolioConstraints::default(),
            target,
            execution: ExecutionSettings::default(),
            periods_per_year: None,
            stress_simulations: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAllocation {
    pub strategy_name: String,
    pub symbol: String,
    pub weight: f64,
    pub expected_return: f64,
    pub risk: f64,
    pub sharpe_ratio: f64,
    pub return_contribution: f64,
    /// Share of portfolio variance, sums to 1 across allocations.
    pub risk_contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64, // non-positive percent
    pub diversification_ratio: f64,
    pub risk_parity_dispersion: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecomposition {
    pub strategy_name: String,
    pub beta: f64,
    pub systematic_risk: f64,
    pub specific_risk: f64,
    pub total_risk: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestResult {
    pub scenario: String,
    pub shock: MarketShock,
    /// Worst weighted final return across the stress paths.
    pub impact: f64,
    pub mean_return: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioResult {
    pub id: String,
    pub target: PortfolioTarget,
    pub weights: Vec<f64>,
    pub allocations: Vec<StrategyAllocation>,
    pub metrics: PortfolioMetrics,
    pub covariance: Vec<Vec<f64>>,
    pub correlation: Vec<Vec<f64>>,
    pub efficient_frontier: Vec<FrontierPoint>,
    pub risk_decomposition: Vec<RiskDecomposition>,
    pub stress_tests: Vec<StressTestResult>,
    pub converged: bool,
    pub iterations: usize,
    /// Constraints the final portfolio misses.
    pub constraint_violations: Vec<String>,
}
