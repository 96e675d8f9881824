use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;
use rust_decimal::prelude::*;
use strategy_core::{
    parameter_signature, Candle, EngineError, EngineResult, MarketDataProvider, ProgressHandle,
    RunTracker, Strategy, StrategyParameters,
};
use tracing::{debug, info};

use crate::engine::{build_result, load_candles, resolve_spread, result_id, Replay};
use crate::metrics::calculate_metrics;
use crate::models::*;

/// Fraction of each generation carried over unchanged.
const ELITE_FRACTION: f64 = 0.1;
const TOURNAMENT_SIZE: usize = 3;
/// Drawdowns below this score 0 under `RiskAdjustedReturn`.
const DRAWDOWN_EPSILON: f64 = 1e-12;

/// Grid indices, one per parameter range.
type Genome = Vec<usize>;

/// Score a metrics snapshot under `target`. Non-finite scores count as 0.
pub fn fitness(metrics: &PerformanceMetrics, target: OptimizationTarget) -> f64 {
    let score = match target {
        OptimizationTarget::TotalReturn => metrics.total_pnl.to_f64().unwrap_or(0.0),
        OptimizationTarget::SharpeRatio => metrics.sharpe_ratio,
        OptimizationTarget::ProfitFactor => metrics.profit_factor,
        OptimizationTarget::RiskAdjustedReturn => {
            let drawdown = metrics.max_drawdown.abs();
            if drawdown < DRAWDOWN_EPSILON {
                0.0
            } else {
                metrics.total_pnl.to_f64().unwrap_or(0.0) * metrics.win_rate / drawdown
            }
        }
    };
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Result of one evolutionary search.
pub(crate) struct SearchOutcome {
    /// Best first; ties broken by parameter signature.
    pub evaluated: Vec<OptimizationResult>,
    pub generations_completed: usize,
}

impl SearchOutcome {
    pub fn best(&self) -> Option<&OptimizationResult> {
        self.evaluated.first()
    }
}

/// Genetic search over a fixed candle series.
///
/// Runs inside whatever rayon pool the caller installed.
pub(crate) struct GeneticSearch<'a> {
    pub strategy: &'a dyn Strategy,
    pub candles: &'a [Candle],
    pub ranges: &'a [ParameterRange],
    pub target: OptimizationTarget,
    pub genetic: &'a GeneticSettings,
    pub execution: &'a ExecutionSettings,
    pub spread: f64,
    pub initial_balance: Decimal,
}

impl GeneticSearch<'_> {
    /// Strategy defaults overlaid with the genome's grid values.
    pub fn parameters_for(&self, genome: &[usize]) -> StrategyParameters {
        let mut params = self.strategy.default_parameters();
        for (range, &k) in self.ranges.iter().zip(genome) {
            params.insert(range.name.clone(), range.value_at(k).into());
        }
        params
    }

    fn random_genome(&self, rng: &mut StdRng) -> Genome {
        self.ranges
            .iter()
            .map(|r| rng.gen_range(0..=r.steps()))
            .collect()
    }

    fn evaluate(
        &self,
        genome: &[usize],
        generation: usize,
        memo: &DashMap<String, OptimizationResult>,
    ) -> f64 {
        let parameters = self.parameters_for(genome);
        let signature = parameter_signature(&parameters);
        if let Some(known) = memo.get(&signature) {
            return known.fitness;
        }

        let replay = Replay::new(
            self.strategy,
            &parameters,
            self.execution,
            self.spread,
            self.initial_balance,
        );
        let outcome = replay.run(self.candles);
        let metrics = calculate_metrics(&outcome.trades, &outcome.equity_curve, self.initial_balance);
        let score = fitness(&metrics, self.target);
        memo.entry(signature).or_insert(OptimizationResult {
            parameters,
            fitness: score,
            metrics,
            generation,
        });
        score
    }

    fn tournament<'g>(&self, population: &'g [Genome], scores: &[f64], rng: &mut StdRng) -> &'g Genome {
        let mut best = rng.gen_range(0..population.len());
        for _ in 1..TOURNAMENT_SIZE {
            let challenger = rng.gen_range(0..population.len());
            if scores[challenger] > scores[best] {
                best = challenger;
            }
        }
        &population[best]
    }

    fn breed(&self, population: &[Genome], scores: &[f64], rng: &mut StdRng) -> Vec<Genome> {
        let size = population.len();
        let mut ranked: Vec<usize> = (0..size).collect();
        ranked.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let elite = (size as f64 * ELITE_FRACTION).floor() as usize;
        let mut next: Vec<Genome> = ranked[..elite].iter().map(|&i| population[i].clone()).collect();

        while next.len() < size {
            let first = self.tournament(population, scores, rng);
            let second = self.tournament(population, scores, rng);

            // Uniform crossover, else clone the first parent
            let mut child: Genome = if rng.gen::<f64>() < self.genetic.crossover_rate {
                first
                    .iter()
                    .zip(second)
                    .map(|(&a, &b)| if rng.gen::<bool>() { a } else { b })
                    .collect()
            } else {
                first.clone()
            };

            // Re-draw a single gene
            if rng.gen::<f64>() < self.genetic.mutation_rate {
                let gene = rng.gen_range(0..child.len());
                child[gene] = rng.gen_range(0..=self.ranges[gene].steps());
            }
            next.push(child);
        }
        next
    }

    /// Evolve for the configured number of generations.
    ///
    /// `cancelled` is polled before each generation; `on_generation` receives
    /// the number of generations finished so far.
    pub fn run(
        &self,
        seed: u64,
        cancelled: &(dyn Fn() -> bool + Sync),
        on_generation: &dyn Fn(usize),
    ) -> EngineResult<SearchOutcome> {
        let mut rng = StdRng::seed_from_u64(seed);
        let memo: DashMap<String, OptimizationResult> = DashMap::new();
        let generations = self.genetic.generations;

        let mut population: Vec<Genome> = (0..self.genetic.population_size)
            .map(|_| self.random_genome(&mut rng))
            .collect();

        let mut completed = 0;
        for generation in 0..generations {
            if cancelled() {
                return Err(EngineError::Cancelled("optimization".to_string()));
            }

            // 1. Evaluate the population in parallel
            let scores: Vec<f64> = population
                .par_iter()
                .map(|genome| self.evaluate(genome, generation, &memo))
                .collect();
            completed = generation + 1;

            let best_score = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            debug!(
                generation = completed,
                best_score,
                distinct = memo.len(),
                "generation evaluated"
            );
            on_generation(completed);

            // 2. Breed the next generation
            if completed < generations {
                population = self.breed(&population, &scores, &mut rng);
            }
        }

        let mut evaluated: Vec<(String, OptimizationResult)> = memo.into_iter().collect();
        evaluated.sort_by(|a, b| {
            b.1.fitness
                .partial_cmp(&a.1.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(SearchOutcome {
            evaluated: evaluated.into_iter().map(|(_, r)| r).collect(),
            generations_completed: completed,
        })
    }
}

/// Genetic parameter search service.
pub struct GeneticOptimizer {
    provider: Arc<dyn MarketDataProvider>,
    pool: Arc<ThreadPool>,
    tracker: RunTracker,
    history: Mutex<Vec<OptimizationReport>>,
}

impl GeneticOptimizer {
    pub fn new(provider: Arc<dyn MarketDataProvider>, pool: Arc<ThreadPool>) -> Self {
        Self {
            provider,
            pool,
            tracker: RunTracker::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn optimize_strategy(&self, strategy: &dyn Strategy, config: &OptimizationConfig) -> EngineResult<OptimizationReport> {
        config.validate()?;
        let guard = self.tracker.begin("optimization")?;

        let candles = load_candles(self.provider.as_ref(), strategy.symbol(), strategy.timeframe(), &config.range)?;
        let spread = resolve_spread(self.provider.as_ref(), strategy.symbol(), &config.execution);
        let seed = config.seed.unwrap_or_else(rand::random);
        info!(
            strategy = strategy.name(),
            population = config.genetic.population_size,
            generations = config.genetic.generations,
            parameters = config.parameter_ranges.len(),
            seed,
            "starting genetic optimization"
        );

        let search = GeneticSearch {
            strategy,
            candles: &candles,
            ranges: &config.parameter_ranges,
            target: config.target,
            genetic: &config.genetic,
            execution: &config.execution,
            spread,
            initial_balance: config.initial_balance,
        };
        let generations = config.genetic.generations as f64;
        let outcome = self.pool.install(|| {
            search.run(seed, &|| guard.is_cancelled(), &|done| {
                guard.set_progress(done as f64 / generations * 100.0)
            })
        })?;
        guard.check_cancelled()?;

        let best = outcome
            .best()
            .cloned()
            .ok_or_else(|| EngineError::Data("optimization evaluated no individuals".to_string()))?;

        // Full replay of the winner
        let replay = Replay::new(
            strategy,
            &best.parameters,
            &config.execution,
            spread,
            config.initial_balance,
        );
        let best_backtest = build_result(
            result_id(strategy.symbol(), strategy.timeframe(), &config.range),
            strategy,
            &best.parameters,
            strategy.symbol(),
            strategy.timeframe(),
            config.range,
            config.initial_balance,
            replay.run(&candles),
        );

        let report = OptimizationReport {
            id: format!("opt_{}_{}", best_backtest.id, seed),
            strategy_name: strategy.name().to_string(),
            target: config.target,
            best,
            best_backtest,
            evaluated: outcome.evaluated,
            generations_completed: outcome.generations_completed,
            seed,
        };
        info!(
            best_fitness = report.best.fitness,
            evaluated = report.evaluated.len(),
            generations = report.generations_completed,
            "genetic optimization complete"
        );

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report.clone());
        guard.complete();
        Ok(report)
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

    pub fn history(&self) -> Vec<OptimizationReport> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
