//! strategy-lab: run the evaluation engines against a JSON candle file.
//!
//! The file holds one series object or an array of them:
//! `{"symbol": "EURUSD", "timeframe": "1d", "spread": 0.0002, "candles": [...]}`.
//!
//! Usage:
//!   cargo run -p strategy-lab -- backtest --data candles.json
//!   cargo run -p strategy-lab -- monte-carlo --data candles.json --simulations 500 --seed 7
//!   cargo run -p strategy-lab -- optimize --data candles.json --symbol EURUSD
//!   cargo run -p strategy-lab -- walk-forward --data candles.json --out wf.json
//!   cargo run -p strategy-lab -- portfolio --data candles.json --target risk-parity

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use backtest_engine::{
    export_results, BacktestConfig, BacktestEngine, EngineSettings, GeneticOptimizer,
    GeneticSettings, MonteCarloConfig, MonteCarloSimulator, OptimizationConfig,
    OptimizationTarget, ParameterRange, PortfolioConfig, PortfolioOptimizer, PortfolioTarget,
    WalkForwardAnalyzer, WalkForwardConfig,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use strategy_core::{
    DateRange, InMemoryMarketData, ProgressHandle, RunStatus, SmaCrossover, Strategy,
};
use tracing::info;

const USAGE: &str = "usage: strategy-lab <backtest|monte-carlo|optimize|walk-forward|portfolio> \
--data FILE [--symbol S] [--timeframe T] [--start DATE] [--end DATE] [--balance N] \
[--simulations N] [--seed N] [--out FILE]";

/// Parsed command line.
struct Options {
    command: String,
    data: String,
    symbol: Option<String>,
    timeframe: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    balance: Decimal,
    simulations: usize,
    seed: Option<u64>,
    in_sample_days: i64,
    out_sample_days: i64,
    target: PortfolioTarget,
    out: Option<String>,
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn parse_flag<T: FromStr>(args: &[String], flag: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match flag_value(args, flag) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {flag}: {raw}")),
        None => Ok(default),
    }
}

/// RFC 3339 timestamp or a plain `YYYY-MM-DD` date (midnight UTC).
fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date: {raw}"))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow!("invalid date: {raw}"))
}

fn parse_target(raw: &str) -> Result<PortfolioTarget> {
    match raw.to_ascii_lowercase().replace('_', "-").as_str() {
        "sharpe" => Ok(PortfolioTarget::Sharpe),
        "return" => Ok(PortfolioTarget::Return),
        "risk-parity" => Ok(PortfolioTarget::RiskParity),
        "min-variance" => Ok(PortfolioTarget::MinVariance),
        other => bail!("unknown portfolio target: {other}"),
    }
}

fn parse_options(args: &[String]) -> Result<Options> {
    let command = args
        .get(1)
        .filter(|c| !c.starts_with("--"))
        .cloned()
        .ok_or_else(|| anyhow!(USAGE))?;
    let data = flag_value(args, "--data")
        .map(str::to_string)
        .ok_or_else(|| anyhow!("--data FILE is required\n{USAGE}"))?;

    Ok(Options {
        command,
        data,
        symbol: flag_value(args, "--symbol").map(str::to_string),
        timeframe: flag_value(args, "--timeframe").map(str::to_string),
        start: flag_value(args, "--start").map(parse_date).transpose()?,
        end: flag_value(args, "--end").map(parse_date).transpose()?,
        balance: parse_flag(args, "--balance", Decimal::from(10_000))?,
        simulations: parse_flag(args, "--simulations", 1000)?,
        seed: flag_value(args, "--seed")
            .map(|s| s.parse().with_context(|| format!("invalid seed: {s}")))
            .transpose()?,
        in_sample_days: parse_flag(args, "--in-sample", 120)?,
        out_sample_days: parse_flag(args, "--out-sample", 30)?,
        target: flag_value(args, "--target")
            .map(parse_target)
            .transpose()?
            .unwrap_or(PortfolioTarget::Sharpe),
        out: flag_value(args, "--out").map(str::to_string),
    })
}

/// Log progress in 10% steps until the operation leaves the running state.
fn log_progress(operation: &'static str, handle: ProgressHandle) -> tokio::task::JoinHandle<()> {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        let mut next_mark = 10.0;
        while rx.changed().await.is_ok() {
            let snapshot = *rx.borrow_and_update();
            if snapshot.progress >= next_mark {
                info!(operation, progress = snapshot.progress.floor(), "progress");
                next_mark = (snapshot.progress / 10.0).floor() * 10.0 + 10.0;
            }
            if !matches!(snapshot.status, RunStatus::Idle | RunStatus::Running) {
                break;
            }
        }
    })
}

fn sma_search_space() -> Vec<ParameterRange> {
    vec![
        ParameterRange::new("fast_period", 5.0, 20.0, 5.0),
        ParameterRange::new("slow_period", 20.0, 60.0, 10.0),
        ParameterRange::new("stop_loss_pct", 1.0, 4.0, 0.5),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    let args: Vec<String> = std::env::args().collect();
    let opts = parse_options(&args)?;

    let settings = EngineSettings::from_env().context("invalid engine settings")?;
    let pool = settings.build_pool()?;
    let market = InMemoryMarketData::from_json_file(&opts.data)
        .with_context(|| format!("failed to load candles from {}", opts.data))?;

    let keys = market.series_keys();
    let (symbol, timeframe) = match (&opts.symbol, &opts.timeframe) {
        (Some(s), Some(t)) => (s.clone(), t.clone()),
        (symbol, timeframe) => keys
            .iter()
            .find(|(s, t)| {
                symbol.as_ref().map_or(true, |want| want == s)
                    && timeframe.as_ref().map_or(true, |want| want == t)
            })
            .cloned()
            .ok_or_else(|| anyhow!("no series in {} matches the requested symbol/timeframe", opts.data))?,
    };
    let (first, last) = market
        .span(&symbol, &timeframe)
        .ok_or_else(|| anyhow!("no candles for {symbol} {timeframe}"))?;
    let range = DateRange::new(opts.start.unwrap_or(first), opts.end.unwrap_or(last));
    info!(
        command = %opts.command,
        symbol = %symbol,
        timeframe = %timeframe,
        start = %range.start,
        end = %range.end,
        workers = settings.worker_threads,
        "strategy-lab starting"
    );

    let provider = Arc::new(market);
    let strategy: Arc<dyn Strategy> = Arc::new(SmaCrossover::new(&symbol, &timeframe));
    let execution = settings.execution_defaults();

    let document: Value = match opts.command.as_str() {
        "backtest" | "monte-carlo" => {
            let engine = Arc::new(BacktestEngine::new(provider.clone()));
            let config = BacktestConfig::new(strategy.clone(), range, opts.balance)
                .with_execution(execution.clone());
            let watcher = log_progress("backtest", engine.handle());
            let backtest = {
                let engine = engine.clone();
                let config = config.clone();
                tokio::task::spawn_blocking(move || engine.run_backtest(&config)).await??
            };
            watcher.abort();

            let monte_carlo = if opts.command == "monte-carlo" {
                let simulator = Arc::new(MonteCarloSimulator::new(provider.clone(), pool.clone(), &settings));
                let mut mc = MonteCarloConfig::new(opts.balance, range.end);
                mc.num_simulations = opts.simulations;
                mc.time_horizon_days = range.days().max(1);
                mc.execution = execution.clone();
                mc.seed = opts.seed;
                let watcher = log_progress("monte carlo", simulator.handle());
                let strategy = strategy.clone();
                let result = tokio::task::spawn_blocking(move || simulator.run_simulation(strategy.as_ref(), &mc))
                    .await??;
                watcher.abort();
                Some(result)
            } else {
                None
            };

            export_results(
                strategy.as_ref(),
                &backtest,
                monte_carlo.as_ref(),
                &json!({
                    "symbol": config.symbol,
                    "timeframe": config.timeframe,
                    "range": config.range,
                    "initial_balance": config.initial_balance,
                    "execution": config.execution,
                    "parameters": config.parameters,
                }),
            )?
        }
        "optimize" => {
            let optimizer = Arc::new(GeneticOptimizer::new(provider.clone(), pool.clone()));
            let config = OptimizationConfig {
                parameter_ranges: sma_search_space(),
                target: OptimizationTarget::SharpeRatio,
                genetic: GeneticSettings::default(),
                range,
                initial_balance: opts.balance,
                execution,
                seed: opts.seed,
            };
            let watcher = log_progress("optimization", optimizer.handle());
            let strategy = strategy.clone();
            let report = tokio::task::spawn_blocking(move || optimizer.optimize_strategy(strategy.as_ref(), &config))
                .await??;
            watcher.abort();
            serde_json::to_value(report)?
        }
        "walk-forward" => {
            let analyzer = Arc::new(WalkForwardAnalyzer::new(provider.clone(), pool.clone()));
            let config = WalkForwardConfig {
                range,
                in_sample_days: opts.in_sample_days,
                out_sample_days: opts.out_sample_days,
                overlap_pct: 0.0,
                initial_balance: opts.balance,
                target: OptimizationTarget::SharpeRatio,
                parameter_ranges: sma_search_space(),
                genetic: GeneticSettings {
                    population_size: 20,
                    generations: 5,
                    ..GeneticSettings::default()
                },
                execution,
                seed: opts.seed,
            };
            let watcher = log_progress("walk-forward", analyzer.handle());
            let strategy = strategy.clone();
            let result = tokio::task::spawn_blocking(move || analyzer.run_analysis(strategy.as_ref(), &config))
                .await??;
            watcher.abort();
            serde_json::to_value(result)?
        }
        "portfolio" => {
            // One crossover per loaded series
            let strategies: Vec<Arc<dyn Strategy>> = keys
                .iter()
                .map(|(s, t)| Arc::new(SmaCrossover::new(s, t)) as Arc<dyn Strategy>)
                .collect();
            let optimizer = Arc::new(PortfolioOptimizer::new(provider.clone(), pool.clone(), &settings));
            let mut config = PortfolioConfig::new(range, opts.balance, opts.target);
            config.execution = execution;
            config.seed = opts.seed;
            let watcher = log_progress("portfolio", optimizer.handle());
            let result = tokio::task::spawn_blocking(move || optimizer.optimize_portfolio(&strategies, &config))
                .await??;
            watcher.abort();
            serde_json::to_value(result)?
        }
        other => bail!("unknown command: {other}\n{USAGE}"),
    };

    let rendered = serde_json::to_string_pretty(&document)?;
    match &opts.out {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("failed to write {path}"))?;
            info!(path = %path, "results written");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
