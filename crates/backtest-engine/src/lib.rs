pub mod config;
pub mod engine;
pub mod export;
pub mod genetic;
pub mod metrics;
pub mod models;
pub mod monte_carlo;
pub mod portfolio;
pub mod synthetic;
pub mod walk_forward;

pub use config::EngineSettings;
pub use engine::{BacktestEngine, Replay, ReplayOutcome};
pub use export::{export_results, export_results_pretty};
pub use genetic::GeneticOptimizer;
pub use metrics::calculate_metrics;
pub use models::*;
pub use monte_carlo::MonteCarloSimulator;
pub use portfolio::PortfolioOptimizer;
pub use walk_forward::WalkForwardAnalyzer;

#[cfg(test)]
mod tests;
