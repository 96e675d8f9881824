use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::models::ExecutionSettings;

/// Process-wide engine settings, read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub worker_threads: usize,     // rayon pool size
    pub risk_fraction: f64,        // 0.01 = 1% of balance per entry
    pub max_leverage: f64,         // notional cap as a multiple of balance
    pub mc_block_size: usize,      // bootstrap block length in candles
    pub stress_simulations: usize, // paths per portfolio stress scenario
    pub periods_per_year: f64,     // annualisation factor for portfolio stats
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            risk_fraction: 0.01,
            max_leverage: 10.0,
            mc_block_size: 5,
            stress_simulations: 200,
            periods_per_year: 252.0,
        }
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl EngineSettings {
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            worker_threads: match env::var("ENGINE_WORKER_THREADS") {
                Ok(v) => v.parse().context("ENGINE_WORKER_THREADS must be an integer")?,
                Err(_) => default_worker_threads(),
            },
            risk_fraction: env::var("ENGINE_RISK_FRACTION")
                .unwrap_or_else(|_| "0.01".to_string())
                .parse()
                .context("ENGINE_RISK_FRACTION must be a number")?,
            max_leverage: env::var("ENGINE_MAX_LEVERAGE")
                .unwrap_or_else(|_| "10.0".to_string())
                .parse()
                .context("ENGINE_MAX_LEVERAGE must be a number")?,
            mc_block_size: env::var("ENGINE_MC_BLOCK_SIZE")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("ENGINE_MC_BLOCK_SIZE must be an integer")?,
            stress_simulations: env::var("ENGINE_STRESS_SIMULATIONS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .context("ENGINE_STRESS_SIMULATIONS must be an integer")?,
            periods_per_year: env::var("ENGINE_PERIODS_PER_YEAR")
                .unwrap_or_else(|_| "252".to_string())
                .parse()
                .context("ENGINE_PERIODS_PER_YEAR must be a number")?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if !(self.risk_fraction > 0.0 && self.risk_fraction <= 1.0) {
            bail!("risk_fraction must be in (0, 1], got {}", self.risk_fraction);
        }
        if !(self.max_leverage > 0.0) {
            bail!("max_leverage must be positive, got {}", self.max_leverage);
        }
        if self.mc_block_size == 0 {
            bail!("mc_block_size must be at least 1");
        }
        if self.stress_simulations == 0 {
            bail!("stress_simulations must be at least 1");
        }
        if !(self.periods_per_year > 0.0) {
            bail!("periods_per_year must be positive, got {}", self.periods_per_year);
        }
        Ok(())
    }

    /// Bounded worker pool shared by the batch services.
    pub fn build_pool(&self) -> Result<Arc<ThreadPool>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_threads)
            .thread_name(|i| format!("strategy-engine-{i}"))
            .build()
            .context("failed to build worker pool")?;
        Ok(Arc::new(pool))
    }

    /// Zero-cost execution with this process's sizing defaults.
    pub fn execution_defaults(&self) -> ExecutionSettings {
        ExecutionSettings {
            risk_fraction: self.risk_fraction,
            max_leverage: self.max_leverage,
            ..ExecutionSettings::default()
        }
    }
}
