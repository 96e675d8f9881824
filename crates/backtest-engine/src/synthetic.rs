use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::*;
use statrs::distribution::Normal;
use strategy_core::{stats, Candle, EngineError, EngineResult};

use crate::models::MarketShock;

/// Salt for the shared market-factor stream used by correlation shocks.
const FACTOR_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Candle geometry relative to its close.
#[derive(Debug, Clone, Copy)]
struct CandleShape {
    open: f64,
    high: f64,
    low: f64,
    volume: f64,
}

/// Block-bootstrap generator of synthetic forward paths.
///
/// Paths reuse the base series' timestamps and starting close; every later
/// close is driven by resampled close-to-close log returns.
#[derive(Debug, Clone)]
pub struct PathGenerator {
    anchor: Candle,
    log_returns: Vec<f64>,
    shapes: Vec<CandleShape>,
    timestamps: Vec<DateTime<Utc>>,
    mean: f64,
    std_dev: f64,
    block_size: usize,
}

impl PathGenerator {
    pub fn new(base: &[Candle], block_size: usize) -> EngineResult<Self> {
        if base.len() < 2 {
            return Err(EngineError::Data(format!(
                "need at least two candles to simulate, got {}",
                base.len()
            )));
        }
        let closes: Vec<f64> = base.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
        if closes.iter().any(|c| !(*c > 0.0)) {
            return Err(EngineError::Data("simulation needs positive closes".to_string()));
        }

        let log_returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let shapes = base[1..]
            .iter()
            .zip(&closes[1..])
            .map(|(c, &close)| CandleShape {
                open: c.open.to_f64().unwrap_or(close) / close,
                high: c.high.to_f64().unwrap_or(close) / close,
                low: c.low.to_f64().unwrap_or(close) / close,
                volume: c.volume,
            })
            .collect();

        Ok(Self {
            anchor: base[0].clone(),
            mean: stats::mean(&log_returns),
            std_dev: stats::sample_std_dev(&log_returns),
            log_returns,
            shapes,
            timestamps: base.iter().map(|c| c.timestamp).collect(),
            block_size: block_size.max(1),
        })
    }

    /// Number of synthetic steps after the anchor candle.
    pub fn steps(&self) -> usize {
        self.log_returns.len()
    }

    /// One synthetic path. Equal seeds give equal paths.
    pub fn generate(&self, seed: u64, shock: Option<&MarketShock>) -> Vec<Candle> {
        let steps = self.steps();
        let mut rng = StdRng::seed_from_u64(seed);

        // 1. Block bootstrap of source indices
        let mut picks: Vec<usize> = Vec::with_capacity(steps);
        while picks.len() < steps {
            let start = rng.gen_range(0..steps);
            for k in 0..self.block_size {
                if picks.len() == steps {
                    break;
                }
                picks.push((start + k) % steps);
            }
        }

        // 2. Shock the returns
        let mut factor_rng = StdRng::seed_from_u64(seed ^ FACTOR_SALT);
        let standard_normal = Normal::new(0.0, 1.0).ok();
        let drift = match shock {
            Some(MarketShock::ReturnShift(total)) => (1.0 + total).max(1e-9).ln() / steps as f64,
            _ => 0.0,
        };
        let vol_scale = match shock {
            Some(MarketShock::VolatilityMultiplier(k)) => *k,
            _ => 1.0,
        };

        let mut candles = Vec::with_capacity(steps + 1);
        candles.push(self.anchor.clone());
        let mut close = self.anchor.close.to_f64().unwrap_or(1.0);

        for (t, &src) in picks.iter().enumerate() {
            let mut r = self.log_returns[src];
            match shock {
                Some(MarketShock::VolatilityMultiplier(k)) => r = self.mean + k * (r - self.mean),
                Some(MarketShock::CorrelationOverride(rho)) => {
                    let z = standard_normal
                        .as_ref()
                        .map(|n| factor_rng.sample(n))
                        .unwrap_or(0.0);
                    r = self.mean + (1.0 - rho).sqrt() * (r - self.mean) + rho.sqrt() * self.std_dev * z;
                }
                _ => {}
            }
            r += drift;
            close *= r.exp();

            // 3. Rebuild the candle around the new close
            let shape = self.shapes[src];
            let scale = |ratio: f64| 1.0 + vol_scale * (ratio - 1.0);
            let open = close * scale(shape.open).max(1e-9);
            let high = (close * scale(shape.high)).max(open).max(close);
            let low = (close * scale(shape.low).max(1e-9)).min(open).min(close);

            candles.push(Candle {
                timestamp: self.timestamps[t + 1],
                open: to_price(open),
                high: to_price(high),
                low: to_price(low),
                close: to_price(close),
                volume: shape.volume,
            });
        }
        candles
    }
}

fn to_price(v: f64) -> Decimal {
    Decimal::from_f64(v)
        .map(|d| d.round_dp(10))
        .unwrap_or(Decimal::ZERO)
}

/// Spread under an optional shock. Spread shocks apply even when the run does
/// not use spreads.
pub fn shocked_spread(base_spread: f64, use_spread: bool, shock: Option<&MarketShock>) -> f64 {
    match shock {
        Some(MarketShock::SpreadMultiplier(k)) => base_spread * k,
        _ if use_spread => base_spread,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base(n: usize) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1;
                Candle {
                    timestamp: t0 + Duration::days(i as i64),
                    open: to_price(close * 0.998),
                    high: to_price(close * 1.01),
                    low: to_price(close * 0.99),
                    close: to_price(close),
                    volume: 1000.0,
                }
            })
            .collect()
    }

    fn closes(path: &[Candle]) -> Vec<f64> {
        path.iter().map(|c| c.close.to_f64().unwrap()).collect()
    }

    #[test]
    fn test_rejects_short_history() {
        assert!(matches!(PathGenerator::new(&base(1), 5), Err(EngineError::Data(_))));
    }

    #[test]
    fn test_same_seed_same_path() {
        let gen = PathGenerator::new(&base(60), 5).unwrap();
        let a = gen.generate(7, None);
        let b = gen.generate(7, None);
        let c = gen.generate(8, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 60);
        assert_eq!(a[0], base(60)[0]);
    }

    #[test]
    fn test_candles_stay_well_formed() {
        let gen = PathGenerator::new(&base(60), 3).unwrap();
        for shock in [None, Some(MarketShock::VolatilityMultiplier(3.0))] {
            for c in gen.generate(11, shock.as_ref()) {
                assert!(c.low <= c.open && c.low <= c.close);
                assert!(c.high >= c.open && c.high >= c.close);
                assert!(c.low > Decimal::ZERO);
            }
        }
    }

    #[test]
    fn test_return_shift_moves_terminal_price() {
        let gen = PathGenerator::new(&base(60), 5).unwrap();
        let plain = closes(&gen.generate(3, None));
        let crashed = closes(&gen.generate(3, Some(&MarketShock::ReturnShift(-0.2))));
        let ratio = crashed.last().unwrap() / plain.last().unwrap();
        assert!((ratio - 0.8).abs() < 1e-6, "ratio {ratio}");
    }

    #[test]
    fn test_correlation_override_makes_paths_co_move() {
        // Two unrelated histories under a full correlation override share the factor.
        let gen_a = PathGenerator::new(&base(80), 5).unwrap();
        let gen_b = PathGenerator::new(&base(80)[10..], 5).unwrap();
        let shock = MarketShock::CorrelationOverride(1.0);
        let ra = stats::step_returns(&closes(&gen_a.generate(5, Some(&shock))));
        let rb = stats::step_returns(&closes(&gen_b.generate(5, Some(&shock))));
        let n = ra.len().min(rb.len());
        assert!(stats::pearson_correlation(&ra[..n], &rb[..n]) > 0.9);
    }

    #[test]
    fn test_spread_shock_applies_without_spread_flag() {
        let shock = MarketShock::SpreadMultiplier(3.0);
        assert_eq!(shocked_spread(0.001, false, Some(&shock)), 0.003);
        assert_eq!(shocked_spread(0.001, false, None), 0.0);
        assert_eq!(shocked_spread(0.001, true, None), 0.001);
    }
}
