use rust_decimal::prelude::*;

use crate::{
    param_bool, param_f64, Candle, Side, Signal, Strategy, StrategyContext, StrategyParameters,
};

/// Moving-average crossover with percentage stop and target.
///
/// Parameters:
/// - `fast_period` (10), `slow_period` (30): lookbacks in candles
/// - `stop_loss_pct` (2.0), `take_profit_pct` (4.0): distance from the close, in percent
/// - `risk` (0.01): fraction of balance risked per entry
/// - `allow_short` (false): open shorts on a downward cross
pub struct SmaCrossover {
    name: String,
    symbol: String,
    timeframe: String,
}

impl SmaCrossover {
    pub fn new(symbol: &str, timeframe: &str) -> Self {
        Self {
            name: "SMA Crossover".to_string(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

/// Simple moving average of closes over `period` candles ending at `end` (exclusive).
fn sma(candles: &[Candle], end: usize, period: usize) -> Option<Decimal> {
    if period == 0 || end < period {
        return None;
    }
    let sum: Decimal = candles[end - period..end].iter().map(|c| c.close).sum();
    Some(sum / Decimal::from(period))
}

fn pct_offset(price: Decimal, pct: f64) -> Decimal {
    price * Decimal::from_f64(pct / 100.0).unwrap_or(Decimal::ZERO)
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn timeframe(&self) -> &str {
        &self.timeframe
    }

    fn default_parameters(&self) -> StrategyParameters {
        let mut params = StrategyParameters::new();
        params.insert("fast_period".to_string(), 10.0.into());
        params.insert("slow_period".to_string(), 30.0.into());
        params.insert("stop_loss_pct".to_string(), 2.0.into());
        params.insert("take_profit_pct".to_string(), 4.0.into());
        params.insert("risk".to_string(), 0.01.into());
        params.insert("allow_short".to_string(), false.into());
        params
    }

    fn execute(&self, context: &StrategyContext<'_>, parameters: &StrategyParameters) -> Vec<Signal> {
        let fast_period = param_f64(parameters, "fast_period", 10.0).round().max(1.0) as usize;
        let slow_period = param_f64(parameters, "slow_period", 30.0).round().max(1.0) as usize;
        let stop_pct = param_f64(parameters, "stop_loss_pct", 2.0);
        let target_pct = param_f64(parameters, "take_profit_pct", 4.0);
        let risk = param_f64(parameters, "risk", 0.01);
        let allow_short = param_bool(parameters, "allow_short", false);

        let candles = context.candles;
        let n = candles.len();
        if fast_period >= slow_period || n < slow_period + 1 {
            return Vec::new();
        }

        let (Some(fast), Some(slow), Some(prev_fast), Some(prev_slow)) = (
            sma(candles, n, fast_period),
            sma(candles, n, slow_period),
            sma(candles, n - 1, fast_period),
            sma(candles, n - 1, slow_period),
        ) else {
            return Vec::new();
        };

        let crossed_up = prev_fast <= prev_slow && fast > slow;
        let crossed_down = prev_fast >= prev_slow && fast < slow;
        let price = context.price;
        let held = context.position.map(|p| p.side);

        let mut signals = Vec::new();
        if crossed_up {
            if held == Some(Side::Sell) {
                signals.push(Signal::exit(Side::Buy));
            }
            if held != Some(Side::Buy) {
                signals.push(
                    Signal::entry(Side::Buy)
                        .with_stop_loss(price - pct_offset(price, stop_pct))
                        .with_take_profit(price + pct_offset(price, target_pct))
                        .with_risk(risk),
                );
            }
        } else if crossed_down {
            if held == Some(Side::Buy) {
                signals.push(Signal::exit(Side::Sell));
            }
            if allow_short && held != Some(Side::Sell) {
                signals.push(
                    Signal::entry(Side::Sell)
                        .with_stop_loss(price + pct_offset(price, stop_pct))
                        .with_take_profit(price - pct_offset(price, target_pct))
                        .with_risk(risk),
                );
            }
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Position, SignalKind};
    use chrono::{Duration, TimeZone, Utc};

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let close = Decimal::from_f64(c).unwrap();
                Candle {
                    timestamp: start + Duration::days(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 0.0,
                }
            })
            .collect()
    }

    fn params(fast: f64, slow: f64, allow_short: bool) -> StrategyParameters {
        let strategy = SmaCrossover::new("EURUSD", "1d");
        let mut p = strategy.default_parameters();
        p.insert("fast_period".to_string(), fast.into());
        p.insert("slow_period".to_string(), slow.into());
        p.insert("allow_short".to_string(), allow_short.into());
        p
    }

    fn context<'a>(candles: &'a [Candle], position: Option<&'a Position>) -> StrategyContext<'a> {
        let last = candles.last().unwrap();
        StrategyContext {
            timestamp: last.timestamp,
            price: last.close,
            balance: Decimal::new(10_000, 0),
            equity: Decimal::new(10_000, 0),
            position,
            candles,
        }
    }

    #[test]
    fn test_upward_cross_enters_long_with_stops() {
        let data = candles(&[10.0, 10.0, 10.0, 9.0, 12.0]);
        let strategy = SmaCrossover::new("EURUSD", "1d");
        let signals = strategy.execute(&context(&data, None), &params(2.0, 3.0, false));
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.kind, SignalKind::Entry);
        assert_eq!(s.side, Side::Buy);
        assert!(s.stop_loss.unwrap() < Decimal::new(12, 0));
        assert!(s.take_profit.unwrap() > Decimal::new(12, 0));
        assert_eq!(s.risk, Some(0.01));
    }

    #[test]
    fn test_downward_cross_exits_long_and_optionally_shorts() {
        let data = candles(&[10.0, 10.0, 10.0, 11.0, 8.0]);
        let strategy = SmaCrossover::new("EURUSD", "1d");
        let long = Position {
            id: "P1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            entry_price: Decimal::new(10, 0),
            entry_time: data[0].timestamp,
            size: Decimal::ONE,
            stop_loss: None,
            take_profit: None,
        };

        let signals = strategy.execute(&context(&data, Some(&long)), &params(2.0, 3.0, false));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Exit);

        let signals = strategy.execute(&context(&data, Some(&long)), &params(2.0, 3.0, true));
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[1].kind, SignalKind::Entry);
        assert_eq!(signals[1].side, Side::Sell);
    }

    #[test]
    fn test_insufficient_history_is_silent() {
        let data = candles(&[10.0, 11.0]);
        let strategy = SmaCrossover::new("EURUSD", "1d");
        assert!(strategy
            .execute(&context(&data, None), &strategy.default_parameters())
            .is_empty());
    }
}
