use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::*;
use strategy_core::{stats, Trade};

use crate::models::{EquityPoint, MonthlyReturn, PerformanceMetrics};

/// Annualisation factor for daily Sharpe.
const TRADING_DAYS: f64 = 252.0;

/// Compute performance metrics from closed trades and the equity curve.
///
/// Pure and total: degenerate inputs (no trades, no losses, zero variance)
/// resolve to 0 rather than NaN or infinity.
pub fn calculate_metrics(
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    initial_balance: Decimal,
) -> PerformanceMetrics {
    let initial = initial_balance.to_f64().unwrap_or(0.0);

    let total_pnl: Decimal = trades.iter().map(|t| t.profit).sum();
    let total_commission: Decimal = trades.iter().map(|t| t.commission).sum();

    let total_return_pct = match equity_curve.last() {
        Some(last) if initial > 0.0 => {
            (last.equity.to_f64().unwrap_or(initial) - initial) / initial * 100.0
        }
        _ => 0.0,
    };

    let wins: Vec<f64> = trades
        .iter()
        .filter(|t| t.profit > Decimal::ZERO)
        .map(|t| t.profit.to_f64().unwrap_or(0.0))
        .collect();
    let losses: Vec<f64> = trades
        .iter()
        .filter(|t| t.profit < Decimal::ZERO)
        .map(|t| t.profit.to_f64().unwrap_or(0.0).abs())
        .collect();

    let win_rate = if trades.is_empty() {
        0.0
    } else {
        wins.len() as f64 / trades.len() as f64
    };
    let average_win = stats::mean(&wins);
    let average_loss = stats::mean(&losses);

    let gross_win: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_win / gross_loss
    } else {
        0.0
    };

    let risk_reward_ratio = if average_loss > 0.0 {
        average_win / average_loss
    } else {
        0.0
    };

    let max_drawdown = equity_curve
        .iter()
        .map(|p| p.drawdown)
        .fold(0.0_f64, f64::max);

    PerformanceMetrics {
        total_trades: trades.len(),
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        total_pnl,
        total_return_pct: finite_or_zero(total_return_pct),
        total_commission,
        win_rate,
        average_win,
        average_loss,
        profit_factor: finite_or_zero(profit_factor),
        sharpe_ratio: daily_sharpe(trades, initial),
        max_drawdown: if max_drawdown > 0.0 { -max_drawdown } else { 0.0 },
        risk_reward_ratio: finite_or_zero(risk_reward_ratio),
        trades_per_day: trades_per_day(trades),
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Sharpe of daily trade P&L, each day's P&L taken as a return on the balance
/// going into that day.
fn daily_sharpe(trades: &[Trade], initial_balance: f64) -> f64 {
    let mut daily_pnl: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for trade in trades {
        *daily_pnl.entry(trade.close_time.date_naive()).or_insert(0.0) +=
            trade.profit.to_f64().unwrap_or(0.0);
    }
    if daily_pnl.len() < 2 {
        return 0.0;
    }

    let mut balance = initial_balance;
    let mut returns = Vec::with_capacity(daily_pnl.len());
    for pnl in daily_pnl.values() {
        if balance > 0.0 {
            returns.push(pnl / balance);
        }
        balance += pnl;
    }

    let std = stats::sample_std_dev(&returns);
    if std < 1e-12 {
        return 0.0;
    }
    finite_or_zero(stats::mean(&returns) / std * TRADING_DAYS.sqrt())
}

fn trades_per_day(trades: &[Trade]) -> f64 {
    let (Some(first_open), Some(last_close)) = (
        trades.iter().map(|t| t.open_time).min(),
        trades.iter().map(|t| t.close_time).max(),
    ) else {
        return 0.0;
    };
    let days = ((last_close - first_open).num_seconds() as f64 / 86_400.0).max(1.0);
    trades.len() as f64 / days
}

/// Percent change of equity between calendar-month ends.
///
/// The first month is measured from the initial balance; the last month may
/// be partial.
pub fn monthly_returns(equity_curve: &[EquityPoint], initial_balance: Decimal) -> Vec<MonthlyReturn> {
    let mut month_ends: Vec<(i32, u32, Decimal)> = Vec::new();
    for point in equity_curve {
        let (year, month) = (point.timestamp.year(), point.timestamp.month());
        match month_ends.last_mut() {
            Some(last) if last.0 == year && last.1 == month => last.2 = point.equity,
            _ => month_ends.push((year, month, point.equity)),
        }
    }

    let mut previous = initial_balance;
    month_ends
        .into_iter()
        .map(|(year, month, equity)| {
            let return_pct = if previous > Decimal::ZERO {
                ((equity - previous) / previous).to_f64().unwrap_or(0.0) * 100.0
            } else {
                0.0
            };
            previous = equity;
            MonthlyReturn {
                year,
                month,
                return_pct,
            }
        })
        .collect()
}
