use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::*;
use strategy_core::{
    Candle, DateRange, EngineError, EngineResult, ExitReason, MarketDataProvider, Position,
    ProgressHandle, RunTracker, Side, Signal, SignalKind, Strategy, StrategyContext,
    StrategyParameters, Trade,
};
use tracing::{debug, info};

use crate::metrics::{calculate_metrics, monthly_returns};
use crate::models::*;

/// Cache key for a backtest: `SYMBOL_TIMEFRAME_START_END` with ISO-8601
/// millisecond timestamps.
pub fn result_id(symbol: &str, timeframe: &str, range: &DateRange) -> String {
    format!(
        "{}_{}_{}_{}",
        symbol,
        timeframe,
        range.start.to_rfc3339_opts(SecondsFormat::Millis, true),
        range.end.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Fetch candles for `[range.start, range.end]` and check they are usable.
pub(crate) fn load_candles(
    provider: &dyn MarketDataProvider,
    symbol: &str,
    timeframe: &str,
    range: &DateRange,
) -> EngineResult<Vec<Candle>> {
    let candles = provider.get_historical_data(symbol, timeframe, range.start, range.end)?;
    if candles.is_empty() {
        return Err(EngineError::Data(format!(
            "no {timeframe} candles for {symbol} between {} and {}",
            range.start, range.end
        )));
    }
    if let Some(w) = candles.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
        return Err(EngineError::Data(format!(
            "{symbol} candles are not strictly ascending at {}",
            w[1].timestamp
        )));
    }
    Ok(candles)
}

/// Candles whose timestamp falls in `[start, end)`.
pub(crate) fn slice_candles(candles: &[Candle], start: DateTime<Utc>, end: DateTime<Utc>) -> &[Candle] {
    let from = candles.partition_point(|c| c.timestamp < start);
    let to = candles.partition_point(|c| c.timestamp < end);
    &candles[from..to.max(from)]
}

/// Everything a replay produces before metrics are derived.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub trades: Vec<Trade>,
    pub positions: Vec<Position>,
    pub open_position: Option<Position>,
    pub equity_curve: Vec<EquityPoint>,
    pub drawdown_curve: Vec<DrawdownPoint>,
    pub final_balance: Decimal,
    pub final_equity: Decimal,
}

impl ReplayOutcome {
    /// Equity values prefixed with the starting balance.
    pub fn equity_values(&self, initial_balance: Decimal) -> Vec<f64> {
        std::iter::once(initial_balance)
            .chain(self.equity_curve.iter().map(|p| p.equity))
            .map(|e| e.to_f64().unwrap_or(0.0))
            .collect()
    }
}

/// Sequential, side-effect free replay of one strategy over a candle series.
///
/// Shared by the backtest service and every batch operation; it never touches
/// a run tracker, so many replays may run in parallel.
pub struct Replay<'a> {
    strategy: &'a dyn Strategy,
    parameters: &'a StrategyParameters,
    execution: &'a ExecutionSettings,
    symbol: &'a str,
    spread: Decimal,
    slippage: Decimal,
    commission: Decimal,
    initial_balance: Decimal,
}

impl<'a> Replay<'a> {
    /// `spread` is the fractional spread already resolved by the caller
    /// (0 when spreads are not in use).
    pub fn new(
        strategy: &'a dyn Strategy,
        parameters: &'a StrategyParameters,
        execution: &'a ExecutionSettings,
        spread: f64,
        initial_balance: Decimal,
    ) -> Self {
        Self {
            strategy,
            parameters,
            execution,
            symbol: strategy.symbol(),
            spread: Decimal::from_f64(spread).unwrap_or(Decimal::ZERO),
            slippage: Decimal::from_f64(execution.slippage_rate).unwrap_or(Decimal::ZERO),
            commission: Decimal::from_f64(execution.commission_rate).unwrap_or(Decimal::ZERO),
            initial_balance,
        }
    }

    /// Record positions and trades under `symbol` instead of the strategy's own.
    pub fn with_symbol(mut self, symbol: &'a str) -> Self {
        self.symbol = symbol;
        self
    }

    pub fn run(&self, candles: &[Candle]) -> ReplayOutcome {
        self.run_with_progress(candles, |_| {})
    }

    /// Replay, reporting `i / n * 100` before each candle.
    pub fn run_with_progress(&self, candles: &[Candle], mut on_progress: impl FnMut(f64)) -> ReplayOutcome {
        let n = candles.len();
        let mut balance = self.initial_balance;
        let mut max_equity = self.initial_balance;
        let mut position: Option<Position> = None;
        let mut opened_at = 0usize;
        let mut trades: Vec<Trade> = Vec::new();
        let mut positions: Vec<Position> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(n);
        let mut drawdown_curve: Vec<DrawdownPoint> = Vec::with_capacity(n);
        let mut drawdown_duration = 0usize;

        for (i, candle) in candles.iter().enumerate() {
            // 1. Progress
            on_progress(i as f64 / n as f64 * 100.0);

            // 2. Protective stops, from the candle after entry
            if self.execution.enforce_stops && i > opened_at {
                if let Some(pos) = position.take() {
                    match Self::stop_hit(&pos, candle) {
                        Some((level, reason)) => {
                            let trade = self.close_position(pos, level, candle.timestamp, reason, trades.len() + 1);
                            balance += trade.profit;
                            trades.push(trade);
                        }
                        None => position = Some(pos),
                    }
                }
            }

            // 3. Ask the strategy
            let equity = balance
                + position
                    .as_ref()
                    .map(|p| p.unrealized_pnl(candle.close))
                    .unwrap_or(Decimal::ZERO);
            let context = StrategyContext {
                timestamp: candle.timestamp,
                price: candle.close,
                balance,
                equity,
                position: position.as_ref(),
                candles: &candles[..=i],
            };
            let signals = self.strategy.execute(&context, self.parameters);

            // 4. Apply signals in order
            for signal in &signals {
                match signal.kind {
                    SignalKind::Entry if position.is_none() => {
                        if let Some(pos) = self.open_position(signal, candle, balance, positions.len() + 1) {
                            debug!(id = %pos.id, side = ?pos.side, size = %pos.size, price = %pos.entry_price, "position opened");
                            positions.push(pos.clone());
                            position = Some(pos);
                            opened_at = i;
                        }
                    }
                    SignalKind::Exit => {
                        if let Some(pos) = position.take() {
                            let trade = self.close_position(
                                pos,
                                candle.close,
                                candle.timestamp,
                                ExitReason::Signal,
                                trades.len() + 1,
                            );
                            balance += trade.profit;
                            trades.push(trade);
                        }
                    }
                    _ => {}
                }
            }

            // 5. Mark to market
            let equity = balance
                + position
                    .as_ref()
                    .map(|p| p.unrealized_pnl(candle.close))
                    .unwrap_or(Decimal::ZERO);
            if equity > max_equity {
                max_equity = equity;
            }
            let drawdown = if max_equity > Decimal::ZERO {
                ((max_equity - equity) / max_equity * Decimal::ONE_HUNDRED)
                    .to_f64()
                    .unwrap_or(0.0)
                    .max(0.0)
            } else {
                0.0
            };
            drawdown_duration = if drawdown > 0.0 { drawdown_duration + 1 } else { 0 };

            equity_curve.push(EquityPoint {
                timestamp: candle.timestamp,
                equity,
                balance,
                drawdown,
            });
            drawdown_curve.push(DrawdownPoint {
                timestamp: candle.timestamp,
                drawdown,
                duration: drawdown_duration,
            });
        }

        let final_equity = equity_curve.last().map(|p| p.equity).unwrap_or(balance);
        ReplayOutcome {
            trades,
            positions,
            open_position: position,
            equity_curve,
            drawdown_curve,
            final_balance: balance,
            final_equity,
        }
    }

    /// Stop-loss or take-profit level touched by `candle`; the stop wins ties.
    /// A stop gapped through at the open fills at the open.
    fn stop_hit(pos: &Position, candle: &Candle) -> Option<(Decimal, ExitReason)> {
        let (stop_touched, target_touched) = match pos.side {
            Side::Buy => (
                pos.stop_loss.is_some_and(|sl| candle.low <= sl),
                pos.take_profit.is_some_and(|tp| candle.high >= tp),
            ),
            Side::Sell => (
                pos.stop_loss.is_some_and(|sl| candle.high >= sl),
                pos.take_profit.is_some_and(|tp| candle.low <= tp),
            ),
        };
        if stop_touched {
            pos.stop_loss.map(|sl| {
                let fill = match pos.side {
                    Side::Buy => candle.open.min(sl),
                    Side::Sell => candle.open.max(sl),
                };
                (fill, ExitReason::StopLoss)
            })
        } else if target_touched {
            pos.take_profit.map(|tp| (tp, ExitReason::TakeProfit))
        } else {
            None
        }
    }

    /// Buys pay spread and slippage, sells give up slippage.
    fn fill_price(&self, side: Side, price: Decimal) -> Decimal {
        match side {
            Side::Buy => price * (Decimal::ONE + self.spread + self.slippage),
            Side::Sell => price * (Decimal::ONE - self.slippage),
        }
    }

    fn open_position(&self, signal: &Signal, candle: &Candle, balance: Decimal, seq: usize) -> Option<Position> {
        let entry_price = self.fill_price(signal.side, candle.close);
        if entry_price <= Decimal::ZERO || balance <= Decimal::ZERO {
            return None;
        }

        // None when the requested size overflows; the leverage cap then applies
        let requested = match signal.size {
            Some(size) => Some(size),
            None => {
                let risk = signal.risk.unwrap_or(self.execution.risk_fraction);
                let risk_amount = balance.checked_mul(Decimal::from_f64(risk).unwrap_or(Decimal::ZERO))?;
                let stop_distance = signal
                    .stop_loss
                    .map(|sl| (sl - entry_price).abs())
                    .filter(|d| *d > Decimal::ZERO);
                risk_amount.checked_div(stop_distance.unwrap_or(entry_price))
            }
        };

        let max_notional = balance
            .checked_mul(Decimal::from_f64(self.execution.max_leverage).unwrap_or(Decimal::ONE))
            .unwrap_or(Decimal::MAX);
        let max_size = max_notional.checked_div(entry_price)?;
        let size = match requested.and_then(|size| size.checked_mul(entry_price).map(|n| (size, n))) {
            Some((size, notional)) if notional <= max_notional => size,
            _ => max_size,
        };
        if size <= Decimal::ZERO {
            return None;
        }

        Some(Position {
            id: format!("P{seq}"),
            symbol: self.symbol.to_string(),
            side: signal.side,
            entry_price,
            entry_time: candle.timestamp,
            size,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
        })
    }

    fn close_position(
        &self,
        pos: Position,
        price: Decimal,
        time: DateTime<Utc>,
        reason: ExitReason,
        seq: usize,
    ) -> Trade {
        // Closing a long sells, closing a short buys back
        let exit_price = match pos.side {
            Side::Buy => self.fill_price(Side::Sell, price),
            Side::Sell => self.fill_price(Side::Buy, price),
        };
        let commission = pos.size * pos.entry_price * self.commission;
        let profit = (exit_price - pos.entry_price) * pos.size * pos.side.direction() - commission;
        Trade {
            id: format!("T{seq}"),
            position_id: pos.id,
            symbol: pos.symbol,
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            size: pos.size,
            profit,
            commission,
            open_time: pos.entry_time,
            close_time: time,
            exit_reason: reason,
        }
    }
}

/// Assemble a full result from a replay.
pub(crate) fn build_result(
    id: String,
    strategy: &dyn Strategy,
    parameters: &StrategyParameters,
    symbol: &str,
    timeframe: &str,
    range: DateRange,
    initial_balance: Decimal,
    outcome: ReplayOutcome,
) -> BacktestResult {
    let metrics = calculate_metrics(&outcome.trades, &outcome.equity_curve, initial_balance);
    let monthly = monthly_returns(&outcome.equity_curve, initial_balance);
    BacktestResult {
        id,
        strategy_name: strategy.name().to_string(),
        symbol: symbol.to_string(),
        timeframe: timeframe.to_string(),
        parameters: parameters.clone(),
        range,
        initial_balance,
        final_balance: outcome.final_balance,
        final_equity: outcome.final_equity,
        trades: outcome.trades,
        positions: outcome.positions,
        open_position: outcome.open_position,
        metrics,
        equity_curve: outcome.equity_curve,
        drawdown_curve: outcome.drawdown_curve,
        monthly_returns: monthly,
    }
}

/// Spread applied to fills for a run.
pub(crate) fn resolve_spread(provider: &dyn MarketDataProvider, symbol: &str, execution: &ExecutionSettings) -> f64 {
    if execution.use_spread {
        provider.get_spread(symbol)
    } else {
        0.0
    }
}

/// Event-driven backtester with a per-instance result cache.
pub struct BacktestEngine {
    provider: Arc<dyn MarketDataProvider>,
    tracker: RunTracker,
    results: DashMap<String, BacktestResult>,
}

impl BacktestEngine {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            provider,
            tracker: RunTracker::new(),
            results: DashMap::new(),
        }
    }

    /// Replay `config.strategy` over the configured range.
    ///
    /// Fails fast with `Concurrency` if this instance is already running.
    pub fn run_backtest(&self, config: &BacktestConfig) -> EngineResult<BacktestResult> {
        config.validate()?;
        let guard = self.tracker.begin("backtest")?;

        let candles = load_candles(self.provider.as_ref(), &config.symbol, &config.timeframe, &config.range)?;
        let spread = resolve_spread(self.provider.as_ref(), &config.symbol, &config.execution);
        info!(
            strategy = config.strategy.name(),
            symbol = %config.symbol,
            timeframe = %config.timeframe,
            candles = candles.len(),
            "starting backtest"
        );

        let replay = Replay::new(
            config.strategy.as_ref(),
            &config.parameters,
            &config.execution,
            spread,
            config.initial_balance,
        )
        .with_symbol(&config.symbol);
        let outcome = replay.run_with_progress(&candles, |p| guard.set_progress(p));

        let id = result_id(&config.symbol, &config.timeframe, &config.range);
        let result = build_result(
            id.clone(),
            config.strategy.as_ref(),
            &config.parameters,
            &config.symbol,
            &config.timeframe,
            config.range,
            config.initial_balance,
            outcome,
        );
        info!(
            id = %id,
            trades = result.metrics.total_trades,
            pnl = %result.metrics.total_pnl,
            max_drawdown = result.metrics.max_drawdown,
            "backtest complete"
        );

        self.results.insert(id, result.clone());
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

    pub fn result(&self, id: &str) -> Option<BacktestResult> {
        self.results.get(id).map(|r| r.value().clone())
    }

    /// Cached results ordered by id.
    pub fn results(&self) -> Vec<BacktestResult> {
        let mut all: Vec<BacktestResult> = self.results.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn clear_results(&self) {
        self.results.clear();
    }

    pub fn result_id(&self, config: &BacktestConfig) -> String {
        result_id(&config.symbol, &config.timeframe, &config.range)
    }
}
