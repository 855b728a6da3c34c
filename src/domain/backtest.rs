//! Day-stepped backtest simulation.
//!
//! `simulate` replays a score-driven strategy over a unified timeline. Each
//! day it marks the portfolio to market, runs a sell pass over held positions
//! and a buy pass over the remaining instruments, all through the same
//! [`Ledger`] arithmetic as live trading. Anything still held after the last
//! day is liquidated as `SELL(CLOSE)`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::domain::account::{round_to, Account, Trade, TradeSide};
use crate::domain::error::PapertraderError;
use crate::domain::instrument_data::InstrumentData;
use crate::domain::ledger::{FeeSchedule, Ledger, Order};
use crate::domain::metrics::Metrics;
use crate::domain::ohlcv::InstrumentId;
use crate::domain::scoring::{DEFAULT_BUY_THRESHOLD, DEFAULT_SELL_THRESHOLD, SignalThresholds};

pub const DEFAULT_MAX_POSITIONS: usize = 5;
pub const DEFAULT_BUDGET_RATIO: f64 = 0.7;

/// Price used to mark a held position on a day it has no bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkFallback {
    #[default]
    AvgPrice,
    LastKnown,
}

impl fmt::Display for MarkFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkFallback::AvgPrice => write!(f, "avg_price"),
            MarkFallback::LastKnown => write!(f, "last_known"),
        }
    }
}

impl FromStr for MarkFallback {
    type Err = PapertraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avg_price" => Ok(MarkFallback::AvgPrice),
            "last_known" => Ok(MarkFallback::LastKnown),
            other => Err(PapertraderError::invalid(format!(
                "unknown mark fallback '{}' (expected avg_price or last_known)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestParams {
    pub strategy_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_balance: f64,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub max_positions: usize,
    pub budget_ratio: f64,
    pub mark_fallback: MarkFallback,
}

impl BacktestParams {
    pub fn new(
        strategy_name: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        initial_balance: f64,
    ) -> Self {
        BacktestParams {
            strategy_name: strategy_name.into(),
            start_date,
            end_date,
            initial_balance,
            buy_threshold: DEFAULT_BUY_THRESHOLD,
            sell_threshold: DEFAULT_SELL_THRESHOLD,
            max_positions: DEFAULT_MAX_POSITIONS,
            budget_ratio: DEFAULT_BUDGET_RATIO,
            mark_fallback: MarkFallback::default(),
        }
    }

    pub fn validate(&self) -> Result<(), PapertraderError> {
        if self.start_date > self.end_date {
            return Err(PapertraderError::invalid(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            )));
        }
        if !self.initial_balance.is_finite() || self.initial_balance <= 0.0 {
            return Err(PapertraderError::invalid(format!(
                "initial_balance must be positive, got {}",
                self.initial_balance
            )));
        }
        let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        if !in_range(self.buy_threshold) || !in_range(self.sell_threshold) {
            return Err(PapertraderError::invalid(
                "thresholds must be within 0..=100",
            ));
        }
        if self.sell_threshold > self.buy_threshold {
            return Err(PapertraderError::invalid(format!(
                "sell_threshold {} exceeds buy_threshold {}",
                self.sell_threshold, self.buy_threshold
            )));
        }
        if self.max_positions == 0 {
            return Err(PapertraderError::invalid("max_positions must be at least 1"));
        }
        if !(self.budget_ratio > 0.0 && self.budget_ratio <= 1.0) {
            return Err(PapertraderError::invalid(format!(
                "budget_ratio must be in (0, 1], got {}",
                self.budget_ratio
            )));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> SignalThresholds {
        SignalThresholds {
            buy: self.buy_threshold,
            sell: self.sell_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
    /// At least one holding was marked without a price for this date.
    pub stale: bool,
}

/// Raw outcome of [`simulate`], before metrics and rounding.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub ledger: Ledger,
    /// Daily portfolio values, seeded with the initial balance.
    pub daily_values: Vec<f64>,
    pub equity_curve: Vec<EquityPoint>,
    pub stale_marks: usize,
}

fn at_open(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Run the daily loop. `scorer` returns the total score of an instrument at
/// a bar index, or `None` when it cannot be scored; unscored instruments are
/// neither bought nor sold that day.
pub fn simulate(
    data: &[InstrumentData],
    timeline: &[NaiveDate],
    params: &BacktestParams,
    fees: &FeeSchedule,
    scorer: &mut dyn FnMut(&InstrumentData, usize) -> Option<f64>,
) -> Simulation {
    let by_id: HashMap<InstrumentId, &InstrumentData> =
        data.iter().map(|d| (d.instrument.id, d)).collect();

    let account = Account::new(
        0,
        params.strategy_name.clone(),
        params.initial_balance,
        at_open(params.start_date),
    );
    let mut ledger = Ledger::new(account);
    let mut daily_values = vec![params.initial_balance];
    let mut equity_curve = Vec::with_capacity(timeline.len());
    let mut stale_marks = 0usize;

    for &date in timeline {
        let at = at_open(date);

        // 1) mark
        let mut value = ledger.cash();
        let mut stale = false;
        let held: Vec<InstrumentId> = ledger.positions.keys().copied().collect();
        for id in &held {
            let Some(pos) = ledger.position(*id) else {
                continue;
            };
            let (quantity, avg_price) = (pos.quantity, pos.avg_price);
            let today = by_id.get(id).and_then(|d| d.close_on(date));
            let price = match today {
                Some(price) => {
                    ledger.mark(*id, price, at);
                    price
                }
                None => {
                    stale = true;
                    stale_marks += 1;
                    match params.mark_fallback {
                        MarkFallback::AvgPrice => avg_price,
                        MarkFallback::LastKnown => by_id
                            .get(id)
                            .and_then(|d| d.last_close_on_or_before(date))
                            .unwrap_or(avg_price),
                    }
                }
            };
            value += price * quantity as f64;
        }
        daily_values.push(value);
        equity_curve.push(EquityPoint { date, value, stale });

        // 2) sell pass
        for id in &held {
            let Some(inst) = by_id.get(id) else {
                continue;
            };
            let Some(index) = inst.get_bar_index(date) else {
                continue;
            };
            let Some(score) = scorer(inst, index) else {
                continue;
            };
            if score > params.sell_threshold {
                continue;
            }
            let Some(quantity) = ledger.position(*id).map(|p| p.quantity) else {
                continue;
            };
            let order = Order::new(
                *id,
                inst.instrument.symbol.clone(),
                quantity,
                inst.bars[index].close,
            );
            match ledger.sell(&order, TradeSide::Sell, fees, at) {
                Ok(trade) => tracing::debug!(
                    %date,
                    symbol = %trade.symbol,
                    quantity = trade.quantity,
                    price = trade.price,
                    score,
                    "backtest sell"
                ),
                Err(e) => tracing::warn!(%date, symbol = %order.symbol, error = %e, "backtest sell rejected"),
            }
        }

        // 3) buy pass
        let slots = params.max_positions.saturating_sub(ledger.position_count());
        if slots == 0 {
            continue;
        }

        let mut candidates: Vec<(&InstrumentData, usize, f64)> = Vec::new();
        for inst in data {
            if ledger.holds(inst.instrument.id) {
                continue;
            }
            let Some(index) = inst.get_bar_index(date) else {
                continue;
            };
            if let Some(score) = scorer(inst, index) {
                if score >= params.buy_threshold {
                    candidates.push((inst, index, score));
                }
            }
        }
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));
        candidates.truncate(slots);

        let budget_per_instrument = ledger.cash() * params.budget_ratio / candidates.len() as f64;
        for (inst, index, score) in candidates {
            let price = inst.bars[index].close;
            let quantity = fees.affordable_quantity(budget_per_instrument, price);
            if quantity <= 0 {
                continue;
            }
            let order = Order::new(inst.instrument.id, inst.instrument.symbol.clone(), quantity, price);
            match ledger.buy(&order, fees, at) {
                Ok(trade) => tracing::debug!(
                    %date,
                    symbol = %trade.symbol,
                    quantity = trade.quantity,
                    price = trade.price,
                    score,
                    "backtest buy"
                ),
                Err(e) => tracing::debug!(%date, symbol = %order.symbol, error = %e, "backtest buy skipped"),
            }
        }
    }

    // liquidate at the last known close
    if let Some(&last_date) = timeline.last() {
        let at = at_open(last_date);
        let held: Vec<(InstrumentId, String, i64, f64)> = ledger
            .positions
            .values()
            .map(|p| (p.instrument_id, p.symbol.clone(), p.quantity, p.avg_price))
            .collect();
        for (id, symbol, quantity, avg_price) in held {
            let inst = by_id.get(&id);
            if inst.and_then(|d| d.close_on(last_date)).is_none() {
                stale_marks += 1;
            }
            let price = inst
                .and_then(|d| d.last_close_on_or_before(last_date))
                .unwrap_or(avg_price);
            let order = Order::new(id, symbol, quantity, price);
            if let Err(e) = ledger.sell(&order, TradeSide::SellClose, fees, at) {
                tracing::warn!(symbol = %order.symbol, error = %e, "final liquidation failed");
            }
        }
    }

    Simulation {
        ledger,
        daily_values,
        equity_curve,
        stale_marks,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestResult {
    pub id: Option<i64>,
    pub params: BacktestParams,
    pub final_balance: f64,
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: usize,
    pub win_trades: usize,
    pub stale_marks: usize,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub created_at: NaiveDateTime,
}

impl BacktestResult {
    /// Compute metrics and apply output rounding: balance to whole units,
    /// percentages to 2 decimals, Sharpe to 4.
    pub fn from_simulation(params: BacktestParams, sim: Simulation, created_at: NaiveDateTime) -> Self {
        let final_balance = sim.ledger.cash();
        let metrics = Metrics::compute(
            params.initial_balance,
            final_balance,
            &sim.daily_values,
            &sim.ledger.trades,
        );

        BacktestResult {
            id: None,
            params,
            final_balance: round_to(final_balance, 0),
            total_return: round_to(metrics.total_return, 2),
            sharpe_ratio: round_to(metrics.sharpe_ratio, 4),
            max_drawdown: round_to(metrics.max_drawdown, 2),
            win_rate: round_to(metrics.win_rate, 2),
            total_trades: metrics.total_trades,
            win_trades: metrics.win_trades,
            stale_marks: sim.stale_marks,
            trades: sim.ledger.trades,
            equity_curve: sim.equity_curve,
            created_at,
        }
    }
}
