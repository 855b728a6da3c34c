//! Order execution against a virtual account.
//!
//! Execution is split in two steps. `plan_buy`/`plan_sell` check an order
//! against the current account and position and compute the full new state
//! without touching anything. The resulting [`Execution`] is then committed
//! as a unit, either to an in-memory [`Ledger`] or by a repository in one
//! transaction. A rejected order never produces an `Execution`, so a failed
//! buy or sell cannot leave partial state behind.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;

use crate::domain::account::{summarize, Account, AccountSummary, Position, Trade, TradeSide};
use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::InstrumentId;

pub const BUY_COMMISSION_RATE: f64 = 0.00015;
pub const SELL_COMMISSION_RATE: f64 = 0.00015;
pub const SELL_TAX_RATE: f64 = 0.0023;

/// Commission and tax rates applied to every execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeSchedule {
    pub buy_commission_rate: f64,
    pub sell_commission_rate: f64,
    pub sell_tax_rate: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        FeeSchedule {
            buy_commission_rate: BUY_COMMISSION_RATE,
            sell_commission_rate: SELL_COMMISSION_RATE,
            sell_tax_rate: SELL_TAX_RATE,
        }
    }
}

impl FeeSchedule {
    pub fn buy_commission(&self, total_amount: f64) -> f64 {
        total_amount * self.buy_commission_rate
    }

    pub fn sell_commission(&self, total_amount: f64) -> f64 {
        total_amount * self.sell_commission_rate
    }

    pub fn sell_tax(&self, total_amount: f64) -> f64 {
        total_amount * self.sell_tax_rate
    }

    /// Whole units affordable with `budget` at `price`, commission included.
    pub fn affordable_quantity(&self, budget: f64, price: f64) -> i64 {
        if budget <= 0.0 || price <= 0.0 {
            return 0;
        }
        (budget / (price * (1.0 + self.buy_commission_rate))).floor() as i64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub instrument_id: InstrumentId,
    pub symbol: String,
    pub quantity: i64,
    pub price: f64,
}

impl Order {
    pub fn new(instrument_id: InstrumentId, symbol: impl Into<String>, quantity: i64, price: f64) -> Self {
        Order {
            instrument_id,
            symbol: symbol.into(),
            quantity,
            price,
        }
    }

    pub fn validate(&self) -> Result<(), PapertraderError> {
        if self.quantity <= 0 {
            return Err(PapertraderError::invalid(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(PapertraderError::invalid(format!(
                "price must be positive, got {}",
                self.price
            )));
        }
        Ok(())
    }

    pub fn total_amount(&self) -> f64 {
        self.price * self.quantity as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionUpdate {
    Upsert(Position),
    Remove(InstrumentId),
}

/// Complete post-trade state for one account: committed together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub account: Account,
    pub position: PositionUpdate,
    pub trade: Trade,
}

pub fn plan_buy(
    account: &Account,
    existing: Option<&Position>,
    order: &Order,
    fees: &FeeSchedule,
    at: NaiveDateTime,
) -> Result<Execution, PapertraderError> {
    order.validate()?;

    let total_amount = order.total_amount();
    let commission = fees.buy_commission(total_amount);
    let required = total_amount + commission;

    if account.current_balance < required {
        return Err(PapertraderError::InsufficientFunds {
            required,
            available: account.current_balance,
        });
    }

    let mut next_account = account.clone();
    next_account.current_balance -= required;
    next_account.updated_at = at;

    let position = match existing {
        Some(pos) => {
            let quantity = pos.quantity + order.quantity;
            let cost = pos.avg_price * pos.quantity as f64 + total_amount;
            Position {
                quantity,
                avg_price: cost / quantity as f64,
                current_price: Some(order.price),
                updated_at: at,
                ..pos.clone()
            }
        }
        None => Position {
            account_id: account.id,
            instrument_id: order.instrument_id,
            symbol: order.symbol.clone(),
            quantity: order.quantity,
            avg_price: order.price,
            current_price: Some(order.price),
            updated_at: at,
        },
    };

    let trade = Trade {
        id: None,
        account_id: account.id,
        instrument_id: order.instrument_id,
        symbol: order.symbol.clone(),
        side: TradeSide::Buy,
        quantity: order.quantity,
        price: order.price,
        total_amount,
        commission,
        tax: 0.0,
        realized_pnl: None,
        executed_at: at,
    };

    Ok(Execution {
        account: next_account,
        position: PositionUpdate::Upsert(position),
        trade,
    })
}

pub fn plan_sell(
    account: &Account,
    existing: Option<&Position>,
    order: &Order,
    side: TradeSide,
    fees: &FeeSchedule,
    at: NaiveDateTime,
) -> Result<Execution, PapertraderError> {
    order.validate()?;
    if !side.is_sell() {
        return Err(PapertraderError::invalid("sell requires a SELL side"));
    }

    let held = existing.map(|p| p.quantity).unwrap_or(0);
    let pos = match existing {
        Some(pos) if pos.quantity >= order.quantity => pos,
        _ => {
            return Err(PapertraderError::InsufficientPosition {
                held,
                requested: order.quantity,
            });
        }
    };

    let total_amount = order.total_amount();
    let commission = fees.sell_commission(total_amount);
    let tax = fees.sell_tax(total_amount);
    let net_amount = total_amount - commission - tax;
    let realized_pnl = net_amount - pos.avg_price * order.quantity as f64;

    let mut next_account = account.clone();
    next_account.current_balance += net_amount;
    next_account.total_profit_loss += realized_pnl;
    next_account.total_trades += 1;
    if realized_pnl > 0.0 {
        next_account.win_trades += 1;
    }
    next_account.updated_at = at;

    let remaining = pos.quantity - order.quantity;
    let position = if remaining == 0 {
        PositionUpdate::Remove(pos.instrument_id)
    } else {
        PositionUpdate::Upsert(Position {
            quantity: remaining,
            current_price: Some(order.price),
            updated_at: at,
            ..pos.clone()
        })
    };

    let trade = Trade {
        id: None,
        account_id: account.id,
        instrument_id: order.instrument_id,
        symbol: order.symbol.clone(),
        side,
        quantity: order.quantity,
        price: order.price,
        total_amount,
        commission,
        tax,
        realized_pnl: Some(realized_pnl),
        executed_at: at,
    };

    Ok(Execution {
        account: next_account,
        position,
        trade,
    })
}

/// In-memory account with its positions and trade history.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    pub account: Account,
    pub positions: BTreeMap<InstrumentId, Position>,
    pub trades: Vec<Trade>,
}

impl Ledger {
    pub fn new(account: Account) -> Self {
        Ledger {
            account,
            positions: BTreeMap::new(),
            trades: Vec::new(),
        }
    }

    pub fn position(&self, instrument_id: InstrumentId) -> Option<&Position> {
        self.positions.get(&instrument_id)
    }

    pub fn holds(&self, instrument_id: InstrumentId) -> bool {
        self.positions.contains_key(&instrument_id)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn cash(&self) -> f64 {
        self.account.current_balance
    }

    pub fn buy(
        &mut self,
        order: &Order,
        fees: &FeeSchedule,
        at: NaiveDateTime,
    ) -> Result<&Trade, PapertraderError> {
        let execution = plan_buy(
            &self.account,
            self.positions.get(&order.instrument_id),
            order,
            fees,
            at,
        )?;
        Ok(self.apply(execution))
    }

    pub fn sell(
        &mut self,
        order: &Order,
        side: TradeSide,
        fees: &FeeSchedule,
        at: NaiveDateTime,
    ) -> Result<&Trade, PapertraderError> {
        let execution = plan_sell(
            &self.account,
            self.positions.get(&order.instrument_id),
            order,
            side,
            fees,
            at,
        )?;
        Ok(self.apply(execution))
    }

    pub fn apply(&mut self, execution: Execution) -> &Trade {
        self.account = execution.account;
        match execution.position {
            PositionUpdate::Upsert(pos) => {
                self.positions.insert(pos.instrument_id, pos);
            }
            PositionUpdate::Remove(instrument_id) => {
                self.positions.remove(&instrument_id);
            }
        }
        self.trades.push(execution.trade);
        &self.trades[self.trades.len() - 1]
    }

    /// Re-mark a held position. Returns false if nothing is held.
    pub fn mark(&mut self, instrument_id: InstrumentId, price: f64, at: NaiveDateTime) -> bool {
        match self.positions.get_mut(&instrument_id) {
            Some(pos) => {
                pos.current_price = Some(price);
                pos.updated_at = at;
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> AccountSummary {
        let positions: Vec<Position> = self.positions.values().cloned().collect();
        summarize(&self.account, &positions)
    }
}
