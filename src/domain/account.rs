//! Virtual account, position and trade entities.

use chrono::NaiveDateTime;
use std::fmt;
use std::str::FromStr;

use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::InstrumentId;

pub type AccountId = i64;

pub const DEFAULT_INITIAL_BALANCE: f64 = 10_000_000.0;

/// Cash ledger of one virtual account. `current_balance` is cash only.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub total_profit_loss: f64,
    pub total_trades: usize,
    pub win_trades: usize,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Account {
    pub fn new(id: AccountId, name: impl Into<String>, initial_balance: f64, at: NaiveDateTime) -> Self {
        Account {
            id,
            name: name.into(),
            initial_balance,
            current_balance: initial_balance,
            total_profit_loss: 0.0,
            total_trades: 0,
            win_trades: 0,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.win_trades as f64 / self.total_trades as f64 * 100.0
    }
}

/// Holding of one instrument in one account. Exists only while quantity > 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub symbol: String,
    pub quantity: i64,
    pub avg_price: f64,
    pub current_price: Option<f64>,
    pub updated_at: NaiveDateTime,
}

impl Position {
    /// Last marked price, or cost basis if the position was never marked.
    pub fn mark_price(&self) -> f64 {
        self.current_price.unwrap_or(self.avg_price)
    }

    pub fn market_value(&self) -> f64 {
        self.mark_price() * self.quantity as f64
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.mark_price() - self.avg_price) * self.quantity as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeSide {
    Buy,
    Sell,
    /// Forced liquidation at the end of a backtest.
    SellClose,
}

impl TradeSide {
    pub fn is_sell(&self) -> bool {
        matches!(self, TradeSide::Sell | TradeSide::SellClose)
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
            TradeSide::SellClose => write!(f, "SELL(CLOSE)"),
        }
    }
}

impl FromStr for TradeSide {
    type Err = PapertraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            "SELL(CLOSE)" => Ok(TradeSide::SellClose),
            other => Err(PapertraderError::invalid(format!(
                "unknown trade side '{}'",
                other
            ))),
        }
    }
}

/// Immutable record of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub id: Option<i64>,
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: i64,
    pub price: f64,
    pub total_amount: f64,
    pub commission: f64,
    pub tax: f64,
    /// `None` for buys.
    pub realized_pnl: Option<f64>,
    pub executed_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSummary {
    pub account_id: AccountId,
    pub name: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub total_position_value: f64,
    pub total_assets: f64,
    pub total_return_rate: f64,
    pub total_profit_loss: f64,
    pub total_trades: usize,
    pub win_trades: usize,
    pub win_rate: f64,
    pub positions: usize,
}

pub fn summarize(account: &Account, positions: &[Position]) -> AccountSummary {
    let total_position_value: f64 = positions.iter().map(Position::market_value).sum();
    let total_assets = account.current_balance + total_position_value;
    let total_return_rate = if account.initial_balance > 0.0 {
        (total_assets - account.initial_balance) / account.initial_balance * 100.0
    } else {
        0.0
    };

    AccountSummary {
        account_id: account.id,
        name: account.name.clone(),
        initial_balance: account.initial_balance,
        current_balance: account.current_balance,
        total_position_value,
        total_assets,
        total_return_rate: round_to(total_return_rate, 2),
        total_profit_loss: account.total_profit_loss,
        total_trades: account.total_trades,
        win_trades: account.win_trades,
        win_rate: round_to(account.win_rate(), 2),
        positions: positions.len(),
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
