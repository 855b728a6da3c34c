//! Virtual trading against persisted accounts.
//!
//! Every order runs load, plan and commit as one
//! [`AccountRepository::execute_atomic`] call, which the repository
//! serializes per account across engines and processes sharing the store.
//! Within one engine, callers on the same account also queue on an
//! in-process lock; different accounts never share one.

use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::account::{
    summarize, Account, AccountId, AccountSummary, Position, Trade, TradeSide,
    DEFAULT_INITIAL_BALANCE,
};
use crate::domain::error::PapertraderError;
use crate::domain::ledger::{plan_buy, plan_sell, Execution, FeeSchedule, Order};
use crate::domain::ohlcv::InstrumentId;
use crate::ports::repository_port::AccountRepository;

/// Result of a buy or sell request. Rejections are reported here rather than
/// as errors.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeOutcome {
    pub success: bool,
    pub message: String,
    pub trade: Option<Trade>,
}

impl TradeOutcome {
    fn filled(trade: Trade) -> Self {
        let verb = if trade.side.is_sell() { "sold" } else { "bought" };
        TradeOutcome {
            success: true,
            message: format!(
                "{} {} {} @ {:.2}",
                verb, trade.quantity, trade.symbol, trade.price
            ),
            trade: Some(trade),
        }
    }

    fn rejected(err: &PapertraderError) -> Self {
        TradeOutcome {
            success: false,
            message: err.to_string(),
            trade: None,
        }
    }
}

pub struct TradingEngine {
    accounts: Arc<dyn AccountRepository>,
    fees: FeeSchedule,
    locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl TradingEngine {
    pub fn new(accounts: Arc<dyn AccountRepository>) -> Self {
        Self::with_fees(accounts, FeeSchedule::default())
    }

    pub fn with_fees(accounts: Arc<dyn AccountRepository>, fees: FeeSchedule) -> Self {
        Self {
            accounts,
            fees,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    /// Run `f` holding this engine's lock for `account_id`. The map entry is
    /// dropped once no other caller holds or waits on it.
    fn with_account_lock<T>(&self, account_id: AccountId, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(account_id).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // map entry + ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&account_id);
        }
        result
    }

    /// New account with `initial_balance` (default 10,000,000) in cash.
    pub fn create_account(
        &self,
        name: &str,
        initial_balance: Option<f64>,
    ) -> Result<Account, PapertraderError> {
        let balance = initial_balance.unwrap_or(DEFAULT_INITIAL_BALANCE);
        if !balance.is_finite() || balance <= 0.0 {
            return Err(PapertraderError::invalid(format!(
                "initial balance must be positive, got {}",
                balance
            )));
        }
        if name.trim().is_empty() {
            return Err(PapertraderError::invalid("account name must not be empty"));
        }

        let account = self.accounts.create_account(name.trim(), balance, now())?;
        tracing::info!(account_id = account.id, name = %account.name, balance, "account created");
        Ok(account)
    }

    pub fn get_account(&self, account_id: AccountId) -> Result<Account, PapertraderError> {
        self.accounts
            .get_account(account_id)?
            .ok_or(PapertraderError::AccountNotFound { account_id })
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, PapertraderError> {
        self.accounts.list_accounts()
    }

    pub fn get_account_summary(
        &self,
        account_id: AccountId,
    ) -> Result<AccountSummary, PapertraderError> {
        let account = self.get_account(account_id)?;
        let positions = self.accounts.list_positions(account_id)?;
        Ok(summarize(&account, &positions))
    }

    pub fn get_positions(&self, account_id: AccountId) -> Result<Vec<Position>, PapertraderError> {
        self.get_account(account_id)?;
        self.accounts.list_positions(account_id)
    }

    /// Newest first.
    pub fn get_trades(
        &self,
        account_id: AccountId,
        limit: usize,
    ) -> Result<Vec<Trade>, PapertraderError> {
        self.get_account(account_id)?;
        self.accounts.list_trades(account_id, limit)
    }

    pub fn try_buy(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        symbol: &str,
        quantity: i64,
        price: f64,
    ) -> Result<Trade, PapertraderError> {
        let order = Order::new(instrument_id, symbol, quantity, price);
        order.validate()?;

        self.execute(account_id, &order, |account, existing, at| {
            plan_buy(account, existing, &order, &self.fees, at)
        })
    }

    pub fn try_sell(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        symbol: &str,
        quantity: i64,
        price: f64,
    ) -> Result<Trade, PapertraderError> {
        let order = Order::new(instrument_id, symbol, quantity, price);
        order.validate()?;

        self.execute(account_id, &order, |account, existing, at| {
            plan_sell(account, existing, &order, TradeSide::Sell, &self.fees, at)
        })
    }

    /// Buy, reporting ledger rejections in the outcome. Only storage
    /// failures are returned as errors.
    pub fn buy(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        symbol: &str,
        quantity: i64,
        price: f64,
    ) -> Result<TradeOutcome, PapertraderError> {
        Self::outcome(self.try_buy(account_id, instrument_id, symbol, quantity, price))
    }

    pub fn sell(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        symbol: &str,
        quantity: i64,
        price: f64,
    ) -> Result<TradeOutcome, PapertraderError> {
        Self::outcome(self.try_sell(account_id, instrument_id, symbol, quantity, price))
    }

    fn outcome(result: Result<Trade, PapertraderError>) -> Result<TradeOutcome, PapertraderError> {
        match result {
            Ok(trade) => Ok(TradeOutcome::filled(trade)),
            Err(e) if e.is_rejection() => Ok(TradeOutcome::rejected(&e)),
            Err(e) => Err(e),
        }
    }

    fn execute<F>(
        &self,
        account_id: AccountId,
        order: &Order,
        plan: F,
    ) -> Result<Trade, PapertraderError>
    where
        F: Fn(&Account, Option<&Position>, NaiveDateTime) -> Result<Execution, PapertraderError>,
    {
        let result = self.with_account_lock(account_id, || {
            self.accounts
                .execute_atomic(account_id, order.instrument_id, &mut |account, existing| {
                    plan(account, existing, now())
                })
        });

        match result {
            Ok(trade) => {
                tracing::info!(
                    account_id,
                    side = %trade.side,
                    symbol = %trade.symbol,
                    quantity = trade.quantity,
                    price = trade.price,
                    "trade executed"
                );
                Ok(trade)
            }
            Err(e) => {
                if e.is_rejection() {
                    tracing::warn!(account_id, symbol = %order.symbol, error = %e, "order rejected");
                }
                Err(e)
            }
        }
    }

    /// Re-mark held positions at the given prices. Returns how many were
    /// updated.
    pub fn update_position_prices(
        &self,
        account_id: AccountId,
        prices: &HashMap<InstrumentId, f64>,
    ) -> Result<usize, PapertraderError> {
        let valid: HashMap<InstrumentId, f64> = prices
            .iter()
            .filter(|(_, p)| p.is_finite() && **p > 0.0)
            .map(|(id, p)| (*id, *p))
            .collect();

        let updated = self.with_account_lock(account_id, || {
            self.get_account(account_id)?;
            self.accounts.save_marks(account_id, &valid, now())
        })?;
        tracing::debug!(account_id, updated, "positions re-marked");
        Ok(updated)
    }
}
