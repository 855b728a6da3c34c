//! Persistence port traits for accounts, scores, backtest results and
//! automated-trading rules.

use chrono::NaiveDateTime;
use std::collections::HashMap;

use crate::domain::account::{Account, AccountId, Position, Trade};
use crate::domain::auto_trading::{AutoTradingRule, RuleId, RuleSettings};
use crate::domain::backtest::BacktestResult;
use crate::domain::error::PapertraderError;
use crate::domain::ledger::Execution;
use crate::domain::ohlcv::InstrumentId;
use crate::domain::scoring::ScoreSnapshot;

/// Plans one execution from the current account and position.
pub type PlanFn<'a> =
    dyn FnMut(&Account, Option<&Position>) -> Result<Execution, PapertraderError> + 'a;

pub trait AccountRepository: Send + Sync {
    fn create_account(
        &self,
        name: &str,
        initial_balance: f64,
        at: NaiveDateTime,
    ) -> Result<Account, PapertraderError>;

    fn get_account(&self, account_id: AccountId) -> Result<Option<Account>, PapertraderError>;

    fn list_accounts(&self) -> Result<Vec<Account>, PapertraderError>;

    fn get_position(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Position>, PapertraderError>;

    fn list_positions(&self, account_id: AccountId) -> Result<Vec<Position>, PapertraderError>;

    /// Newest first, at most `limit`.
    fn list_trades(
        &self,
        account_id: AccountId,
        limit: usize,
    ) -> Result<Vec<Trade>, PapertraderError>;

    /// Load the account and its position in `instrument_id`, plan an
    /// execution from that state and persist it, with no other writer to
    /// the account in between, across every handle onto the same store.
    /// Account, position and trade change together or not at all. A
    /// planning error is returned unchanged and nothing is written.
    /// Returns the stored trade with its id assigned.
    fn execute_atomic(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        plan: &mut PlanFn<'_>,
    ) -> Result<Trade, PapertraderError>;

    /// Re-mark held positions; instruments not held are ignored. Returns the
    /// number of positions updated.
    fn save_marks(
        &self,
        account_id: AccountId,
        prices: &HashMap<InstrumentId, f64>,
        at: NaiveDateTime,
    ) -> Result<usize, PapertraderError>;
}

pub trait ScoreRepository: Send + Sync {
    fn save_score(&self, snapshot: &ScoreSnapshot) -> Result<i64, PapertraderError>;

    /// Newest snapshot per instrument, best total score first.
    fn latest_scores(&self, limit: usize) -> Result<Vec<ScoreSnapshot>, PapertraderError>;
}

pub trait BacktestRepository: Send + Sync {
    fn save_backtest(&self, result: &BacktestResult) -> Result<i64, PapertraderError>;

    fn get_backtest(&self, id: i64) -> Result<Option<BacktestResult>, PapertraderError>;

    /// Newest first, at most `limit`.
    fn list_backtests(&self, limit: usize) -> Result<Vec<BacktestResult>, PapertraderError>;
}

pub trait RuleRepository: Send + Sync {
    /// Store a new active rule and return it with its id assigned.
    fn create_rule(
        &self,
        settings: &RuleSettings,
        at: NaiveDateTime,
    ) -> Result<AutoTradingRule, PapertraderError>;

    fn get_rule(&self, rule_id: RuleId) -> Result<Option<AutoTradingRule>, PapertraderError>;

    /// Oldest first.
    fn list_rules(&self) -> Result<Vec<AutoTradingRule>, PapertraderError>;

    /// Overwrite the stored rule with the same id. Fails with
    /// `RuleNotFound` if there is none.
    fn save_rule(&self, rule: &AutoTradingRule) -> Result<(), PapertraderError>;

    /// Returns false if there was no such rule.
    fn delete_rule(&self, rule_id: RuleId) -> Result<bool, PapertraderError>;
}
