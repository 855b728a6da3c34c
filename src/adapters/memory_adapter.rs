//! In-process store implementing every data and repository port. Used by
//! tests and by CSV-only runs that need nowhere durable to write.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::domain::account::{Account, AccountId, Position, Trade};
use crate::domain::auto_trading::{AutoTradingRule, RuleId, RuleSettings};
use crate::domain::backtest::BacktestResult;
use crate::domain::error::PapertraderError;
use crate::domain::ledger::{Execution, PositionUpdate};
use crate::domain::ohlcv::{Instrument, InstrumentId, OhlcvBar};
use crate::domain::scoring::ScoreSnapshot;
use crate::ports::data_port::MarketDataPort;
use crate::ports::repository_port::{
    AccountRepository, BacktestRepository, PlanFn, RuleRepository, ScoreRepository,
};

#[derive(Default)]
struct Inner {
    instruments: BTreeMap<InstrumentId, Instrument>,
    bars: HashMap<InstrumentId, BTreeMap<NaiveDate, OhlcvBar>>,
    accounts: BTreeMap<AccountId, Account>,
    positions: BTreeMap<(AccountId, InstrumentId), Position>,
    trades: Vec<Trade>,
    scores: Vec<ScoreSnapshot>,
    backtests: Vec<BacktestResult>,
    rules: BTreeMap<RuleId, AutoTradingRule>,
    last_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn apply(&mut self, execution: &Execution) -> Trade {
        let account_id = execution.account.id;
        self.accounts.insert(account_id, execution.account.clone());
        match &execution.position {
            PositionUpdate::Upsert(pos) => {
                self.positions
                    .insert((account_id, pos.instrument_id), pos.clone());
            }
            PositionUpdate::Remove(instrument_id) => {
                self.positions.remove(&(account_id, *instrument_id));
            }
        }

        let mut trade = execution.trade.clone();
        trade.id = Some(self.next_id());
        self.trades.push(trade.clone());
        trade
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_instrument(&self, instrument: Instrument) {
        self.lock().instruments.insert(instrument.id, instrument);
    }

    /// Store bars, registering unknown instruments from the bar's id and
    /// symbol. A bar for an existing date replaces it.
    pub fn insert_bars(&self, bars: &[OhlcvBar]) {
        let mut inner = self.lock();
        for bar in bars {
            inner
                .instruments
                .entry(bar.instrument_id)
                .or_insert_with(|| Instrument::new(bar.instrument_id, bar.symbol.clone()));
            inner
                .bars
                .entry(bar.instrument_id)
                .or_default()
                .insert(bar.date, bar.clone());
        }
    }
}

impl MarketDataPort for MemoryStore {
    fn list_instruments(&self) -> Result<Vec<Instrument>, PapertraderError> {
        Ok(self.lock().instruments.values().cloned().collect())
    }

    fn fetch_prices(
        &self,
        instrument_id: InstrumentId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        if start_date > end_date {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()
            .bars
            .get(&instrument_id)
            .map(|m| m.range(start_date..=end_date).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    fn fetch_recent(
        &self,
        instrument_id: InstrumentId,
        limit: usize,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        let inner = self.lock();
        let Some(bars) = inner.bars.get(&instrument_id) else {
            return Ok(Vec::new());
        };
        let mut recent: Vec<OhlcvBar> = bars.values().rev().take(limit).cloned().collect();
        recent.reverse();
        Ok(recent)
    }
}

impl AccountRepository for MemoryStore {
    fn create_account(
        &self,
        name: &str,
        initial_balance: f64,
        at: NaiveDateTime,
    ) -> Result<Account, PapertraderError> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let account = Account::new(id, name, initial_balance, at);
        inner.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn get_account(&self, account_id: AccountId) -> Result<Option<Account>, PapertraderError> {
        Ok(self.lock().accounts.get(&account_id).cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>, PapertraderError> {
        Ok(self.lock().accounts.values().cloned().collect())
    }

    fn get_position(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Position>, PapertraderError> {
        Ok(self
            .lock()
            .positions
            .get(&(account_id, instrument_id))
            .cloned())
    }

    fn list_positions(&self, account_id: AccountId) -> Result<Vec<Position>, PapertraderError> {
        Ok(self
            .lock()
            .positions
            .range((account_id, InstrumentId::MIN)..=(account_id, InstrumentId::MAX))
            .map(|(_, p)| p.clone())
            .collect())
    }

    fn list_trades(
        &self,
        account_id: AccountId,
        limit: usize,
    ) -> Result<Vec<Trade>, PapertraderError> {
        Ok(self
            .lock()
            .trades
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn execute_atomic(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        plan: &mut PlanFn<'_>,
    ) -> Result<Trade, PapertraderError> {
        let mut inner = self.lock();
        let account = inner
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or(PapertraderError::AccountNotFound { account_id })?;
        let position = inner.positions.get(&(account_id, instrument_id)).cloned();

        let execution = plan(&account, position.as_ref())?;
        Ok(inner.apply(&execution))
    }

    fn save_marks(
        &self,
        account_id: AccountId,
        prices: &HashMap<InstrumentId, f64>,
        at: NaiveDateTime,
    ) -> Result<usize, PapertraderError> {
        let mut inner = self.lock();
        let mut updated = 0;
        for (instrument_id, price) in prices {
            if let Some(pos) = inner.positions.get_mut(&(account_id, *instrument_id)) {
                pos.current_price = Some(*price);
                pos.updated_at = at;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

impl ScoreRepository for MemoryStore {
    fn save_score(&self, snapshot: &ScoreSnapshot) -> Result<i64, PapertraderError> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let mut stored = snapshot.clone();
        stored.id = Some(id);
        inner.scores.push(stored);
        Ok(id)
    }

    fn latest_scores(&self, limit: usize) -> Result<Vec<ScoreSnapshot>, PapertraderError> {
        let inner = self.lock();
        let mut newest: HashMap<InstrumentId, &ScoreSnapshot> = HashMap::new();
        for snapshot in &inner.scores {
            newest.insert(snapshot.instrument_id, snapshot);
        }

        let mut latest: Vec<ScoreSnapshot> = newest.into_values().cloned().collect();
        latest.sort_by(|a, b| {
            b.total_score
                .total_cmp(&a.total_score)
                .then(a.instrument_id.cmp(&b.instrument_id))
        });
        latest.truncate(limit);
        Ok(latest)
    }
}

impl BacktestRepository for MemoryStore {
    fn save_backtest(&self, result: &BacktestResult) -> Result<i64, PapertraderError> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let mut stored = result.clone();
        stored.id = Some(id);
        inner.backtests.push(stored);
        Ok(id)
    }

    fn get_backtest(&self, id: i64) -> Result<Option<BacktestResult>, PapertraderError> {
        Ok(self
            .lock()
            .backtests
            .iter()
            .find(|r| r.id == Some(id))
            .cloned())
    }

    fn list_backtests(&self, limit: usize) -> Result<Vec<BacktestResult>, PapertraderError> {
        Ok(self
            .lock()
            .backtests
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

impl RuleRepository for MemoryStore {
    fn create_rule(
        &self,
        settings: &RuleSettings,
        at: NaiveDateTime,
    ) -> Result<AutoTradingRule, PapertraderError> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let rule = AutoTradingRule::new(id, settings.clone(), at);
        inner.rules.insert(id, rule.clone());
        Ok(rule)
    }

    fn get_rule(&self, rule_id: RuleId) -> Result<Option<AutoTradingRule>, PapertraderError> {
        Ok(self.lock().rules.get(&rule_id).cloned())
    }

    fn list_rules(&self) -> Result<Vec<AutoTradingRule>, PapertraderError> {
        Ok(self.lock().rules.values().cloned().collect())
    }

    fn save_rule(&self, rule: &AutoTradingRule) -> Result<(), PapertraderError> {
        match self.lock().rules.get_mut(&rule.id) {
            Some(stored) => {
                *stored = rule.clone();
                Ok(())
            }
            None => Err(PapertraderError::RuleNotFound { rule_id: rule.id }),
        }
    }

    fn delete_rule(&self, rule_id: RuleId) -> Result<bool, PapertraderError> {
        Ok(self.lock().rules.remove(&rule_id).is_some())
    }
}
