//! Rule-driven trading rounds against a live account.
//!
//! A buy round scores every instrument and buys the best ones the rule's
//! account does not hold yet, splitting a share of the cash evenly. A sell
//! round liquidates every position at its latest close. Orders go through
//! the [`TradingEngine`], so rounds serialize with manual orders on the same
//! account.

use chrono::{Local, NaiveDateTime};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::domain::account::Trade;
use crate::domain::auto_trading::{AutoTradingRule, RuleId, RuleSettings, RuleUpdate};
use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::InstrumentId;
use crate::ports::data_port::MarketDataPort;
use crate::ports::repository_port::RuleRepository;
use crate::services::scoring_service::ScoringEngine;
use crate::services::trading_service::{TradeOutcome, TradingEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    Buy,
    Sell,
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Round::Buy => write!(f, "buy"),
            Round::Sell => write!(f, "sell"),
        }
    }
}

/// Orders placed by one round of one rule. Rejected orders are kept with
/// their reason.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub rule_id: RuleId,
    pub round: Round,
    pub orders: Vec<TradeOutcome>,
    pub executed_at: NaiveDateTime,
}

impl RoundReport {
    pub fn filled(&self) -> impl Iterator<Item = &Trade> {
        self.orders.iter().filter_map(|o| o.trade.as_ref())
    }
}

pub struct AutoTrader {
    rules: Arc<dyn RuleRepository>,
    market: Arc<dyn MarketDataPort>,
    scoring: Arc<ScoringEngine>,
    trading: Arc<TradingEngine>,
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl AutoTrader {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        market: Arc<dyn MarketDataPort>,
        scoring: Arc<ScoringEngine>,
        trading: Arc<TradingEngine>,
    ) -> Self {
        Self {
            rules,
            market,
            scoring,
            trading,
        }
    }

    /// Register an active rule for an existing account.
    pub fn create_rule(&self, settings: &RuleSettings) -> Result<AutoTradingRule, PapertraderError> {
        settings.validate()?;
        self.trading.get_account(settings.account_id)?;

        let mut settings = settings.clone();
        settings.name = settings.name.trim().to_string();
        let rule = self.rules.create_rule(&settings, now())?;
        tracing::info!(rule_id = rule.id, name = %rule.name, account_id = rule.account_id, "rule created");
        Ok(rule)
    }

    pub fn get_rule(&self, rule_id: RuleId) -> Result<AutoTradingRule, PapertraderError> {
        self.rules
            .get_rule(rule_id)?
            .ok_or(PapertraderError::RuleNotFound { rule_id })
    }

    pub fn list_rules(&self) -> Result<Vec<AutoTradingRule>, PapertraderError> {
        self.rules.list_rules()
    }

    pub fn update_rule(
        &self,
        rule_id: RuleId,
        update: &RuleUpdate,
    ) -> Result<AutoTradingRule, PapertraderError> {
        let mut rule = self.get_rule(rule_id)?;
        rule.apply(update, now())?;
        self.rules.save_rule(&rule)?;
        tracing::info!(rule_id, active = rule.is_active, "rule updated");
        Ok(rule)
    }

    pub fn delete_rule(&self, rule_id: RuleId) -> Result<(), PapertraderError> {
        if !self.rules.delete_rule(rule_id)? {
            return Err(PapertraderError::RuleNotFound { rule_id });
        }
        tracing::info!(rule_id, "rule deleted");
        Ok(())
    }

    fn active_rule(&self, rule_id: RuleId) -> Result<AutoTradingRule, PapertraderError> {
        let rule = self.get_rule(rule_id)?;
        if !rule.is_active {
            return Err(PapertraderError::invalid(format!("rule {} is inactive", rule_id)));
        }
        Ok(rule)
    }

    fn latest_close(&self, instrument_id: InstrumentId) -> Result<Option<f64>, PapertraderError> {
        Ok(self
            .market
            .fetch_recent(instrument_id, 1)?
            .last()
            .map(|bar| bar.close))
    }

    pub fn execute(&self, rule_id: RuleId, round: Round) -> Result<RoundReport, PapertraderError> {
        match round {
            Round::Buy => self.execute_buy(rule_id),
            Round::Sell => self.execute_sell(rule_id),
        }
    }

    /// Score everything, then buy up to the rule's open slots among
    /// instruments scoring at least its threshold, best first.
    pub fn execute_buy(&self, rule_id: RuleId) -> Result<RoundReport, PapertraderError> {
        let rule = self.active_rule(rule_id)?;
        tracing::info!(rule_id, name = %rule.name, "buy round started");

        let positions = self.trading.get_positions(rule.account_id)?;
        let slots = rule.max_position_count.saturating_sub(positions.len());
        if slots == 0 {
            tracing::info!(
                rule_id,
                held = positions.len(),
                max = rule.max_position_count,
                "position limit reached"
            );
            return self.finish(rule, Round::Buy, Vec::new());
        }
        let held: HashSet<InstrumentId> = positions.iter().map(|p| p.instrument_id).collect();

        let scores = self.scoring.score_all()?;
        let targets: Vec<_> = scores
            .iter()
            .filter(|s| s.total_score >= rule.buy_score_threshold && !held.contains(&s.instrument_id))
            .take(slots)
            .collect();
        if targets.is_empty() {
            tracing::info!(rule_id, threshold = rule.buy_score_threshold, "no buy candidates");
            return self.finish(rule, Round::Buy, Vec::new());
        }

        let account = self.trading.get_account(rule.account_id)?;
        let budget_per_instrument = account.current_balance * rule.budget_ratio / targets.len() as f64;

        let mut orders = Vec::with_capacity(targets.len());
        for snapshot in targets {
            let Some(price) = self.latest_close(snapshot.instrument_id)? else {
                tracing::debug!(symbol = %snapshot.symbol, "no price, skipped");
                continue;
            };
            let quantity = self.trading.fees().affordable_quantity(budget_per_instrument, price);
            if quantity <= 0 {
                tracing::debug!(symbol = %snapshot.symbol, price, "budget too small, skipped");
                continue;
            }

            let outcome = self.trading.buy(
                rule.account_id,
                snapshot.instrument_id,
                &snapshot.symbol,
                quantity,
                price,
            )?;
            if outcome.success {
                tracing::info!(
                    rule_id,
                    symbol = %snapshot.symbol,
                    quantity,
                    score = snapshot.total_score,
                    "auto buy"
                );
            }
            orders.push(outcome);
        }

        self.finish(rule, Round::Buy, orders)
    }

    /// Sell every position in full at its latest close, or at its average
    /// price when it has no price history.
    pub fn execute_sell(&self, rule_id: RuleId) -> Result<RoundReport, PapertraderError> {
        let rule = self.active_rule(rule_id)?;
        tracing::info!(rule_id, name = %rule.name, "sell round started");

        let positions = self.trading.get_positions(rule.account_id)?;
        let mut orders = Vec::with_capacity(positions.len());
        for pos in positions {
            let price = self.latest_close(pos.instrument_id)?.unwrap_or(pos.avg_price);
            let outcome = self.trading.sell(
                rule.account_id,
                pos.instrument_id,
                &pos.symbol,
                pos.quantity,
                price,
            )?;
            if let Some(trade) = &outcome.trade {
                tracing::info!(
                    rule_id,
                    symbol = %trade.symbol,
                    quantity = trade.quantity,
                    pnl = trade.realized_pnl.unwrap_or(0.0),
                    "auto sell"
                );
            }
            orders.push(outcome);
        }

        self.finish(rule, Round::Sell, orders)
    }

    /// Run `round` for every active rule. A failing rule is logged and does
    /// not stop the others.
    pub fn run_active(&self, round: Round) -> Result<Vec<RoundReport>, PapertraderError> {
        let rules = self.rules.list_rules()?;
        let mut reports = Vec::new();
        for rule in rules.iter().filter(|r| r.is_active) {
            match self.execute(rule.id, round) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(rule_id = rule.id, %round, error = %e, "round failed"),
            }
        }
        Ok(reports)
    }

    fn finish(
        &self,
        mut rule: AutoTradingRule,
        round: Round,
        orders: Vec<TradeOutcome>,
    ) -> Result<RoundReport, PapertraderError> {
        let at = now();
        rule.last_executed_at = Some(at);
        rule.updated_at = at;
        self.rules.save_rule(&rule)?;

        tracing::info!(
            rule_id = rule.id,
            %round,
            orders = orders.len(),
            filled = orders.iter().filter(|o| o.success).count(),
            "round complete"
        );
        Ok(RoundReport {
            rule_id: rule.id,
            round,
            orders,
            executed_at: at,
        })
    }
}
