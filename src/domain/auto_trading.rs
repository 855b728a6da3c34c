//! Automated-trading rules.
//!
//! A rule ties one account to a score-driven buy round and a sell-everything
//! round. Schedules are stored as five-field cron expressions for whatever
//! runs the rounds; nothing here interprets them beyond shape.

use chrono::NaiveDateTime;

use crate::domain::account::AccountId;
use crate::domain::backtest::{DEFAULT_BUDGET_RATIO, DEFAULT_MAX_POSITIONS};
use crate::domain::error::PapertraderError;
use crate::domain::scoring::DEFAULT_BUY_THRESHOLD;

pub type RuleId = i64;

pub const DEFAULT_STRATEGY_TYPE: &str = "SCORE";
/// Weekdays at 09:30.
pub const DEFAULT_BUY_SCHEDULE: &str = "30 9 * * 1-5";
/// Weekdays at 15:00.
pub const DEFAULT_SELL_SCHEDULE: &str = "0 15 * * 1-5";

#[derive(Debug, Clone, PartialEq)]
pub struct AutoTradingRule {
    pub id: RuleId,
    pub name: String,
    pub strategy_type: String,
    pub account_id: AccountId,
    pub buy_score_threshold: f64,
    pub max_position_count: usize,
    pub budget_ratio: f64,
    pub schedule_buy: Option<String>,
    pub schedule_sell: Option<String>,
    pub is_active: bool,
    pub last_executed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl AutoTradingRule {
    /// New active rule from `settings`, never executed.
    pub fn new(id: RuleId, settings: RuleSettings, at: NaiveDateTime) -> Self {
        AutoTradingRule {
            id,
            name: settings.name,
            strategy_type: settings.strategy_type,
            account_id: settings.account_id,
            buy_score_threshold: settings.buy_score_threshold,
            max_position_count: settings.max_position_count,
            budget_ratio: settings.budget_ratio,
            schedule_buy: settings.schedule_buy,
            schedule_sell: settings.schedule_sell,
            is_active: true,
            last_executed_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn buy_schedule(&self) -> &str {
        self.schedule_buy.as_deref().unwrap_or(DEFAULT_BUY_SCHEDULE)
    }

    pub fn sell_schedule(&self) -> &str {
        self.schedule_sell.as_deref().unwrap_or(DEFAULT_SELL_SCHEDULE)
    }

    pub fn validate(&self) -> Result<(), PapertraderError> {
        validate_fields(
            &self.name,
            self.buy_score_threshold,
            self.max_position_count,
            self.budget_ratio,
            [self.schedule_buy.as_deref(), self.schedule_sell.as_deref()],
        )
    }

    /// Apply the set fields of `update`, then validate the result. On error
    /// the rule is left unchanged.
    pub fn apply(&mut self, update: &RuleUpdate, at: NaiveDateTime) -> Result<(), PapertraderError> {
        let mut next = self.clone();
        if let Some(name) = &update.name {
            next.name = name.trim().to_string();
        }
        if let Some(strategy_type) = &update.strategy_type {
            next.strategy_type = strategy_type.clone();
        }
        if let Some(threshold) = update.buy_score_threshold {
            next.buy_score_threshold = threshold;
        }
        if let Some(count) = update.max_position_count {
            next.max_position_count = count;
        }
        if let Some(ratio) = update.budget_ratio {
            next.budget_ratio = ratio;
        }
        if let Some(schedule) = &update.schedule_buy {
            next.schedule_buy = Some(schedule.clone());
        }
        if let Some(schedule) = &update.schedule_sell {
            next.schedule_sell = Some(schedule.clone());
        }
        if let Some(active) = update.is_active {
            next.is_active = active;
        }
        next.validate()?;
        next.updated_at = at;
        *self = next;
        Ok(())
    }
}

/// Fields a caller chooses when creating a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSettings {
    pub name: String,
    pub strategy_type: String,
    pub account_id: AccountId,
    pub buy_score_threshold: f64,
    pub max_position_count: usize,
    pub budget_ratio: f64,
    pub schedule_buy: Option<String>,
    pub schedule_sell: Option<String>,
}

impl RuleSettings {
    pub fn new(name: impl Into<String>, account_id: AccountId) -> Self {
        RuleSettings {
            name: name.into(),
            strategy_type: DEFAULT_STRATEGY_TYPE.to_string(),
            account_id,
            buy_score_threshold: DEFAULT_BUY_THRESHOLD,
            max_position_count: DEFAULT_MAX_POSITIONS,
            budget_ratio: DEFAULT_BUDGET_RATIO,
            schedule_buy: None,
            schedule_sell: None,
        }
    }

    pub fn validate(&self) -> Result<(), PapertraderError> {
        validate_fields(
            &self.name,
            self.buy_score_threshold,
            self.max_position_count,
            self.budget_ratio,
            [self.schedule_buy.as_deref(), self.schedule_sell.as_deref()],
        )
    }
}

/// Partial update; `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub strategy_type: Option<String>,
    pub buy_score_threshold: Option<f64>,
    pub max_position_count: Option<usize>,
    pub budget_ratio: Option<f64>,
    pub schedule_buy: Option<String>,
    pub schedule_sell: Option<String>,
    pub is_active: Option<bool>,
}

impl RuleUpdate {
    pub fn is_empty(&self) -> bool {
        *self == RuleUpdate::default()
    }
}

fn validate_fields(
    name: &str,
    buy_score_threshold: f64,
    max_position_count: usize,
    budget_ratio: f64,
    schedules: [Option<&str>; 2],
) -> Result<(), PapertraderError> {
    if name.trim().is_empty() {
        return Err(PapertraderError::invalid("rule name must not be empty"));
    }
    if !(buy_score_threshold.is_finite() && (0.0..=100.0).contains(&buy_score_threshold)) {
        return Err(PapertraderError::invalid(format!(
            "buy_score_threshold must be within 0..=100, got {}",
            buy_score_threshold
        )));
    }
    if max_position_count == 0 {
        return Err(PapertraderError::invalid("max_position_count must be at least 1"));
    }
    if !(budget_ratio > 0.0 && budget_ratio <= 1.0) {
        return Err(PapertraderError::invalid(format!(
            "budget_ratio must be in (0, 1], got {}",
            budget_ratio
        )));
    }
    for schedule in schedules.into_iter().flatten() {
        if schedule.split_whitespace().count() != 5 {
            return Err(PapertraderError::invalid(format!(
                "schedule '{}' is not a five-field cron expression",
                schedule
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn settings_defaults() {
        let s = RuleSettings::new("daily", 7);
        assert_eq!(s.buy_score_threshold, 70.0);
        assert_eq!(s.max_position_count, 5);
        assert_eq!(s.budget_ratio, 0.7);
        assert_eq!(s.strategy_type, "SCORE");
        assert!(s.validate().is_ok());

        let rule = AutoTradingRule::new(1, s, at(9));
        assert!(rule.is_active);
        assert_eq!(rule.last_executed_at, None);
        assert_eq!(rule.buy_schedule(), "30 9 * * 1-5");
        assert_eq!(rule.sell_schedule(), "0 15 * * 1-5");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let base = RuleSettings::new("daily", 1);
        let bad = [
            RuleSettings { name: " ".into(), ..base.clone() },
            RuleSettings { buy_score_threshold: 100.5, ..base.clone() },
            RuleSettings { buy_score_threshold: f64::NAN, ..base.clone() },
            RuleSettings { max_position_count: 0, ..base.clone() },
            RuleSettings { budget_ratio: 0.0, ..base.clone() },
            RuleSettings { budget_ratio: 1.2, ..base.clone() },
            RuleSettings { schedule_buy: Some("9 * *".into()), ..base.clone() },
        ];
        for b in bad {
            assert!(matches!(
                b.validate(),
                Err(PapertraderError::InvalidParameters { .. })
            ));
        }
    }

    #[test]
    fn update_applies_only_set_fields() {
        let mut rule = AutoTradingRule::new(1, RuleSettings::new("daily", 1), at(9));
        let update = RuleUpdate {
            buy_score_threshold: Some(80.0),
            is_active: Some(false),
            ..RuleUpdate::default()
        };
        rule.apply(&update, at(10)).unwrap();

        assert_eq!(rule.buy_score_threshold, 80.0);
        assert!(!rule.is_active);
        assert_eq!(rule.max_position_count, 5);
        assert_eq!(rule.name, "daily");
        assert_eq!(rule.updated_at, at(10));
        assert_eq!(rule.created_at, at(9));
    }

    #[test]
    fn invalid_update_leaves_rule_unchanged() {
        let mut rule = AutoTradingRule::new(1, RuleSettings::new("daily", 1), at(9));
        let before = rule.clone();
        let update = RuleUpdate {
            budget_ratio: Some(2.0),
            is_active: Some(false),
            ..RuleUpdate::default()
        };
        assert!(rule.apply(&update, at(10)).is_err());
        assert_eq!(rule, before);
        assert!(RuleUpdate::default().is_empty());
        assert!(!update.is_empty());
    }
}
