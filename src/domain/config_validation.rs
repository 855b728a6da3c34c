//! Configuration validation and typed loading.
//!
//! Validates every config field before a run and turns the INI sections into
//! typed values: [`BacktestParams`], [`FeeSchedule`] and the data source.

use std::str::FromStr;

use crate::domain::account::DEFAULT_INITIAL_BALANCE;
use crate::domain::backtest::{BacktestParams, MarkFallback};
use crate::domain::error::PapertraderError;
use crate::domain::ledger::FeeSchedule;
use crate::domain::scoring::{DEFAULT_BUY_THRESHOLD, DEFAULT_SELL_THRESHOLD};
use crate::ports::config_port::ConfigPort;
use chrono::NaiveDate;

pub const DEFAULT_STRATEGY_NAME: &str = "scoring";
pub const DEFAULT_WARMUP_DAYS: i64 = 365;
pub const DEFAULT_LOOKBACK_BARS: usize = 250;
pub const DEFAULT_POOL_SIZE: u32 = 4;

/// Where price history is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Database(String),
    CsvDir(String),
}

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), PapertraderError> {
    load_backtest_params(config)?.validate().map_err(|e| match e {
        PapertraderError::InvalidParameters { reason } => invalid("backtest", "parameters", reason),
        other => other,
    })?;
    warmup_days(config)?;
    fee_schedule(config)?;
    data_source(config)?;
    Ok(())
}

pub fn load_backtest_params(config: &dyn ConfigPort) -> Result<BacktestParams, PapertraderError> {
    let start_date = parse_date(config, "start_date")?;
    let end_date = parse_date(config, "end_date")?;
    if start_date > end_date {
        return Err(invalid(
            "backtest",
            "start_date",
            "start_date must not be after end_date",
        ));
    }

    let initial_balance = read_double(config, "backtest", "initial_balance", DEFAULT_INITIAL_BALANCE)?;
    if initial_balance <= 0.0 {
        return Err(invalid(
            "backtest",
            "initial_balance",
            "initial_balance must be positive",
        ));
    }

    let buy_threshold = read_double(config, "backtest", "buy_threshold", DEFAULT_BUY_THRESHOLD)?;
    let sell_threshold = read_double(config, "backtest", "sell_threshold", DEFAULT_SELL_THRESHOLD)?;
    for (key, value) in [("buy_threshold", buy_threshold), ("sell_threshold", sell_threshold)] {
        if !(0.0..=100.0).contains(&value) {
            return Err(invalid("backtest", key, format!("{} must be between 0 and 100", key)));
        }
    }
    if sell_threshold > buy_threshold {
        return Err(invalid(
            "backtest",
            "sell_threshold",
            "sell_threshold must not exceed buy_threshold",
        ));
    }

    let max_positions = read_int(config, "backtest", "max_positions", 5)?;
    if max_positions < 1 {
        return Err(invalid(
            "backtest",
            "max_positions",
            "max_positions must be at least 1",
        ));
    }

    let budget_ratio = read_double(config, "backtest", "budget_ratio", 0.7)?;
    if budget_ratio <= 0.0 || budget_ratio > 1.0 {
        return Err(invalid(
            "backtest",
            "budget_ratio",
            "budget_ratio must be in (0, 1]",
        ));
    }

    let mark_fallback = match config.get_string("backtest", "mark_fallback") {
        Some(s) => MarkFallback::from_str(&s)
            .map_err(|e| invalid("backtest", "mark_fallback", e.to_string()))?,
        None => MarkFallback::default(),
    };

    let strategy_name = config
        .get_string("backtest", "strategy_name")
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_STRATEGY_NAME.to_string());

    Ok(BacktestParams {
        strategy_name,
        start_date,
        end_date,
        initial_balance,
        buy_threshold,
        sell_threshold,
        max_positions: max_positions as usize,
        budget_ratio,
        mark_fallback,
    })
}

pub fn warmup_days(config: &dyn ConfigPort) -> Result<i64, PapertraderError> {
    let days = read_int(config, "backtest", "warmup_days", DEFAULT_WARMUP_DAYS)?;
    if days < 0 {
        return Err(invalid(
            "backtest",
            "warmup_days",
            "warmup_days must be non-negative",
        ));
    }
    Ok(days)
}

pub fn fee_schedule(config: &dyn ConfigPort) -> Result<FeeSchedule, PapertraderError> {
    let defaults = FeeSchedule::default();
    let rate = |key: &str, default: f64| -> Result<f64, PapertraderError> {
        let value = read_double(config, "fees", key, default)?;
        if !(0.0..1.0).contains(&value) {
            return Err(invalid("fees", key, format!("{} must be in [0, 1)", key)));
        }
        Ok(value)
    };

    Ok(FeeSchedule {
        buy_commission_rate: rate("buy_commission_rate", defaults.buy_commission_rate)?,
        sell_commission_rate: rate("sell_commission_rate", defaults.sell_commission_rate)?,
        sell_tax_rate: rate("sell_tax_rate", defaults.sell_tax_rate)?,
    })
}

/// `[database] path` wins over `[data] prices_dir` when both are set.
pub fn data_source(config: &dyn ConfigPort) -> Result<DataSource, PapertraderError> {
    let non_empty = |section: &str, key: &str| {
        config
            .get_string(section, key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    if let Some(path) = non_empty("database", "path") {
        return Ok(DataSource::Database(path));
    }
    if let Some(dir) = non_empty("data", "prices_dir") {
        return Ok(DataSource::CsvDir(dir));
    }
    Err(PapertraderError::ConfigMissing {
        section: "database".to_string(),
        key: "path".to_string(),
    })
}

pub fn pool_size(config: &dyn ConfigPort) -> Result<u32, PapertraderError> {
    let size = read_int(config, "database", "pool_size", DEFAULT_POOL_SIZE as i64)?;
    if !(1..=64).contains(&size) {
        return Err(invalid(
            "database",
            "pool_size",
            "pool_size must be between 1 and 64",
        ));
    }
    Ok(size as u32)
}

pub fn lookback_bars(config: &dyn ConfigPort) -> Result<usize, PapertraderError> {
    let bars = read_int(config, "scoring", "lookback_bars", DEFAULT_LOOKBACK_BARS as i64)?;
    if bars < 1 {
        return Err(invalid(
            "scoring",
            "lookback_bars",
            "lookback_bars must be at least 1",
        ));
    }
    Ok(bars as usize)
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> PapertraderError {
    PapertraderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Missing keys take the default; present but unparsable keys are invalid.
fn read_double(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, PapertraderError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(invalid(section, key, format!("'{}' is not a number", raw))),
        },
    }
}

fn read_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<i64, PapertraderError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(v) => Ok(v),
            Err(_) => Err(invalid(section, key, format!("'{}' is not an integer", raw))),
        },
    }
}

fn parse_date(config: &dyn ConfigPort, field: &str) -> Result<NaiveDate, PapertraderError> {
    match config.get_string("backtest", field) {
        None => Err(PapertraderError::ConfigMissing {
            section: "backtest".to_string(),
            key: field.to_string(),
        }),
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
            invalid(
                "backtest",
                field,
                format!("invalid {} format, expected YYYY-MM-DD", field),
            )
        }),
    }
}
