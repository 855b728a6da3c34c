//! Technical indicator series feeding the scoring engine.
//!
//! - `IndicatorPoint`: a single point in an indicator time series
//! - `IndicatorValue`: output shape of one point
//! - `IndicatorType`: indicator identity + parameters
//! - `IndicatorSeries`: a time series of indicator values
//! - `IndicatorSet`: the five series the scorer reads, computed once per
//!   instrument and sampled per bar with [`IndicatorSet::readings_at`]

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

pub use bollinger::calculate_bollinger;
pub use ema::{calculate_ema, ewm_mean};
pub use macd::calculate_macd;
pub use rsi::calculate_rsi;

use chrono::NaiveDate;
use std::fmt;

use crate::domain::ohlcv::OhlcvBar;

pub const RSI_PERIOD: usize = 14;
pub const EMA_SHORT: usize = 20;
pub const EMA_LONG: usize = 50;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_MULT_X100: u32 = 200;

#[derive(Debug, Clone)]
pub struct IndicatorPoint {
    pub date: NaiveDate,
    pub valid: bool,
    pub value: IndicatorValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorValue {
    Simple(f64),
    Macd {
        line: f64,
        signal: f64,
        histogram: f64,
    },
    Bollinger {
        upper: f64,
        middle: f64,
        lower: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndicatorType {
    Ema(usize),
    Rsi(usize),
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    Bollinger {
        period: usize,
        stddev_mult_x100: u32,
    },
}

#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub indicator_type: IndicatorType,
    pub values: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    /// Latest valid value at or before `index`. Undefined points are skipped.
    pub fn last_valid(&self, index: usize) -> Option<IndicatorValue> {
        let end = index.checked_add(1)?.min(self.values.len());
        self.values[..end]
            .iter()
            .rev()
            .find(|p| p.valid)
            .map(|p| p.value)
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorType::Ema(period) => write!(f, "EMA({})", period),
            IndicatorType::Rsi(period) => write!(f, "RSI({})", period),
            IndicatorType::Macd { fast, slow, signal } => {
                write!(f, "MACD({},{},{})", fast, slow, signal)
            }
            IndicatorType::Bollinger {
                period,
                stddev_mult_x100,
            } => {
                let mult = *stddev_mult_x100 as f64 / 100.0;
                write!(f, "BOLLINGER({},{})", period, mult)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdReading {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerReading {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Indicator values for one instrument on one date. `None` means the
/// indicator has no defined value yet (insufficient history).
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorReadings {
    pub date: NaiveDate,
    pub close: f64,
    pub rsi: Option<f64>,
    pub macd: Option<MacdReading>,
    pub bollinger: Option<BollingerReading>,
    pub ema_short: Option<f64>,
    pub ema_long: Option<f64>,
}

impl IndicatorReadings {
    /// Readings with only a price known; every sub-score falls back to neutral.
    pub fn price_only(date: NaiveDate, close: f64) -> Self {
        IndicatorReadings {
            date,
            close,
            rsi: None,
            macd: None,
            bollinger: None,
            ema_short: None,
            ema_long: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorSet {
    pub rsi: IndicatorSeries,
    pub macd: IndicatorSeries,
    pub bollinger: IndicatorSeries,
    pub ema_short: IndicatorSeries,
    pub ema_long: IndicatorSeries,
}

impl IndicatorSet {
    pub fn compute(bars: &[OhlcvBar]) -> Self {
        IndicatorSet {
            rsi: calculate_rsi(bars, RSI_PERIOD),
            macd: macd::calculate_macd_default(bars),
            bollinger: calculate_bollinger(bars, BOLLINGER_PERIOD, BOLLINGER_MULT_X100),
            ema_short: calculate_ema(bars, EMA_SHORT),
            ema_long: calculate_ema(bars, EMA_LONG),
        }
    }

    /// Sample every series at bar `index`. `bars` must be the slice the set
    /// was computed from.
    pub fn readings_at(&self, bars: &[OhlcvBar], index: usize) -> Option<IndicatorReadings> {
        let bar = bars.get(index)?;

        let simple = |series: &IndicatorSeries| match series.last_valid(index) {
            Some(IndicatorValue::Simple(v)) => Some(v),
            _ => None,
        };

        let macd = match self.macd.last_valid(index) {
            Some(IndicatorValue::Macd {
                line,
                signal,
                histogram,
            }) => Some(MacdReading {
                line,
                signal,
                histogram,
            }),
            _ => None,
        };

        let bollinger = match self.bollinger.last_valid(index) {
            Some(IndicatorValue::Bollinger {
                upper,
                middle,
                lower,
            }) => Some(BollingerReading {
                upper,
                middle,
                lower,
            }),
            _ => None,
        };

        Some(IndicatorReadings {
            date: bar.date,
            close: bar.close,
            rsi: simple(&self.rsi),
            macd,
            bollinger,
            ema_short: simple(&self.ema_short),
            ema_long: simple(&self.ema_long),
        })
    }

    /// Readings at the last bar.
    pub fn latest(&self, bars: &[OhlcvBar]) -> Option<IndicatorReadings> {
        let last = bars.len().checked_sub(1)?;
        self.readings_at(bars, last)
    }
}
