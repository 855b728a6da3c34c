//! Weighted multi-signal scoring.
//!
//! Five sub-scores in [0, 100] are combined with fixed weights into a total
//! score, which is classified into a [`Signal`]. Missing or non-finite
//! inputs produce a neutral 50.

use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;

use crate::domain::account::round_to;
use crate::domain::error::PapertraderError;
use crate::domain::indicator::{BollingerReading, IndicatorReadings, MacdReading};
use crate::domain::ohlcv::Instrument;

pub const NEUTRAL: f64 = 50.0;

pub const WEIGHT_RSI: f64 = 0.20;
pub const WEIGHT_MACD: f64 = 0.20;
pub const WEIGHT_BOLLINGER: f64 = 0.15;
pub const WEIGHT_EMA: f64 = 0.15;
pub const WEIGHT_PREDICTION: f64 = 0.30;

pub const DEFAULT_BUY_THRESHOLD: f64 = 70.0;
pub const DEFAULT_SELL_THRESHOLD: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::Hold => write!(f, "HOLD"),
        }
    }
}

impl FromStr for Signal {
    type Err = PapertraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Signal::Buy),
            "SELL" => Ok(Signal::Sell),
            "HOLD" => Ok(Signal::Hold),
            other => Err(PapertraderError::invalid(format!(
                "unknown signal '{}'",
                other
            ))),
        }
    }
}

/// Score cut-offs. `total >= buy` is BUY, `total <= sell` is SELL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalThresholds {
    pub buy: f64,
    pub sell: f64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        SignalThresholds {
            buy: DEFAULT_BUY_THRESHOLD,
            sell: DEFAULT_SELL_THRESHOLD,
        }
    }
}

impl SignalThresholds {
    pub fn classify(&self, total: f64) -> Signal {
        if total >= self.buy {
            Signal::Buy
        } else if total <= self.sell {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSnapshot {
    pub id: Option<i64>,
    pub instrument_id: i64,
    pub symbol: String,
    pub date: NaiveDate,
    pub rsi_score: f64,
    pub macd_score: f64,
    pub bollinger_score: f64,
    pub ema_score: f64,
    pub prediction_score: f64,
    pub total_score: f64,
    pub signal: Signal,
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

pub fn rsi_score(rsi: Option<f64>) -> f64 {
    match finite(rsi) {
        Some(rsi) => (100.0 - rsi).clamp(0.0, 100.0),
        None => NEUTRAL,
    }
}

pub fn macd_score(macd: Option<MacdReading>) -> f64 {
    match macd {
        Some(m) if m.line.is_finite() && m.signal.is_finite() && m.histogram.is_finite() => {
            (((m.histogram * 0.1).tanh() + 1.0) * 50.0).clamp(0.0, 100.0)
        }
        _ => NEUTRAL,
    }
}

pub fn bollinger_score(price: f64, bands: Option<BollingerReading>) -> f64 {
    let Some(b) = bands else {
        return NEUTRAL;
    };
    if ![price, b.upper, b.middle, b.lower].iter().all(|v| v.is_finite()) {
        return NEUTRAL;
    }
    let width = b.upper - b.lower;
    if width == 0.0 {
        return NEUTRAL;
    }
    ((b.upper - price) / width * 100.0).clamp(0.0, 100.0)
}

pub fn ema_score(price: f64, ema_short: Option<f64>, ema_long: Option<f64>) -> f64 {
    let (Some(short), Some(long)) = (finite(ema_short), finite(ema_long)) else {
        return NEUTRAL;
    };
    if !price.is_finite() {
        return NEUTRAL;
    }

    let mut score = NEUTRAL;
    score += if short > long { 25.0 } else { -25.0 };
    score += if price > short { 25.0 } else { -25.0 };
    score.clamp(0.0, 100.0)
}

pub fn prediction_score(predicted_change_pct: Option<f64>) -> f64 {
    match finite(predicted_change_pct) {
        Some(pct) => (((pct / 5.0).tanh() + 1.0) * 50.0).clamp(0.0, 100.0),
        None => NEUTRAL,
    }
}

/// Score one instrument with the default 70/30 thresholds.
pub fn score(
    instrument: &Instrument,
    readings: &IndicatorReadings,
    predicted_change_pct: Option<f64>,
) -> ScoreSnapshot {
    score_with(
        instrument,
        readings,
        predicted_change_pct,
        &SignalThresholds::default(),
    )
}

pub fn score_with(
    instrument: &Instrument,
    readings: &IndicatorReadings,
    predicted_change_pct: Option<f64>,
    thresholds: &SignalThresholds,
) -> ScoreSnapshot {
    let rsi = rsi_score(readings.rsi);
    let macd = macd_score(readings.macd);
    let bollinger = bollinger_score(readings.close, readings.bollinger);
    let ema = ema_score(readings.close, readings.ema_short, readings.ema_long);
    let prediction = prediction_score(predicted_change_pct);

    let total = rsi * WEIGHT_RSI
        + macd * WEIGHT_MACD
        + bollinger * WEIGHT_BOLLINGER
        + ema * WEIGHT_EMA
        + prediction * WEIGHT_PREDICTION;
    let total = round_to(total.clamp(0.0, 100.0), 2);

    ScoreSnapshot {
        id: None,
        instrument_id: instrument.id,
        symbol: instrument.symbol.clone(),
        date: readings.date,
        rsi_score: round_to(rsi, 2),
        macd_score: round_to(macd, 2),
        bollinger_score: round_to(bollinger, 2),
        ema_score: round_to(ema, 2),
        prediction_score: round_to(prediction, 2),
        total_score: total,
        signal: thresholds.classify(total),
    }
}
