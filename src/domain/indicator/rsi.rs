//! RSI (Relative Strength Index) indicator.
//!
//! Simple rolling means of gains and losses over the last n bars:
//! - change[0] contributes zero gain and zero loss
//! - avg_gain = mean(gains[t-n+1..=t]), avg_loss = mean(losses[t-n+1..=t])
//!
//! Formula: RSI = 100 - (100 / (1 + avg_gain / avg_loss))
//! If avg_loss == 0 and avg_gain > 0: RSI = 100.
//! If both are 0 the value is undefined.
//!
//! Warmup: first (n-1) bars are invalid.

use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::OhlcvBar;

pub fn calculate_rsi(bars: &[OhlcvBar], period: usize) -> IndicatorSeries {
    let invalid = |bar: &OhlcvBar| IndicatorPoint {
        date: bar.date,
        valid: false,
        value: IndicatorValue::Simple(0.0),
    };

    if period == 0 {
        return IndicatorSeries {
            indicator_type: IndicatorType::Rsi(period),
            values: bars.iter().map(invalid).collect(),
        };
    }

    let mut gains = Vec::with_capacity(bars.len());
    let mut losses = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        let change = if i == 0 {
            0.0
        } else {
            bar.close - bars[i - 1].close
        };
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let mut values = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        if i + 1 < period {
            values.push(invalid(bar));
            continue;
        }

        let window = (i + 1 - period)..=i;
        let avg_gain = gains[window.clone()].iter().sum::<f64>() / period as f64;
        let avg_loss = losses[window].iter().sum::<f64>() / period as f64;

        let rsi = if avg_loss == 0.0 {
            if avg_gain == 0.0 {
                values.push(invalid(bar));
                continue;
            }
            100.0
        } else {
            100.0 - (100.0 / (1.0 + avg_gain / avg_loss))
        };

        values.push(IndicatorPoint {
            date: bar.date,
            valid: true,
            value: IndicatorValue::Simple(rsi),
        });
    }

    IndicatorSeries {
        indicator_type: IndicatorType::Rsi(period),
        values,
    }
}
