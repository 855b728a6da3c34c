//! Bollinger Bands indicator.
//!
//! Bollinger Bands consist of:
//! - Middle: Simple Moving Average (SMA) over n periods
//! - Upper: Middle + (multiplier × StdDev)
//! - Lower: Middle - (multiplier × StdDev)
//!
//! Where StdDev is the sample standard deviation (divides by N-1).
//!
//! Default parameters: period=20, multiplier=2.0
//! Warmup: first (period-1) bars are invalid.

use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::OhlcvBar;

pub fn calculate_bollinger(
    bars: &[OhlcvBar],
    period: usize,
    stddev_mult_x100: u32,
) -> IndicatorSeries {
    let mut values = Vec::with_capacity(bars.len());
    let mult = stddev_mult_x100 as f64 / 100.0;

    for (i, bar) in bars.iter().enumerate() {
        // Sample deviation needs at least two observations.
        let valid = period >= 2 && i + 1 >= period;

        let (upper, middle, lower) = if valid {
            let window = &bars[i + 1 - period..=i];

            let middle_val: f64 = window.iter().map(|b| b.close).sum::<f64>() / period as f64;

            let variance: f64 = window
                .iter()
                .map(|b| {
                    let diff = b.close - middle_val;
                    diff * diff
                })
                .sum::<f64>()
                / (period - 1) as f64;

            let stddev = variance.sqrt();
            (middle_val + mult * stddev, middle_val, middle_val - mult * stddev)
        } else {
            (0.0, 0.0, 0.0)
        };

        values.push(IndicatorPoint {
            date: bar.date,
            valid,
            value: IndicatorValue::Bollinger {
                upper,
                middle,
                lower,
            },
        });
    }

    IndicatorSeries {
        indicator_type: IndicatorType::Bollinger {
            period,
            stddev_mult_x100,
        },
        values,
    }
}
