//! MACD (Moving Average Convergence Divergence) indicator.
//!
//! MACD Line = EMA(fast) - EMA(slow)
//! Signal Line = EMA(signal) of MACD Line
//! Histogram = MACD Line - Signal Line
//!
//! Default parameters: fast=12, slow=26, signal=9. All three EMAs use the
//! adjusted weighting from [`ewm_mean`], so every bar is defined.

use crate::domain::indicator::{
    ewm_mean, IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue,
};
use crate::domain::ohlcv::OhlcvBar;

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

pub fn calculate_macd(
    bars: &[OhlcvBar],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> IndicatorSeries {
    let indicator_type = IndicatorType::Macd {
        fast,
        slow,
        signal: signal_period,
    };

    if bars.is_empty() || fast == 0 || slow == 0 || signal_period == 0 {
        return IndicatorSeries {
            indicator_type,
            values: Vec::new(),
        };
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let ema_fast = ewm_mean(&closes, fast);
    let ema_slow = ewm_mean(&closes, slow);

    let macd_line: Vec<f64> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ewm_mean(&macd_line, signal_period);

    let values = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| IndicatorPoint {
            date: bar.date,
            valid: true,
            value: IndicatorValue::Macd {
                line: macd_line[i],
                signal: signal_line[i],
                histogram: macd_line[i] - signal_line[i],
            },
        })
        .collect();

    IndicatorSeries {
        indicator_type,
        values,
    }
}

pub fn calculate_macd_default(bars: &[OhlcvBar]) -> IndicatorSeries {
    calculate_macd(bars, DEFAULT_FAST, DEFAULT_SLOW, DEFAULT_SIGNAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_bars::make_bars;

    fn unpack(value: IndicatorValue) -> (f64, f64, f64) {
        match value {
            IndicatorValue::Macd {
                line,
                signal,
                histogram,
            } => (line, signal, histogram),
            _ => panic!("Expected Macd value"),
        }
    }

    #[test]
    fn macd_histogram_equals_line_minus_signal() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let series = calculate_macd_default(&make_bars(&prices));

        assert_eq!(series.values.len(), 40);
        for point in &series.values {
            let (line, signal, histogram) = unpack(point.value);
            assert!((histogram - (line - signal)).abs() < 1e-12);
        }
    }

    #[test]
    fn macd_flat_prices_are_zero() {
        let series = calculate_macd_default(&make_bars(&[50.0; 30]));
        let (line, signal, histogram) = unpack(series.values[29].value);
        assert!(line.abs() < 1e-9);
        assert!(signal.abs() < 1e-9);
        assert!(histogram.abs() < 1e-9);
    }

    #[test]
    fn macd_rising_prices_positive_line() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + 2.0 * i as f64).collect();
        let series = calculate_macd_default(&make_bars(&prices));
        let (line, _, _) = unpack(series.values[39].value);
        assert!(line > 0.0);
    }

    #[test]
    fn macd_sharp_drop_negative_histogram() {
        let mut prices = vec![100.0; 40];
        prices.push(80.0);
        let series = calculate_macd_default(&make_bars(&prices));
        let (line, signal, histogram) = unpack(series.values[40].value);
        assert!(line < 0.0);
        assert!(signal > line);
        assert!(histogram < 0.0);
    }

    #[test]
    fn macd_empty_or_zero_period() {
        assert!(calculate_macd_default(&[]).values.is_empty());
        let bars = make_bars(&[1.0, 2.0]);
        assert!(calculate_macd(&bars, 0, 26, 9).values.is_empty());
    }

    #[test]
    fn macd_indicator_type() {
        let series = calculate_macd(&make_bars(&[1.0]), 5, 10, 3);
        assert_eq!(
            series.indicator_type,
            IndicatorType::Macd {
                fast: 5,
                slow: 10,
                signal: 3
            }
        );
    }
}
