//! Exponential Moving Average indicator.
//!
//! Adjusted exponentially weighted mean with span n: alpha = 2/(n+1),
//! EMA[t] = sum((1-alpha)^i * C[t-i]) / sum((1-alpha)^i) over i = 0..=t.
//! Defined from the first bar; no warmup.

use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::OhlcvBar;

pub fn calculate_ema(bars: &[OhlcvBar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.is_empty() {
        return IndicatorSeries {
            indicator_type: IndicatorType::Ema(period),
            values: Vec::new(),
        };
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let values = ewm_mean(&closes, period)
        .into_iter()
        .zip(bars)
        .map(|(ema, bar)| IndicatorPoint {
            date: bar.date,
            valid: true,
            value: IndicatorValue::Simple(ema),
        })
        .collect();

    IndicatorSeries {
        indicator_type: IndicatorType::Ema(period),
        values,
    }
}

/// Adjusted exponentially weighted mean of `values` with the given span.
pub fn ewm_mean(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let decay = 1.0 - alpha;
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    values
        .iter()
        .map(|&v| {
            weighted_sum = v + decay * weighted_sum;
            weight_total = 1.0 + decay * weight_total;
            weighted_sum / weight_total
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_bars::make_bars;

    fn simple(series: &IndicatorSeries, i: usize) -> f64 {
        match series.values[i].value {
            IndicatorValue::Simple(v) => v,
            _ => panic!("Expected Simple value"),
        }
    }

    #[test]
    fn ema_first_value_is_first_close() {
        let bars = make_bars(&[10.0, 20.0, 30.0]);
        let series = calculate_ema(&bars, 3);

        assert!(series.values.iter().all(|p| p.valid));
        assert!((simple(&series, 0) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ema_adjusted_weights() {
        let bars = make_bars(&[10.0, 20.0, 30.0]);
        let series = calculate_ema(&bars, 3);

        // alpha = 0.5, decay = 0.5
        let second = (20.0 + 0.5 * 10.0) / (1.0 + 0.5);
        let third = (30.0 + 0.5 * 20.0 + 0.25 * 10.0) / (1.0 + 0.5 + 0.25);
        assert!((simple(&series, 1) - second).abs() < 1e-12);
        assert!((simple(&series, 2) - third).abs() < 1e-12);
    }

    #[test]
    fn ema_equal_prices() {
        let bars = make_bars(&[100.0; 10]);
        let series = calculate_ema(&bars, 5);
        for i in 0..10 {
            assert!((simple(&series, i) - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ema_indicator_type() {
        let bars = make_bars(&[10.0, 20.0, 30.0]);
        let series = calculate_ema(&bars, 5);
        assert_eq!(series.indicator_type, IndicatorType::Ema(5));
    }

    #[test]
    fn ema_empty_bars_and_zero_period() {
        assert!(calculate_ema(&[], 3).values.is_empty());
        assert!(calculate_ema(&make_bars(&[10.0, 20.0]), 0).values.is_empty());
    }

    #[test]
    fn ewm_mean_lags_a_rising_series() {
        let values: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let ema = ewm_mean(&values, 10);
        assert!(ema[29] < 29.0);
        assert!(ema[29] > ema[28]);
    }
}
