//! Performance metrics for a simulated run.

use crate::domain::account::Trade;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Raw (unrounded) run statistics. Percentages are in percent units.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: usize,
    pub win_trades: usize,
}

impl Metrics {
    /// `daily_values` is the mark-to-market series including the seeded
    /// starting value. Only sell trades count towards trade statistics.
    pub fn compute(
        initial_balance: f64,
        final_balance: f64,
        daily_values: &[f64],
        trades: &[Trade],
    ) -> Self {
        let total_return = if initial_balance > 0.0 {
            (final_balance - initial_balance) / initial_balance * 100.0
        } else {
            0.0
        };

        let sells: Vec<&Trade> = trades.iter().filter(|t| t.side.is_sell()).collect();
        let total_trades = sells.len();
        let win_trades = sells
            .iter()
            .filter(|t| t.realized_pnl.unwrap_or(0.0) > 0.0)
            .count();
        let win_rate = if total_trades > 0 {
            win_trades as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        Metrics {
            total_return,
            sharpe_ratio: sharpe_ratio(&daily_returns(daily_values)),
            max_drawdown: max_drawdown(daily_values),
            win_rate,
            total_trades,
            win_trades,
        }
    }
}

/// Percent change between consecutive values, as fractions.
pub fn daily_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Annualized mean/stddev of daily returns with sample deviation, no
/// risk-free rate. Zero with fewer than two returns or zero deviation.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stddev = variance.sqrt();

    if stddev > 0.0 && stddev.is_finite() {
        mean / stddev * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    }
}

/// Deepest peak-to-trough decline in percent; zero or negative.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let Some(&first) = values.first() else {
        return 0.0;
    };

    let mut peak = first;
    let mut worst = 0.0_f64;
    for &value in values {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            worst = worst.min((value - peak) / peak);
        }
    }
    worst * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::TradeSide;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn trade(side: TradeSide, pnl: Option<f64>) -> Trade {
        Trade {
            id: None,
            account_id: 0,
            instrument_id: 1,
            symbol: "A".into(),
            side,
            quantity: 10,
            price: 100.0,
            total_amount: 1000.0,
            commission: 0.15,
            tax: 0.0,
            realized_pnl: pnl,
            executed_at: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn flat_series_has_no_risk() {
        let values = vec![1_000_000.0; 3];
        let m = Metrics::compute(1_000_000.0, 1_000_000.0, &values, &[]);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.total_trades, 0);
    }

    #[test]
    fn total_return_percent() {
        let m = Metrics::compute(100_000.0, 110_000.0, &[100_000.0, 110_000.0], &[]);
        assert_relative_eq!(m.total_return, 10.0, epsilon = 1e-9);
        let m = Metrics::compute(100_000.0, 90_000.0, &[100_000.0, 90_000.0], &[]);
        assert_relative_eq!(m.total_return, -10.0, epsilon = 1e-9);
    }

    #[test]
    fn win_rate_counts_only_sells() {
        let trades = vec![
            trade(TradeSide::Buy, None),
            trade(TradeSide::Sell, Some(120.0)),
            trade(TradeSide::Buy, None),
            trade(TradeSide::Sell, Some(-30.0)),
            trade(TradeSide::SellClose, Some(5.0)),
            trade(TradeSide::SellClose, Some(0.0)),
        ];
        let m = Metrics::compute(1.0, 1.0, &[1.0], &trades);
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.win_trades, 2);
        assert_relative_eq!(m.win_rate, 50.0);
    }

    #[test]
    fn max_drawdown_is_negative_percent() {
        let values = [100.0, 110.0, 90.0, 95.0, 80.0, 100.0];
        assert_relative_eq!(
            max_drawdown(&values),
            (80.0 - 110.0) / 110.0 * 100.0,
            epsilon = 1e-9
        );
        assert_eq!(max_drawdown(&[100.0, 101.0, 102.0]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn daily_returns_from_seeded_series() {
        let r = daily_returns(&[100.0, 110.0, 99.0]);
        assert_eq!(r.len(), 2);
        assert_relative_eq!(r[0], 0.10, epsilon = 1e-12);
        assert_relative_eq!(r[1], -0.10, epsilon = 1e-12);
    }

    #[test]
    fn sharpe_needs_two_returns() {
        assert_eq!(sharpe_ratio(&[]), 0.0);
        assert_eq!(sharpe_ratio(&[0.05]), 0.0);
        assert_eq!(sharpe_ratio(&[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn sharpe_uses_sample_deviation() {
        let returns = [0.01, 0.03];
        // mean 0.02, sample sd = sqrt(0.0002) ≈ 0.014142
        let expected = 0.02 / 0.0002_f64.sqrt() * 252.0_f64.sqrt();
        assert_relative_eq!(sharpe_ratio(&returns), expected, epsilon = 1e-9);
    }

    #[test]
    fn sharpe_positive_for_rising_series() {
        let mut values = vec![100_000.0];
        for i in 1..253 {
            values.push(100_000.0 * (1.0 + 0.001 * (i as f64)));
        }
        let m = Metrics::compute(100_000.0, *values.last().unwrap(), &values, &[]);
        assert!(m.sharpe_ratio > 0.0);
    }
}
