//! Per-instrument price history with precomputed indicators, and the
//! unified trading timeline across instruments.

use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};

use crate::domain::indicator::{IndicatorReadings, IndicatorSet};
use crate::domain::ohlcv::{last_index_on_or_before, Instrument, OhlcvBar};

#[derive(Debug, Clone)]
pub struct InstrumentData {
    pub instrument: Instrument,
    pub bars: Vec<OhlcvBar>,
    pub indicators: IndicatorSet,
    pub date_index: HashMap<NaiveDate, usize>,
}

impl InstrumentData {
    /// Sorts `bars` by date (a later duplicate date replaces an earlier one)
    /// and computes every indicator once over the full history.
    pub fn new(instrument: Instrument, mut bars: Vec<OhlcvBar>) -> Self {
        bars.sort_by_key(|b| b.date);
        let mut deduped: Vec<OhlcvBar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.date == bar.date => *last = bar,
                _ => deduped.push(bar),
            }
        }

        let date_index = deduped
            .iter()
            .enumerate()
            .map(|(i, bar)| (bar.date, i))
            .collect();
        let indicators = IndicatorSet::compute(&deduped);

        Self {
            instrument,
            bars: deduped,
            indicators,
            date_index,
        }
    }

    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    pub fn get_bar(&self, date: NaiveDate) -> Option<&OhlcvBar> {
        self.date_index.get(&date).map(|&i| &self.bars[i])
    }

    pub fn get_bar_index(&self, date: NaiveDate) -> Option<usize> {
        self.date_index.get(&date).copied()
    }

    pub fn close_on(&self, date: NaiveDate) -> Option<f64> {
        self.get_bar(date).map(|b| b.close)
    }

    pub fn last_close_on_or_before(&self, date: NaiveDate) -> Option<f64> {
        last_index_on_or_before(&self.bars, date).map(|i| self.bars[i].close)
    }

    /// Indicator readings for bar `index`, using only history up to it.
    pub fn readings_at(&self, index: usize) -> Option<IndicatorReadings> {
        self.indicators.readings_at(&self.bars, index)
    }

    pub fn latest_readings(&self) -> Option<IndicatorReadings> {
        self.indicators.latest(&self.bars)
    }

    pub fn has_bars_between(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.bars.iter().any(|b| b.date >= start && b.date <= end)
    }
}

/// Ascending union of every instrument's trading dates within `[start, end]`.
pub fn build_unified_timeline(
    data: &[InstrumentData],
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    let unique_dates: BTreeSet<NaiveDate> = data
        .iter()
        .flat_map(|d| d.bars.iter().map(|bar| bar.date))
        .filter(|date| *date >= start && *date <= end)
        .collect();
    unique_dates.into_iter().collect()
}
