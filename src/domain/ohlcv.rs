//! Daily OHLCV bar representation and instrument identity.

use chrono::NaiveDate;

pub type InstrumentId = i64;

/// A tradable equity known to the market data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instrument {
    pub id: InstrumentId,
    pub symbol: String,
    pub name: String,
}

impl Instrument {
    pub fn new(id: InstrumentId, symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Instrument {
            id,
            name: symbol.clone(),
            symbol,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OhlcvBar {
    pub instrument_id: InstrumentId,
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Index of the last bar dated on or before `date`, assuming `bars` is sorted
/// ascending by date.
pub fn last_index_on_or_before(bars: &[OhlcvBar], date: NaiveDate) -> Option<usize> {
    let upper = bars.partition_point(|b| b.date <= date);
    upper.checked_sub(1)
}
