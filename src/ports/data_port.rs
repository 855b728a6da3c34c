//! Market data port trait.

use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::{Instrument, InstrumentId, OhlcvBar};
use chrono::NaiveDate;

/// Source of instruments and their daily price history. Bars are always
/// returned in ascending date order.
pub trait MarketDataPort: Send + Sync {
    fn list_instruments(&self) -> Result<Vec<Instrument>, PapertraderError>;

    fn fetch_prices(
        &self,
        instrument_id: InstrumentId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<OhlcvBar>, PapertraderError>;

    /// The most recent `limit` bars.
    fn fetch_recent(
        &self,
        instrument_id: InstrumentId,
        limit: usize,
    ) -> Result<Vec<OhlcvBar>, PapertraderError>;
}
