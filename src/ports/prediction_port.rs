//! Price prediction port trait.

use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::Instrument;
use chrono::NaiveDate;

/// Output of an external prediction model: the predicted next-period
/// percentage price change for an instrument, as of a given date.
pub trait PredictionPort: Send + Sync {
    /// `Ok(None)` when the model has no prediction for this instrument/date.
    fn predicted_change(
        &self,
        instrument: &Instrument,
        as_of: NaiveDate,
    ) -> Result<Option<f64>, PapertraderError>;
}
