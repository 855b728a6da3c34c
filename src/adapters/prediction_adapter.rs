//! Prediction adapters: precomputed model output loaded from CSV, and a
//! neutral stand-in for runs without a model.

use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::Instrument;
use crate::ports::prediction_port::PredictionPort;

/// Always reports "no prediction", which scores neutral.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralPredictor;

impl PredictionPort for NeutralPredictor {
    fn predicted_change(
        &self,
        _instrument: &Instrument,
        _as_of: NaiveDate,
    ) -> Result<Option<f64>, PapertraderError> {
        Ok(None)
    }
}

/// Predicted percentage changes keyed by symbol and date. A lookup uses the
/// newest prediction dated on or before `as_of`.
#[derive(Debug, Default, Clone)]
pub struct FixedPredictions {
    by_symbol: HashMap<String, BTreeMap<NaiveDate, f64>>,
}

impl FixedPredictions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, date: NaiveDate, predicted_change_pct: f64) {
        self.by_symbol
            .entry(symbol.into())
            .or_default()
            .insert(date, predicted_change_pct);
    }

    pub fn len(&self) -> usize {
        self.by_symbol.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a `symbol,date,predicted_change` file.
    pub fn from_csv(path: &Path) -> Result<Self, PapertraderError> {
        let mut rdr = csv::Reader::from_path(path).map_err(|e| PapertraderError::Database {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let mut predictions = Self::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| PapertraderError::Database {
                reason: format!("CSV parse error: {}", e),
            })?;
            let bad_row = |what: &str| PapertraderError::Database {
                reason: format!("{}: row {}: {}", path.display(), line + 2, what),
            };

            let symbol = record.get(0).map(str::trim).filter(|s| !s.is_empty());
            let date = record
                .get(1)
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok());
            let change = record.get(2).and_then(|s| s.trim().parse::<f64>().ok());

            match (symbol, date, change) {
                (Some(symbol), Some(date), Some(change)) => predictions.insert(symbol, date, change),
                (None, _, _) => return Err(bad_row("missing symbol")),
                (_, None, _) => return Err(bad_row("invalid date")),
                (_, _, None) => return Err(bad_row("invalid predicted_change")),
            }
        }
        Ok(predictions)
    }
}

impl PredictionPort for FixedPredictions {
    fn predicted_change(
        &self,
        instrument: &Instrument,
        as_of: NaiveDate,
    ) -> Result<Option<f64>, PapertraderError> {
        Ok(self
            .by_symbol
            .get(&instrument.symbol)
            .and_then(|m| m.range(..=as_of).next_back())
            .map(|(_, change)| *change))
    }
}
