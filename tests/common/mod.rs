#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use papertrader::domain::error::PapertraderError;
pub use papertrader::domain::ohlcv::{Instrument, InstrumentId, OhlcvBar};
use papertrader::ports::data_port::MarketDataPort;
use papertrader::ports::prediction_port::PredictionPort;
use std::collections::HashMap;

/// Market data from fixed bar lists, with optional per-instrument failures.
pub struct MockMarketData {
    pub instruments: Vec<Instrument>,
    pub bars: HashMap<InstrumentId, Vec<OhlcvBar>>,
    pub errors: HashMap<InstrumentId, String>,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self {
            instruments: Vec::new(),
            bars: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, id: InstrumentId, symbol: &str, bars: Vec<OhlcvBar>) -> Self {
        self.instruments.push(Instrument::new(id, symbol));
        self.bars.insert(id, bars);
        self
    }

    pub fn with_error(mut self, id: InstrumentId, symbol: &str, reason: &str) -> Self {
        self.instruments.push(Instrument::new(id, symbol));
        self.errors.insert(id, reason.to_string());
        self
    }

    fn check(&self, id: InstrumentId) -> Result<(), PapertraderError> {
        match self.errors.get(&id) {
            Some(reason) => Err(PapertraderError::Database {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl MarketDataPort for MockMarketData {
    fn list_instruments(&self) -> Result<Vec<Instrument>, PapertraderError> {
        Ok(self.instruments.clone())
    }

    fn fetch_prices(
        &self,
        instrument_id: InstrumentId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        self.check(instrument_id)?;
        Ok(self
            .bars
            .get(&instrument_id)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start_date && b.date <= end_date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn fetch_recent(
        &self,
        instrument_id: InstrumentId,
        limit: usize,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        self.check(instrument_id)?;
        let bars = self.bars.get(&instrument_id).cloned().unwrap_or_default();
        let skip = bars.len().saturating_sub(limit);
        Ok(bars[skip..].to_vec())
    }
}

/// Always fails, as an unreachable prediction model would.
pub struct FailingPredictor;

impl PredictionPort for FailingPredictor {
    fn predicted_change(
        &self,
        _instrument: &Instrument,
        _as_of: NaiveDate,
    ) -> Result<Option<f64>, PapertraderError> {
        Err(PapertraderError::Database {
            reason: "model offline".into(),
        })
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn make_bar(id: InstrumentId, symbol: &str, date: NaiveDate, close: f64) -> OhlcvBar {
    OhlcvBar {
        instrument_id: id,
        symbol: symbol.to_string(),
        date,
        open: close,
        high: close,
        low: close,
        close,
        volume: 10_000,
    }
}

/// One bar per calendar day from `start`, one close per entry.
pub fn daily_bars(id: InstrumentId, symbol: &str, start: NaiveDate, closes: &[f64]) -> Vec<OhlcvBar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| make_bar(id, symbol, start + Duration::days(i as i64), close))
        .collect()
}

/// 60 flat days at 100 from 2024-01-01, then 80 on 2024-03-01 and 2024-03-02.
/// On 2024-03-01 the indicators alone score about 58.7; a strong positive
/// prediction lifts it above 70.
pub fn drop_after_flat(id: InstrumentId, symbol: &str) -> Vec<OhlcvBar> {
    let mut closes = vec![100.0; 60];
    closes.push(80.0);
    closes.push(80.0);
    daily_bars(id, symbol, date(2024, 1, 1), &closes)
}
