//! CSV file adapter: one `{SYMBOL}.csv` price file per instrument, plus
//! trade-log export.
//!
//! Instrument ids are assigned by sorted symbol order starting at 1, so they
//! are stable for a given directory listing.

use crate::domain::account::Trade;
use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::{Instrument, InstrumentId, OhlcvBar};
use crate::ports::data_port::MarketDataPort;
use chrono::NaiveDate;
use csv::StringRecord;
use std::fs;
use std::path::{Path, PathBuf};

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.base_path.join(format!("{}.csv", symbol))
    }

    fn instrument(&self, instrument_id: InstrumentId) -> Result<Instrument, PapertraderError> {
        self.list_instruments()?
            .into_iter()
            .find(|i| i.id == instrument_id)
            .ok_or_else(|| {
                PapertraderError::no_data(format!("no price file for instrument {}", instrument_id))
            })
    }

    fn read_all(&self, instrument_id: InstrumentId) -> Result<Vec<OhlcvBar>, PapertraderError> {
        let instrument = self.instrument(instrument_id)?;
        let mut bars = read_bars_file(&self.csv_path(&instrument.symbol), &instrument)?;
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }
}

fn field<T: std::str::FromStr>(
    record: &StringRecord,
    index: usize,
    name: &str,
) -> Result<T, PapertraderError>
where
    T::Err: std::fmt::Display,
{
    let raw = record.get(index).ok_or_else(|| PapertraderError::Database {
        reason: format!("missing {} column", name),
    })?;
    raw.trim().parse().map_err(|e: T::Err| PapertraderError::Database {
        reason: format!("invalid {} value '{}': {}", name, raw, e),
    })
}

/// Parse a `date,open,high,low,close,volume` file for `instrument`.
pub fn read_bars_file(path: &Path, instrument: &Instrument) -> Result<Vec<OhlcvBar>, PapertraderError> {
    let content = fs::read_to_string(path).map_err(|e| PapertraderError::Database {
        reason: format!("failed to read {}: {}", path.display(), e),
    })?;

    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let mut bars = Vec::new();

    for result in rdr.records() {
        let record = result.map_err(|e| PapertraderError::Database {
            reason: format!("CSV parse error: {}", e),
        })?;

        let date_str = record.get(0).ok_or_else(|| PapertraderError::Database {
            reason: "missing date column".into(),
        })?;
        let date = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d").map_err(|e| {
            PapertraderError::Database {
                reason: format!("invalid date format: {}", e),
            }
        })?;

        bars.push(OhlcvBar {
            instrument_id: instrument.id,
            symbol: instrument.symbol.clone(),
            date,
            open: field(&record, 1, "open")?,
            high: field(&record, 2, "high")?,
            low: field(&record, 3, "low")?,
            close: field(&record, 4, "close")?,
            volume: field(&record, 5, "volume")?,
        });
    }

    Ok(bars)
}

/// Write trades as CSV, oldest first as given.
pub fn write_trade_log(path: &Path, trades: &[Trade]) -> Result<(), PapertraderError> {
    let csv_err = |e: csv::Error| PapertraderError::Database {
        reason: format!("failed to write {}: {}", path.display(), e),
    };

    let mut wtr = csv::Writer::from_path(path).map_err(csv_err)?;
    wtr.write_record([
        "executed_at",
        "symbol",
        "side",
        "quantity",
        "price",
        "total_amount",
        "commission",
        "tax",
        "realized_pnl",
    ])
    .map_err(csv_err)?;

    for t in trades {
        wtr.write_record([
            t.executed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            t.symbol.clone(),
            t.side.to_string(),
            t.quantity.to_string(),
            format!("{:.2}", t.price),
            format!("{:.2}", t.total_amount),
            format!("{:.2}", t.commission),
            format!("{:.2}", t.tax),
            t.realized_pnl.map(|p| format!("{:.2}", p)).unwrap_or_default(),
        ])
        .map_err(csv_err)?;
    }

    wtr.flush()?;
    Ok(())
}

impl MarketDataPort for CsvAdapter {
    fn list_instruments(&self) -> Result<Vec<Instrument>, PapertraderError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| PapertraderError::Database {
            reason: format!(
                "failed to read directory {}: {}",
                self.base_path.display(),
                e
            ),
        })?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PapertraderError::Database {
                reason: format!("directory entry error: {}", e),
            })?;

            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(symbol) = name_str.strip_suffix(".csv") {
                if !symbol.is_empty() {
                    symbols.push(symbol.to_string());
                }
            }
        }

        symbols.sort();
        Ok(symbols
            .into_iter()
            .enumerate()
            .map(|(i, symbol)| Instrument::new(i as InstrumentId + 1, symbol))
            .collect())
    }

    fn fetch_prices(
        &self,
        instrument_id: InstrumentId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        Ok(self
            .read_all(instrument_id)?
            .into_iter()
            .filter(|b| b.date >= start_date && b.date <= end_date)
            .collect())
    }

    fn fetch_recent(
        &self,
        instrument_id: InstrumentId,
        limit: usize,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        let mut bars = self.read_all(instrument_id)?;
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.split_off(skip))
    }
}
