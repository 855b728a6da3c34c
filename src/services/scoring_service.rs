//! Live scoring of every registered instrument from its recent history.

use std::sync::Arc;

use crate::domain::config_validation::DEFAULT_LOOKBACK_BARS;
use crate::domain::error::PapertraderError;
use crate::domain::instrument_data::InstrumentData;
use crate::domain::ohlcv::Instrument;
use crate::domain::scoring::{score_with, ScoreSnapshot, SignalThresholds};
use crate::ports::data_port::MarketDataPort;
use crate::ports::prediction_port::PredictionPort;
use crate::ports::repository_port::ScoreRepository;

pub struct ScoringEngine {
    market: Arc<dyn MarketDataPort>,
    predictor: Arc<dyn PredictionPort>,
    scores: Arc<dyn ScoreRepository>,
    thresholds: SignalThresholds,
    lookback_bars: usize,
}

impl ScoringEngine {
    pub fn new(
        market: Arc<dyn MarketDataPort>,
        predictor: Arc<dyn PredictionPort>,
        scores: Arc<dyn ScoreRepository>,
    ) -> Self {
        Self {
            market,
            predictor,
            scores,
            thresholds: SignalThresholds::default(),
            lookback_bars: DEFAULT_LOOKBACK_BARS,
        }
    }

    pub fn with_lookback_bars(mut self, bars: usize) -> Self {
        self.lookback_bars = bars.max(1);
        self
    }

    pub fn with_thresholds(mut self, thresholds: SignalThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Score `instrument` as of its latest bar without persisting the result.
    /// `Ok(None)` when it has no price history.
    pub fn score(&self, instrument: &Instrument) -> Result<Option<ScoreSnapshot>, PapertraderError> {
        let bars = self.market.fetch_recent(instrument.id, self.lookback_bars)?;
        if bars.is_empty() {
            return Ok(None);
        }

        let data = InstrumentData::new(instrument.clone(), bars);
        let Some(readings) = data.latest_readings() else {
            return Ok(None);
        };

        let predicted = match self.predictor.predicted_change(instrument, readings.date) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(symbol = %instrument.symbol, error = %e, "prediction unavailable, scoring neutral");
                None
            }
        };

        Ok(Some(score_with(
            instrument,
            &readings,
            predicted,
            &self.thresholds,
        )))
    }

    /// Score, persist and rank every registered instrument. Instruments that
    /// cannot be scored are skipped.
    pub fn score_all(&self) -> Result<Vec<ScoreSnapshot>, PapertraderError> {
        let instruments = self.market.list_instruments()?;
        let mut snapshots = Vec::with_capacity(instruments.len());

        for instrument in &instruments {
            let mut snapshot = match self.score(instrument) {
                Ok(Some(s)) => s,
                Ok(None) => {
                    tracing::debug!(symbol = %instrument.symbol, "no price data, skipped");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(symbol = %instrument.symbol, error = %e, "scoring failed, skipped");
                    continue;
                }
            };

            match self.scores.save_score(&snapshot) {
                Ok(id) => snapshot.id = Some(id),
                Err(e) => {
                    tracing::warn!(symbol = %instrument.symbol, error = %e, "failed to save score, skipped");
                    continue;
                }
            }
            snapshots.push(snapshot);
        }

        snapshots.sort_by(|a, b| b.total_score.total_cmp(&a.total_score));
        tracing::info!(
            scored = snapshots.len(),
            instruments = instruments.len(),
            "scoring run complete"
        );
        Ok(snapshots)
    }

    pub fn latest_scores(&self, limit: usize) -> Result<Vec<ScoreSnapshot>, PapertraderError> {
        self.scores.latest_scores(limit)
    }
}
