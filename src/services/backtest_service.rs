//! Backtest runs: load history, replay the scoring strategy, persist the
//! result.

use chrono::{Duration, Local};
use std::sync::Arc;

use crate::domain::backtest::{simulate, BacktestParams, BacktestResult};
use crate::domain::config_validation::DEFAULT_WARMUP_DAYS;
use crate::domain::error::PapertraderError;
use crate::domain::instrument_data::{build_unified_timeline, InstrumentData};
use crate::domain::ledger::FeeSchedule;
use crate::domain::scoring::score_with;
use crate::ports::data_port::MarketDataPort;
use crate::ports::prediction_port::PredictionPort;
use crate::ports::repository_port::BacktestRepository;

pub struct BacktestEngine {
    market: Arc<dyn MarketDataPort>,
    predictor: Arc<dyn PredictionPort>,
    results: Arc<dyn BacktestRepository>,
    fees: FeeSchedule,
    warmup_days: i64,
}

impl BacktestEngine {
    pub fn new(
        market: Arc<dyn MarketDataPort>,
        predictor: Arc<dyn PredictionPort>,
        results: Arc<dyn BacktestRepository>,
    ) -> Self {
        Self {
            market,
            predictor,
            results,
            fees: FeeSchedule::default(),
            warmup_days: DEFAULT_WARMUP_DAYS,
        }
    }

    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    /// Calendar days of history loaded before `start_date` for indicator
    /// warm-up. Warm-up bars are never traded or marked.
    pub fn with_warmup_days(mut self, days: i64) -> Self {
        self.warmup_days = days.max(0);
        self
    }

    /// Load every instrument that has at least one bar inside the run
    /// window. Instruments whose history cannot be read are skipped.
    pub fn load_data(&self, params: &BacktestParams) -> Result<Vec<InstrumentData>, PapertraderError> {
        let instruments = self.market.list_instruments()?;
        if instruments.is_empty() {
            return Err(PapertraderError::no_data("no instruments registered"));
        }

        let load_start = params.start_date - Duration::days(self.warmup_days);
        let mut data = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            let bars = match self
                .market
                .fetch_prices(instrument.id, load_start, params.end_date)
            {
                Ok(bars) => bars,
                Err(e) => {
                    tracing::warn!(symbol = %instrument.symbol, error = %e, "failed to load prices, skipped");
                    continue;
                }
            };
            if bars.is_empty() {
                continue;
            }

            let loaded = InstrumentData::new(instrument, bars);
            if !loaded.has_bars_between(params.start_date, params.end_date) {
                tracing::debug!(symbol = %loaded.instrument.symbol, "no bars in range, skipped");
                continue;
            }
            data.push(loaded);
        }

        if data.is_empty() {
            return Err(PapertraderError::no_data(format!(
                "no price data between {} and {}",
                params.start_date, params.end_date
            )));
        }
        Ok(data)
    }

    /// Run, persist and return a backtest. Fails with `NoData` when nothing
    /// can be simulated; no result is stored in that case.
    pub fn run_backtest(&self, params: &BacktestParams) -> Result<BacktestResult, PapertraderError> {
        params.validate()?;

        let data = self.load_data(params)?;
        let timeline = build_unified_timeline(&data, params.start_date, params.end_date);
        tracing::info!(
            strategy = %params.strategy_name,
            instruments = data.len(),
            days = timeline.len(),
            "starting backtest"
        );

        let thresholds = params.thresholds();
        let predictor = &self.predictor;
        let mut scorer = |inst: &InstrumentData, index: usize| -> Option<f64> {
            let readings = inst.readings_at(index)?;
            let predicted = match predictor.predicted_change(&inst.instrument, readings.date) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(symbol = %inst.instrument.symbol, error = %e, "no prediction");
                    None
                }
            };
            Some(score_with(&inst.instrument, &readings, predicted, &thresholds).total_score)
        };

        let simulation = simulate(&data, &timeline, params, &self.fees, &mut scorer);
        let mut result =
            BacktestResult::from_simulation(params.clone(), simulation, Local::now().naive_local());

        let id = self.results.save_backtest(&result)?;
        result.id = Some(id);

        tracing::info!(
            id,
            final_balance = result.final_balance,
            total_return = result.total_return,
            sharpe = result.sharpe_ratio,
            max_drawdown = result.max_drawdown,
            trades = result.total_trades,
            stale_marks = result.stale_marks,
            "backtest complete"
        );
        Ok(result)
    }

    pub fn get_result(&self, id: i64) -> Result<Option<BacktestResult>, PapertraderError> {
        self.results.get_backtest(id)
    }

    /// Newest first.
    pub fn list_results(&self, limit: usize) -> Result<Vec<BacktestResult>, PapertraderError> {
        self.results.list_backtests(limit)
    }
}
