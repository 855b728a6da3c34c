//! Core domain types and logic: indicators, scoring, the ledger, the
//! backtest simulation and automated-trading rules.

pub mod ohlcv;
pub mod indicator;
pub mod instrument_data;
pub mod scoring;
pub mod account;
pub mod ledger;
pub mod backtest;
pub mod auto_trading;
pub mod metrics;
pub mod config_validation;
pub mod error;
