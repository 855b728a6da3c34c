//! Engines wired over the ports. Each engine is constructed with its
//! collaborators; nothing is process-wide.

pub mod auto_trading_service;
pub mod backtest_service;
pub mod scoring_service;
pub mod trading_service;
