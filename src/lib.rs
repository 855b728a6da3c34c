//! papertrader: paper trading with weighted technical scoring, rule-driven
//! automated rounds and a day-stepped backtester.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! engines wired over the ports in [`services`], concrete implementations in
//! [`adapters`].

pub mod domain;
pub mod ports;
pub mod services;
pub mod adapters;
pub mod cli;
pub mod logging;
