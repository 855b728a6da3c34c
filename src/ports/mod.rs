//! Port traits the services depend on.

pub mod config_port;
pub mod data_port;
pub mod prediction_port;
pub mod repository_port;
