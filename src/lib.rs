//! PredictPool lifecycle backend
//!
//! Runs a recurring up/down prediction game in nested time windows. Epochs are split into
//! rounds; a scheduler pre-generates windows, fires each boundary transition once, and
//! settles epoch weights and vault rewards.

pub mod config;
pub mod lifecycle;
pub mod models;
pub mod price;
pub mod settlement;
pub mod store;

pub use config::{ConfigError, PoolConfig};
pub use store::PoolDb;
