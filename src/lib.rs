//! venuebot library
//!
//! Multi-venue trading engine: normalized exchange adapters, market-data
//! streams with candle-close detection, and the order/position lifecycle.

pub mod candle_close;
pub mod config;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod position;
pub mod signals;
pub mod strategy;
pub mod stream;
pub mod time_sync;
pub mod types;
