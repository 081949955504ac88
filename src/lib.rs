//! Uptrail - uptime monitoring engine.
//!
//! Probes registered targets at their own intervals, tracks up/down state,
//! rolls results into daily uptime records and decides which notifications
//! to send.

pub mod aggregator;
pub mod config;
pub mod db;
pub mod engine;
pub mod notifier;
pub mod probe;
pub mod scheduler;
pub mod tracker;
pub mod validation;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
