//! Configuration module for Uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Global cap on probes in flight (default: 10)
    pub max_concurrent_probes: usize,
    /// Scheduler tick (default: 1s)
    pub tick_interval: Duration,
    /// How often active targets are reloaded from storage (default: 30s)
    pub refresh_interval: Duration,
    /// Consecutive failures before a target is marked DOWN (default: 1)
    pub failure_threshold: u32,
    /// How long shutdown waits for in-flight probes (default: 10s)
    pub shutdown_grace: Duration,
    /// Upper bound on a single notification delivery (default: 10s)
    pub delivery_timeout: Duration,
    /// Characters of response body kept on each result (default: 5000)
    pub body_sample_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "uptrail.db".to_string(),
            max_concurrent_probes: 10,
            tick_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(30),
            failure_threshold: 1,
            shutdown_grace: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(10),
            body_sample_limit: 5000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_DB_PATH`: database file path
    /// - `UPTRAIL_MAX_CONCURRENT_PROBES`: probes in flight at once
    /// - `UPTRAIL_TICK_MS`: scheduler tick in milliseconds
    /// - `UPTRAIL_REFRESH_SECS`: target reload period
    /// - `UPTRAIL_FAILURE_THRESHOLD`: consecutive failures before DOWN
    /// - `UPTRAIL_SHUTDOWN_GRACE_SECS`: shutdown grace period
    /// - `UPTRAIL_DELIVERY_TIMEOUT_SECS`: per-delivery timeout
    /// - `UPTRAIL_BODY_SAMPLE_LIMIT`: response sample length
    ///
    /// Unparseable values keep the default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(n) = parse(&lookup, "UPTRAIL_MAX_CONCURRENT_PROBES") {
            cfg.max_concurrent_probes = n;
        }
        if let Some(ms) = parse(&lookup, "UPTRAIL_TICK_MS") {
            cfg.tick_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, "UPTRAIL_REFRESH_SECS") {
            cfg.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, "UPTRAIL_FAILURE_THRESHOLD") {
            cfg.failure_threshold = n;
        }
        if let Some(secs) = parse(&lookup, "UPTRAIL_SHUTDOWN_GRACE_SECS") {
            cfg.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "UPTRAIL_DELIVERY_TIMEOUT_SECS") {
            cfg.delivery_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, "UPTRAIL_BODY_SAMPLE_LIMIT") {
            cfg.body_sample_limit = n;
        }

        cfg.normalized()
    }

    /// Clamp values that would stall the engine.
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_probes = self.max_concurrent_probes.max(1);
        self.failure_threshold = self.failure_threshold.max(1);
        if self.tick_interval.is_zero() {
            self.tick_interval = Duration::from_millis(100);
        }
        if self.refresh_interval.is_zero() {
            self.refresh_interval = Duration::from_secs(1);
        }
        self
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", key, value);
            None
        }
    }
}
