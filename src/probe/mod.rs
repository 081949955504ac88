//! Probe module for target checks.
//!
//! Supports HTTP(S), Ping, TCP and UDP probes. A probe never fails: every
//! error is folded into a DOWN [`ProbeResult`].

mod http;
mod ping;
mod tcp;
mod udp;

pub use http::*;
pub use ping::*;
pub use tcp::*;
pub use udp::*;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{MonitorStatus, MonitorType, ProbeFailure, ProbeResult, Target};

/// Upper bound of the start jitter, spent out of the target's timeout budget.
const MAX_JITTER_MS: u64 = 100;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("expectation failed: {0}")]
    ExpectationMismatch(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    pub fn failure(&self) -> ProbeFailure {
        match self {
            ProbeError::Timeout(_) => ProbeFailure::Timeout,
            ProbeError::ExpectationMismatch(_) => ProbeFailure::ExpectationMismatch,
            ProbeError::Network(_) | ProbeError::Config(_) | ProbeError::Command(_) => ProbeFailure::Network,
        }
    }
}

/// What a protocol check saw on the wire.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub latency: Duration,
    pub status_code: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl Observation {
    pub fn timed(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }
}

/// Executes one check against one target.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Must return within the target's timeout.
    async fn probe(&self, target: &Target) -> ProbeResult;
}

/// Prober that talks to the network.
pub struct NetworkProber {
    client: reqwest::Client,
    body_sample_limit: usize,
}

impl NetworkProber {
    pub fn new(body_sample_limit: usize) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("uptrail/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self {
            client,
            body_sample_limit,
        })
    }

    async fn check(&self, target: &Target) -> Result<Observation, ProbeError> {
        let timeout = target.timeout();
        match target.monitor_type {
            MonitorType::Http | MonitorType::Https => {
                let observation = run_http_probe(&self.client, target, timeout, self.body_sample_limit).await?;
                check_http_expectations(target, &observation)?;
                Ok(observation)
            }
            MonitorType::Ping => run_ping_probe(&target.url, timeout).await.map(Observation::timed),
            MonitorType::Tcp => run_tcp_probe(&target.url, timeout).await.map(Observation::timed),
            MonitorType::Udp => run_udp_probe(&target.url, target.expected_content.as_deref(), timeout).await,
        }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &Target) -> ProbeResult {
        let timeout = target.timeout();
        let jitter = Duration::from_millis(rand::random::<u64>() % MAX_JITTER_MS);

        // Add jitter to avoid thundering herd; the deadline covers it too
        let checked = async {
            tokio::time::sleep(jitter.min(timeout / 10)).await;
            self.check(target).await
        };
        let outcome = match tokio::time::timeout(timeout, checked).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };

        let result = build_result(target, outcome, self.body_sample_limit);
        tracing::debug!(
            "Probe {} ({}): {} in {:?}",
            target.name,
            target.monitor_type,
            result.status,
            result.response_time_ms
        );
        result
    }
}

/// HTTP(S) targets are UP only if every configured expectation holds.
pub fn check_http_expectations(target: &Target, observation: &Observation) -> Result<(), ProbeError> {
    if let (Some(expected), Some(actual)) = (target.expected_status_code, observation.status_code) {
        if expected != actual {
            return Err(ProbeError::ExpectationMismatch(format!(
                "expected status {}, got {}",
                expected, actual
            )));
        }
    }
    if let Some(expected) = &target.expected_content {
        let found = observation.body.as_deref().is_some_and(|b| b.contains(expected.as_str()));
        if !found {
            return Err(ProbeError::ExpectationMismatch(format!(
                "response body does not contain {:?}",
                expected
            )));
        }
    }
    Ok(())
}

/// Fold a check outcome into an immutable result.
///
/// Expectation mismatches keep whatever was observed on the wire.
pub fn build_result(
    target: &Target,
    outcome: Result<Observation, ProbeError>,
    body_sample_limit: usize,
) -> ProbeResult {
    let checked_at = Utc::now();
    match outcome {
        Ok(observation) => ProbeResult {
            id: Uuid::new_v4(),
            target_id: target.id,
            status: MonitorStatus::Up,
            response_time_ms: Some(millis(observation.latency)),
            status_code: observation.status_code,
            error_message: None,
            failure: None,
            response_headers: observation.headers,
            response_body_sample: observation.body.map(|b| truncate_chars(&b, body_sample_limit)),
            checked_at,
        },
        Err(e) => ProbeResult::down(target.id, e.failure(), e.to_string(), checked_at),
    }
}

fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 1_000_000.0).round() / 1000.0
}

/// Truncate to at most `limit` characters on a char boundary.
pub fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
