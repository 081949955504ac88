//! HTTP probe implementation.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{truncate_chars, Observation, ProbeError};
use crate::db::{HttpMethod, Target};

/// Widest UTF-8 encoding of one character.
const MAX_CHAR_BYTES: usize = 4;

/// Run an HTTP(S) request against the target.
///
/// Only the first `sample_limit` characters of the body are read; the rest of
/// the transfer is abandoned. Latency covers the headers plus that sample.
/// Expectations are checked by the caller.
pub async fn run_http_probe(
    client: &reqwest::Client,
    target: &Target,
    timeout: Duration,
    sample_limit: usize,
) -> Result<Observation, ProbeError> {
    let mut request = match target.method {
        HttpMethod::Get => client.get(&target.url),
        HttpMethod::Head => client.head(&target.url),
        HttpMethod::Post => client.post(&target.url),
    }
    .timeout(timeout);

    for (name, value) in &target.custom_headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let start = Instant::now();

    let mut response = request.send().await.map_err(|e| classify(e, timeout))?;

    let status_code = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    let body = if target.method == HttpMethod::Head {
        None
    } else {
        let sample = read_sample(&mut response, sample_limit)
            .await
            .map_err(|e| classify(e, timeout))?;
        Some(sample)
    };

    Ok(Observation {
        latency: start.elapsed(),
        status_code: Some(status_code),
        headers,
        body,
    })
}

/// Read chunks until `limit` characters are guaranteed, or the body ends.
async fn read_sample(response: &mut reqwest::Response, limit: usize) -> Result<String, reqwest::Error> {
    let max_bytes = limit.saturating_mul(MAX_CHAR_BYTES);
    let mut buf = Vec::new();
    while buf.len() < max_bytes {
        match response.chunk().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => break,
        }
    }
    buf.truncate(max_bytes);
    Ok(truncate_chars(&String::from_utf8_lossy(&buf), limit))
}

fn classify(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if e.is_connect() {
        ProbeError::Network(format!("connection failed: {}", e))
    } else if e.is_builder() {
        ProbeError::Config(e.to_string())
    } else {
        ProbeError::Network(e.to_string())
    }
}
