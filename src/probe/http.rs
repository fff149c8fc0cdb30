//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::{ProbeError, ProbeOutcome};

/// Longest response body kept for failed checks.
const MAX_BODY_CHARS: usize = 1024;

/// Run an HTTP GET against the given address.
///
/// Any 2xx or 3xx answer counts as success. Latency covers the full body
/// transfer.
pub async fn run_http_probe(address: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let start = Instant::now();

    let response = client.get(&url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else if e.is_builder() {
            ProbeError::Config(e.to_string())
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    let headers: serde_json::Map<String, serde_json::Value> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), serde_json::Value::String(v.to_string())))
        })
        .collect();

    let body = response.text().await.map_err(|e| ProbeError::Network(e.to_string()))?;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    let success = status.is_success() || status.is_redirection();
    Ok(ProbeOutcome {
        success,
        latency_ms: Some(latency_ms),
        status_code: Some(status.as_u16()),
        headers: Some(serde_json::Value::Object(headers)),
        body: (!success).then(|| truncate(&body, MAX_BODY_CHARS)),
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
