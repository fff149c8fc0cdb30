//! TCP connect probe implementation.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::{ProbeError, ProbeOutcome};

/// Open a TCP connection to `host:port`; latency is the connect time.
pub async fn run_tcp_probe(address: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
    if address.rsplit_once(':').map_or(true, |(host, port)| host.is_empty() || port.parse::<u16>().is_err()) {
        return Err(ProbeError::Config(format!("expected host:port, got {}", address)));
    }

    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Ok(ProbeOutcome {
            success: true,
            latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
            ..Default::default()
        }),
        Ok(Err(e)) => Err(ProbeError::Network(e.to_string())),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let outcome = run_tcp_probe(&addr, Duration::from_secs(1)).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe_rejects_bad_address() {
        let result = run_tcp_probe("no-port", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }
}
