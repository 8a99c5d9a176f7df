use std::time::{Duration, Instant};

use super::http::RelayHttpClient;

/// Protocol version this client speaks. The relay advertises its own in
/// healthz; anything else keeps auto mode off the relay path.
pub const RELAY_PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub reachable: bool,
    pub version_ok: bool,
    pub version: Option<String>,
    pub latency: Duration,
}

impl ProbeReport {
    /// True when auto mode may take the relay path.
    pub fn usable(&self) -> bool {
        self.reachable && self.version_ok
    }
}

/// Lightweight reachability and version check. Deliberately one attempt;
/// the caller decides whether an unreachable relay means fallback or error.
pub async fn probe_relay(client: &RelayHttpClient) -> ProbeReport {
    let started = Instant::now();
    match client.healthz().await {
        Ok(health) => {
            let report = ProbeReport {
                reachable: health.ok,
                version_ok: health.version.as_deref() == Some(RELAY_PROTOCOL_VERSION),
                version: health.version,
                latency: started.elapsed(),
            };
            if report.usable() {
                tracing::debug!(
                    target: "mural::relay",
                    latency_ms = report.latency.as_millis() as u64,
                    "relay reachable"
                );
            } else {
                tracing::warn!(
                    target: "mural::relay",
                    reachable = report.reachable,
                    version = ?report.version,
                    expected = RELAY_PROTOCOL_VERSION,
                    "relay health check failed"
                );
            }
            report
        }
        Err(err) => {
            tracing::debug!(target: "mural::relay", error = %err, "relay unreachable");
            ProbeReport {
                reachable: false,
                version_ok: false,
                version: None,
                latency: started.elapsed(),
            }
        }
    }
}
