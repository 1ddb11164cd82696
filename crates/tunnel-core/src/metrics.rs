//! `--profile` counters, accumulated in-process and flushed as one JSON
//! document on shutdown rather than served live over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    bytes_client_to_server: AtomicU64,
    bytes_server_to_client: AtomicU64,
    relays_opened: AtomicU64,
    relays_closed: AtomicU64,
    handshake_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_client_to_server(&self, n: usize) {
        self.bytes_client_to_server.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_server_to_client(&self, n: usize) {
        self.bytes_server_to_client.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_relay_opened(&self) {
        self.relays_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_closed(&self) {
        self.relays_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_client_to_server: self.bytes_client_to_server.load(Ordering::Relaxed),
            bytes_server_to_client: self.bytes_server_to_client.load(Ordering::Relaxed),
            relays_opened: self.relays_opened.load(Ordering::Relaxed),
            relays_closed: self.relays_closed.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_client_to_server: u64,
    pub bytes_server_to_client: u64,
    pub relays_opened: u64,
    pub relays_closed: u64,
    pub handshake_failures: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = Metrics::new();
        metrics.record_client_to_server(10);
        metrics.record_relay_opened();
        metrics.record_handshake_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_client_to_server, 10);
        assert_eq!(snap.relays_opened, 1);
        assert_eq!(snap.handshake_failures, 1);
        assert_eq!(snap.relays_closed, 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let metrics = Metrics::new();
        let json = metrics.snapshot().to_json().unwrap();
        assert!(json.contains("bytes_client_to_server"));
    }
}
