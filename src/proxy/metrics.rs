//! Operational metrics.
//!
//! Aggregate counters only; nothing here identifies a user or a
//! destination. Safe to scrape for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Proxy metrics collector.
pub struct ProxyMetrics {
    start_time: Instant,
    /// Downstream connections seen over the lifetime of the instance
    total_connections: AtomicU64,
    /// Downstream connections currently live
    active_connections: AtomicU64,
    /// Circuits opened
    circuits_opened: AtomicU64,
    /// Circuits destroyed (finished or axed)
    circuits_closed: AtomicU64,
    /// Wire bytes written to downstream connections
    bytes_sent: AtomicU64,
    /// Wire bytes read from downstream connections
    bytes_received: AtomicU64,
    /// Circuits terminated by protocol violations
    protocol_errors: AtomicU64,
}

impl ProxyMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            circuits_opened: AtomicU64::new(0),
            circuits_closed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
        }
    }

    /// Record a new downstream connection.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a downstream connection going away.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a circuit opening.
    pub fn increment_circuits(&self) {
        self.circuits_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a circuit being destroyed.
    pub fn increment_circuits_closed(&self) {
        self.circuits_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add wire bytes written downstream.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add wire bytes read from downstream.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a circuit killed by a protocol violation.
    pub fn increment_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total downstream connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get live downstream connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get circuits opened.
    pub fn circuits_opened(&self) -> u64 {
        self.circuits_opened.load(Ordering::Relaxed)
    }

    /// Get circuits destroyed.
    pub fn circuits_closed(&self) -> u64 {
        self.circuits_closed.load(Ordering::Relaxed)
    }

    /// Get wire bytes written downstream.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get wire bytes read from downstream.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Get circuits killed by protocol violations.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        format!(
            r#"braid metrics
=============
Uptime: {} seconds

Circuits:
  Opened: {}
  Closed: {}

Downstream connections:
  Total:  {}
  Active: {}

Wire traffic:
  Sent:     {} bytes
  Received: {} bytes

Protocol errors: {}
"#,
            self.uptime_secs(),
            self.circuits_opened(),
            self.circuits_closed(),
            self.total_connections(),
            self.active_connections(),
            self.bytes_sent(),
            self.bytes_received(),
            self.protocol_errors(),
        )
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counting() {
        let metrics = ProxyMetrics::new();

        metrics.increment_connections();
        metrics.increment_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 2);

        metrics.decrement_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_circuit_counting() {
        let metrics = ProxyMetrics::new();
        metrics.increment_circuits();
        metrics.increment_circuits_closed();
        assert_eq!(metrics.circuits_opened(), 1);
        assert_eq!(metrics.circuits_closed(), 1);
    }

    #[test]
    fn test_format_report() {
        let metrics = ProxyMetrics::new();
        metrics.increment_circuits();
        metrics.add_bytes_sent(512);

        let report = metrics.format_report();
        assert!(report.contains("braid metrics"));
        assert!(report.contains("Opened: 1"));
        assert!(report.contains("Sent:     512 bytes"));
    }
}
