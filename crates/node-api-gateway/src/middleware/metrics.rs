//! Process-wide gateway counters.
//!
//! Exported as JSON and Prometheus text on the metrics listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Gateway metrics
#[derive(Default)]
pub struct GatewayMetrics {
    // HTTP requests
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,

    // Node sessions
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub sessions_failed: AtomicU64,

    // Streams
    pub streams_active: AtomicU64,
    pub events_forwarded: AtomicU64,

    // Submissions
    pub tx_submitted: AtomicU64,
    pub tx_accepted: AtomicU64,
    pub tx_rejected: AtomicU64,

    // Latency tracking (simplified - in production use histograms)
    pub total_latency_ms: AtomicU64,
    pub request_count_for_latency: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished HTTP request
    pub fn record_request(&self, success: bool, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.request_count_for_latency.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// A session that could not be opened
    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_active(&self) -> u64 {
        let opened = self.sessions_opened.load(Ordering::Relaxed);
        let closed = self.sessions_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    pub fn record_stream_started(&self) {
        self.streams_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_finished(&self) {
        self.streams_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_event_forwarded(&self) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submission(&self, accepted: bool, rejected: bool) {
        self.tx_submitted.fetch_add(1, Ordering::Relaxed);
        if accepted {
            self.tx_accepted.fetch_add(1, Ordering::Relaxed);
        }
        if rejected {
            self.tx_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get average latency in ms
    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.request_count_for_latency.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, &str, u64); 11] = [
            ("node_api_requests_total", "counter", "Total HTTP requests", self.requests_total.load(Ordering::Relaxed)),
            ("node_api_requests_success_total", "counter", "Successful HTTP requests", self.requests_success.load(Ordering::Relaxed)),
            ("node_api_requests_error_total", "counter", "Failed HTTP requests", self.requests_error.load(Ordering::Relaxed)),
            ("node_api_sessions_opened_total", "counter", "Node sessions opened", self.sessions_opened.load(Ordering::Relaxed)),
            ("node_api_sessions_failed_total", "counter", "Node sessions that failed to open", self.sessions_failed.load(Ordering::Relaxed)),
            ("node_api_sessions_active", "gauge", "Node sessions currently open", self.sessions_active()),
            ("node_api_streams_active", "gauge", "Streams currently attached", self.streams_active.load(Ordering::Relaxed)),
            ("node_api_events_forwarded_total", "counter", "Stream items written to clients", self.events_forwarded.load(Ordering::Relaxed)),
            ("node_api_tx_submitted_total", "counter", "Transactions forwarded to the node", self.tx_submitted.load(Ordering::Relaxed)),
            ("node_api_tx_accepted_total", "counter", "Transactions accepted by the node", self.tx_accepted.load(Ordering::Relaxed)),
            ("node_api_tx_rejected_total", "counter", "Transactions rejected by the node", self.tx_rejected.load(Ordering::Relaxed)),
        ];

        let mut output = String::new();
        for (name, kind, help, value) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
            ));
        }
        output.push_str(&format!(
            "# HELP node_api_average_latency_ms Average request latency\n\
             # TYPE node_api_average_latency_ms gauge\n\
             node_api_average_latency_ms {:.2}\n",
            self.average_latency_ms()
        ));
        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "success": self.requests_success.load(Ordering::Relaxed),
                "error": self.requests_error.load(Ordering::Relaxed),
            },
            "sessions": {
                "opened": self.sessions_opened.load(Ordering::Relaxed),
                "closed": self.sessions_closed.load(Ordering::Relaxed),
                "failed": self.sessions_failed.load(Ordering::Relaxed),
                "active": self.sessions_active(),
            },
            "streams": {
                "active": self.streams_active.load(Ordering::Relaxed),
                "events_forwarded": self.events_forwarded.load(Ordering::Relaxed),
            },
            "transactions": {
                "submitted": self.tx_submitted.load(Ordering::Relaxed),
                "accepted": self.tx_accepted.load(Ordering::Relaxed),
                "rejected": self.tx_rejected.load(Ordering::Relaxed),
            },
            "latency": {
                "average_ms": self.average_latency_ms(),
            }
        })
    }
}

/// Request timing helper
pub struct RequestTimer {
    start: Instant,
    metrics: Arc<GatewayMetrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self, success: bool) {
        let latency_ms = self.start.elapsed().as_millis() as u64;
        self.metrics.record_request(success, latency_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = GatewayMetrics::new();

        metrics.record_request(true, 100);
        metrics.record_request(true, 200);
        metrics.record_request(false, 50);

        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.requests_success.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.requests_error.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_average_latency() {
        let metrics = GatewayMetrics::new();

        metrics.record_request(true, 100);
        metrics.record_request(true, 200);
        metrics.record_request(true, 300);

        assert!((metrics.average_latency_ms() - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_session_gauge() {
        let metrics = GatewayMetrics::new();

        metrics.record_session_opened();
        metrics.record_session_opened();
        metrics.record_session_closed();

        assert_eq!(metrics.sessions_active(), 1);
    }

    #[test]
    fn test_submission_counters() {
        let metrics = GatewayMetrics::new();
        metrics.record_submission(true, false);
        metrics.record_submission(false, true);
        metrics.record_submission(false, false);

        let json = metrics.to_json();
        assert_eq!(json["transactions"]["submitted"], 3);
        assert_eq!(json["transactions"]["accepted"], 1);
        assert_eq!(json["transactions"]["rejected"], 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = GatewayMetrics::new();
        metrics.record_stream_started();

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE node_api_streams_active gauge"));
        assert!(text.contains("node_api_streams_active 1\n"));
        assert!(text.contains("node_api_average_latency_ms 0.00"));
    }
}
