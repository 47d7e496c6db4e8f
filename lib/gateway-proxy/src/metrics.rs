//! Prometheus metrics for gateway traffic

use anyhow::Result;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Label used for requests that matched no pipeline
pub const NO_PIPELINE: &str = "-";

/// Prometheus metrics collector for gateway requests
#[derive(Clone)]
pub struct GatewayMetrics {
    /// Completed requests by pipeline and status code
    pub requests_total: IntCounterVec,
    /// End-to-end request latency by pipeline
    pub request_duration_seconds: HistogramVec,
    /// Backend calls that ended in 502
    pub upstream_failures_total: IntCounter,
    /// Chains stopped early, by the halting policy
    pub policy_halts_total: IntCounterVec,
    pub registry: Arc<Registry>,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total requests handled by the gateway"),
            &["pipeline", "status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Request latency in seconds",
            ),
            &["pipeline"],
        )?;

        let upstream_failures_total = IntCounter::new(
            "gateway_upstream_failures_total",
            "Backend calls that failed or timed out",
        )?;

        let policy_halts_total = IntCounterVec::new(
            Opts::new("gateway_policy_halts_total", "Policy chains halted by a policy"),
            &["policy"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(upstream_failures_total.clone()))?;
        registry.register(Box::new(policy_halts_total.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            upstream_failures_total,
            policy_halts_total,
            registry,
        })
    }

    pub fn observe_request(&self, pipeline: Option<&str>, status: u16, elapsed: Duration) {
        let pipeline = pipeline.unwrap_or(NO_PIPELINE);
        self.requests_total
            .with_label_values(&[pipeline, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[pipeline])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_halt(&self, policy: &str) {
        self.policy_halts_total.with_label_values(&[policy]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = GatewayMetrics::new().expect("Failed to create metrics");
        assert!(metrics.gather().is_ok());
    }

    #[test]
    fn test_observe_request() {
        let metrics = GatewayMetrics::new().expect("Failed to create metrics");
        metrics.observe_request(Some("api"), 200, Duration::from_millis(12));
        metrics.observe_request(None, 404, Duration::from_millis(1));

        let text = metrics.gather().expect("Failed to gather metrics");
        assert!(text.contains("# TYPE gateway_requests_total counter"));
        assert!(text.contains(r#"gateway_requests_total{pipeline="api",status="200"} 1"#));
        assert!(text.contains(r#"gateway_requests_total{pipeline="-",status="404"} 1"#));
        assert!(text.contains("gateway_request_duration_seconds_bucket"));
    }

    #[test]
    fn test_clones_share_registry() {
        let metrics = GatewayMetrics::new().expect("Failed to create metrics");
        let clone = metrics.clone();
        clone.upstream_failures_total.inc();
        clone.observe_halt("terminate");

        let text = metrics.gather().expect("Failed to gather metrics");
        assert!(text.contains("gateway_upstream_failures_total 1"));
        assert!(text.contains(r#"gateway_policy_halts_total{policy="terminate"} 1"#));
    }
}
