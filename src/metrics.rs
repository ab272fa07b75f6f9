//! Reconcile Metrics
//!
//! Prometheus collectors for reconcile passes, failed steps, QoS policy
//! operations and access token rotations. Collectors are registered on a
//! caller supplied registry so tests can use a private one.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Collectors updated by the control loop
#[derive(Debug, Clone)]
pub struct ReconcileMetrics {
    /// Finished passes by result (`success`, `error`, `invalid`)
    passes_total: IntCounterVec,
    /// Wall time of a pass
    pass_duration_seconds: Histogram,
    /// Failed steps, including dropped status writes
    step_failures_total: IntCounterVec,
    /// Policy create/update/delete calls by outcome
    policy_operations_total: IntCounterVec,
    /// Issued tokens by rotation reason
    token_rotations_total: IntCounterVec,
    registry: Arc<Registry>,
}

impl ReconcileMetrics {
    /// Register all collectors on `registry`
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let passes_total = IntCounterVec::new(
            Opts::new("reconcile_passes_total", "Finished reconcile passes"),
            &["result"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let pass_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "reconcile_pass_duration_seconds",
                "Duration of a reconcile pass in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(pass_duration_seconds.clone()))?;

        let step_failures_total = IntCounterVec::new(
            Opts::new(
                "reconcile_step_failures_total",
                "Failed reconcile steps",
            ),
            &["step"],
        )?;
        registry.register(Box::new(step_failures_total.clone()))?;

        let policy_operations_total = IntCounterVec::new(
            Opts::new(
                "qos_policy_operations_total",
                "QoS policy mutations sent to the backend",
            ),
            &["op", "result"],
        )?;
        registry.register(Box::new(policy_operations_total.clone()))?;

        let token_rotations_total = IntCounterVec::new(
            Opts::new("access_token_rotations_total", "Issued access tokens"),
            &["reason"],
        )?;
        registry.register(Box::new(token_rotations_total.clone()))?;

        Ok(Self {
            passes_total,
            pass_duration_seconds,
            step_failures_total,
            policy_operations_total,
            token_rotations_total,
            registry,
        })
    }

    /// Collectors on a fresh private registry
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::new(Arc::new(Registry::new()))
    }

    pub fn observe_pass(&self, result: &str, elapsed: Duration) {
        self.passes_total.with_label_values(&[result]).inc();
        self.pass_duration_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn step_failed(&self, step: &str) {
        self.step_failures_total.with_label_values(&[step]).inc();
    }

    pub fn policy_operation(&self, op: &str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.policy_operations_total
            .with_label_values(&[op, result])
            .inc();
    }

    pub fn token_rotated(&self, reason: &str) {
        self.token_rotations_total.with_label_values(&[reason]).inc();
    }

    /// Number of passes recorded with `result`
    pub fn passes(&self, result: &str) -> u64 {
        self.passes_total.with_label_values(&[result]).get()
    }

    /// Number of policy operations recorded for `op` and outcome
    pub fn policy_operations(&self, op: &str, ok: bool) -> u64 {
        let result = if ok { "success" } else { "error" };
        self.policy_operations_total
            .with_label_values(&[op, result])
            .get()
    }

    pub fn token_rotations(&self, reason: &str) -> u64 {
        self.token_rotations_total.with_label_values(&[reason]).get()
    }

    pub fn step_failures(&self, step: &str) -> u64 {
        self.step_failures_total.with_label_values(&[step]).get()
    }

    /// Render the registry in the Prometheus text format, served on `/metrics`
    pub fn export_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Arc::new(Registry::new());
        assert!(ReconcileMetrics::new(registry.clone()).is_ok());
        assert!(ReconcileMetrics::new(registry).is_err());
    }

    #[test]
    fn test_counters() {
        let metrics = ReconcileMetrics::unregistered().unwrap();
        metrics.observe_pass("success", Duration::from_millis(20));
        metrics.observe_pass("success", Duration::from_millis(30));
        metrics.policy_operation("create", true);
        metrics.policy_operation("delete", false);
        metrics.token_rotated("expiring");
        metrics.step_failed("ReportStatus");

        assert_eq!(metrics.passes("success"), 2);
        assert_eq!(metrics.step_failures("ReportStatus"), 1);
        assert_eq!(metrics.step_failures("Validate"), 0);
        assert_eq!(metrics.passes("error"), 0);
        assert_eq!(metrics.policy_operations("create", true), 1);
        assert_eq!(metrics.policy_operations("delete", false), 1);
        assert_eq!(metrics.token_rotations("expiring"), 1);
    }

    #[test]
    fn test_export_text() {
        let metrics = ReconcileMetrics::unregistered().unwrap();
        metrics.step_failed("EnsurePolicies");
        metrics.observe_pass("error", Duration::from_secs(1));

        let text = metrics.export_text().unwrap();
        assert!(text.contains("reconcile_step_failures_total{step=\"EnsurePolicies\"} 1"));
        assert!(text.contains("reconcile_pass_duration_seconds_count 1"));
    }
}
