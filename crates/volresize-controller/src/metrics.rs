use crate::error::Result;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics emitted by the resize controller
///
/// Registered against a caller-supplied [`Registry`] so tests can use a
/// fresh one each.
#[derive(Clone)]
pub struct ResizerMetrics {
    reconcile_attempts: IntCounter,
    reconcile_successes: IntCounter,
    reconcile_failures: IntCounterVec,
    driver_calls: IntCounterVec,
    queue_depth: IntGauge,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl ResizerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let reconcile_attempts = register(
            registry,
            IntCounter::with_opts(Opts::new(
                "volresize_reconcile_attempts_total",
                "Reconciliation passes started",
            ))?,
        )?;
        let reconcile_successes = register(
            registry,
            IntCounter::with_opts(Opts::new(
                "volresize_reconcile_successes_total",
                "Reconciliation passes that finished without a retry",
            ))?,
        )?;
        let reconcile_failures = register(
            registry,
            IntCounterVec::new(
                Opts::new(
                    "volresize_reconcile_failures_total",
                    "Reconciliation passes that were rescheduled, grouped by category",
                ),
                &["category"],
            )?,
        )?;
        let driver_calls = register(
            registry,
            IntCounterVec::new(
                Opts::new(
                    "volresize_driver_expand_calls_total",
                    "Driver expand calls grouped by result",
                ),
                &["driver", "result"],
            )?,
        )?;
        let queue_depth = register(
            registry,
            IntGauge::with_opts(Opts::new(
                "volresize_workqueue_depth",
                "Claims waiting in the work queue",
            ))?,
        )?;

        Ok(Self {
            reconcile_attempts,
            reconcile_successes,
            reconcile_failures,
            driver_calls,
            queue_depth,
        })
    }

    /// Metrics registered against a private registry, for tests and callers
    /// that do not export them
    pub fn unregistered() -> Result<Self> {
        Self::new(&Registry::new())
    }

    pub fn record_attempt(&self) {
        self.reconcile_attempts.inc();
    }

    pub fn record_success(&self) {
        self.reconcile_successes.inc();
    }

    pub fn record_failure(&self, category: &str) {
        self.reconcile_failures.with_label_values(&[category]).inc();
    }

    pub fn record_driver_call(&self, driver: &str, result: &str) {
        self.driver_calls.with_label_values(&[driver, result]).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn attempts(&self) -> u64 {
        self.reconcile_attempts.get()
    }

    pub fn successes(&self) -> u64 {
        self.reconcile_successes.get()
    }

    pub fn failures(&self, category: &str) -> u64 {
        self.reconcile_failures.with_label_values(&[category]).get()
    }

    pub fn driver_calls(&self, driver: &str, result: &str) -> u64 {
        self.driver_calls.with_label_values(&[driver, result]).get()
    }
}

/// Render every metric in `registry` in the Prometheus text format
pub fn encode_text(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let registry = Registry::new();
        let metrics = ResizerMetrics::new(&registry).unwrap();

        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_success();
        metrics.record_failure("in_use");
        metrics.record_driver_call("a.csi", "success");
        metrics.set_queue_depth(3);

        assert_eq!(metrics.attempts(), 2);
        assert_eq!(metrics.successes(), 1);
        assert_eq!(metrics.failures("in_use"), 1);
        assert_eq!(metrics.failures("transient"), 0);
        assert_eq!(metrics.driver_calls("a.csi", "success"), 1);

        let text = encode_text(&registry).unwrap();
        assert!(text.contains("volresize_reconcile_attempts_total 2"));
        assert!(text.contains("volresize_workqueue_depth 3"));
        assert!(text.contains("category=\"in_use\""));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        ResizerMetrics::new(&registry).unwrap();
        assert!(ResizerMetrics::new(&registry).is_err());
    }
}
