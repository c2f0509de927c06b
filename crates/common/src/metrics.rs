use std::sync::{Arc, OnceLock};

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Cloneable handle over the executor's metric instruments.
///
/// Passed into the executor so tests can observe counters without touching
/// process-global state; production wiring uses [`global_metrics`].
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    state_load_time_ms: IntGauge,
    state_load_warnings: IntCounter,
    state_load_errors: IntCounter,
    state_partial_loads: IntCounter,
    live_applications: IntGauge,
    expired_applications: IntCounter,
    truncated_applications: IntCounter,
    map_attempt_flush_delay_ms: IntGauge,
    map_attempt_flush_time_ms: IntGauge,
}

impl MetricsRegistry {
    /// Build a registry with all executor instruments registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record the wall-clock duration of one state-store load.
    pub fn set_state_load_time_ms(&self, millis: i64) {
        self.inner.state_load_time_ms.set(millis);
    }

    /// Count one recoverable oddity seen while replaying the state store.
    pub fn inc_state_load_warnings(&self) {
        self.inner.state_load_warnings.inc();
    }

    /// Count one failed state-store load.
    pub fn inc_state_load_errors(&self) {
        self.inner.state_load_errors.inc();
    }

    /// Count one load that stopped before consuming the whole log.
    pub fn inc_state_partial_loads(&self) {
        self.inner.state_partial_loads.inc();
    }

    /// Publish the current number of in-memory applications.
    pub fn set_live_applications(&self, count: i64) {
        self.inner.live_applications.set(count);
    }

    /// Count applications removed by retention expiry.
    pub fn inc_expired_applications(&self, count: u64) {
        self.inner.expired_applications.inc_by(count);
    }

    /// Count applications stopped for writing past their byte budget.
    pub fn inc_truncated_applications(&self) {
        self.inner.truncated_applications.inc();
    }

    /// Record the enqueue-to-start delay of one flush task.
    pub fn set_map_attempt_flush_delay_ms(&self, millis: i64) {
        self.inner.map_attempt_flush_delay_ms.set(millis);
    }

    /// Record the duration of one flush task.
    pub fn set_map_attempt_flush_time_ms(&self, millis: i64) {
        self.inner.map_attempt_flush_time_ms.set(millis);
    }

    /// Current value of the truncated-applications counter.
    pub fn truncated_applications(&self) -> u64 {
        self.inner.truncated_applications.get()
    }

    /// Current value of the partial-loads counter.
    pub fn state_partial_loads(&self) -> u64 {
        self.inner.state_partial_loads.get()
    }

    /// Current value of the load-warnings counter.
    pub fn state_load_warnings(&self) -> u64 {
        self.inner.state_load_warnings.get()
    }

    /// Render every registered family in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let state_load_time_ms = int_gauge(
            &registry,
            "sfl_state_load_time_ms",
            "Duration of the last state-store load",
        );
        let state_load_warnings = int_counter(
            &registry,
            "sfl_state_load_warnings_total",
            "Recoverable oddities seen while replaying the state store",
        );
        let state_load_errors = int_counter(
            &registry,
            "sfl_state_load_errors_total",
            "State-store loads that failed outright",
        );
        let state_partial_loads = int_counter(
            &registry,
            "sfl_state_partial_loads_total",
            "State-store loads that stopped before the end of the log",
        );
        let live_applications = int_gauge(
            &registry,
            "sfl_live_applications",
            "Applications currently tracked in memory",
        );
        let expired_applications = int_counter(
            &registry,
            "sfl_expired_applications_total",
            "Applications removed by retention expiry",
        );
        let truncated_applications = int_counter(
            &registry,
            "sfl_truncated_applications_total",
            "Applications stopped for exceeding their write-byte budget",
        );
        let map_attempt_flush_delay_ms = int_gauge(
            &registry,
            "sfl_map_attempt_flush_delay_ms",
            "Enqueue-to-start delay of the last flush task",
        );
        let map_attempt_flush_time_ms = int_gauge(
            &registry,
            "sfl_map_attempt_flush_time_ms",
            "Duration of the last flush task",
        );

        Self {
            registry,
            state_load_time_ms,
            state_load_warnings,
            state_load_errors,
            state_partial_loads,
            live_applications,
            expired_applications,
            truncated_applications,
            map_attempt_flush_delay_ms,
            map_attempt_flush_time_ms,
        }
    }
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry.register(Box::new(g.clone())).expect("register gauge");
    g
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry used by the production bootstrap.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.set_live_applications(4);
        m.inc_truncated_applications();
        let text = m.render_prometheus();
        assert!(text.contains("sfl_live_applications 4"));
        assert!(text.contains("sfl_truncated_applications_total 1"));
    }

    #[test]
    fn counters_are_readable() {
        let m = MetricsRegistry::new();
        assert_eq!(m.truncated_applications(), 0);
        m.inc_truncated_applications();
        m.inc_state_partial_loads();
        m.inc_state_load_warnings();
        assert_eq!(m.truncated_applications(), 1);
        assert_eq!(m.state_partial_loads(), 1);
        assert_eq!(m.state_load_warnings(), 1);
    }
}
