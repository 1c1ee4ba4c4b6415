use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec};
use prometheus::Registry;
use tokio::time::Instant;

use crate::error::TraceableError;

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";
pub const RESULT_FAILED: &str = "failed";
pub const RESULT_TIMEOUT: &str = "timeout";

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reconcile_runs: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub reconcile_failures: IntCounterVec,
    pub peer_sessions: IntGaugeVec,
    pub advertised_routes: IntGauge,
    pub reconcile_errors: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_runs = IntCounterVec::new(
            opts!(
                "bgpcp_reconcile_runs_total",
                "Total count of reconcile passes by result",
            ),
            &["result"],
        )
        .expect("metric options are valid");
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "bgpcp_reconcile_duration_seconds",
                "The duration of a reconcile pass to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 30., 60.]),
            &[],
        )
        .expect("metric options are valid");
        let reconcile_failures = IntCounterVec::new(
            opts!(
                "bgpcp_reconcile_failures_total",
                "Total count of failed reconcile stages by error",
            ),
            &["error"],
        )
        .expect("metric options are valid");
        let peer_sessions = IntGaugeVec::new(
            opts!("bgpcp_peer_sessions", "Number of BGP peer sessions by state"),
            &["state"],
        )
        .expect("metric options are valid");
        let advertised_routes = IntGauge::with_opts(opts!(
            "bgpcp_advertised_routes",
            "Number of paths advertised by all routers"
        ))
        .expect("metric options are valid");
        let reconcile_errors = IntGaugeVec::new(
            opts!(
                "bgpcp_reconcile_errors",
                "Number of reconcile error rows by resource kind"
            ),
            &["kind"],
        )
        .expect("metric options are valid");
        Metrics {
            reconcile_runs,
            reconcile_duration,
            reconcile_failures,
            peer_sessions,
            advertised_routes,
            reconcile_errors,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_runs.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.reconcile_failures.clone()))?;
        registry.register(Box::new(self.peer_sessions.clone()))?;
        registry.register(Box::new(self.advertised_routes.clone()))?;
        registry.register(Box::new(self.reconcile_errors.clone()))?;
        Ok(self)
    }

    pub fn reconcile_run(&self, result: &str) {
        self.reconcile_runs.with_label_values(&[result]).inc()
    }

    pub fn reconcile_failure<E: TraceableError>(&self, error: &E) {
        self.reconcile_failures
            .with_label_values(&[error.metric_label().as_str()])
            .inc()
    }

    /// Replace the per-state session gauges with a fresh count.
    pub fn set_peer_sessions<'a>(&self, counts: impl IntoIterator<Item = (&'a str, i64)>) {
        self.peer_sessions.reset();
        for (state, n) in counts {
            self.peer_sessions.with_label_values(&[state]).set(n);
        }
    }

    pub fn set_advertised_routes(&self, n: i64) {
        self.advertised_routes.set(n)
    }

    pub fn set_reconcile_errors<'a>(&self, counts: impl IntoIterator<Item = (&'a str, i64)>) {
        self.reconcile_errors.reset();
        for (kind, n) in counts {
            self.reconcile_errors.with_label_values(&[kind]).set(n);
        }
    }

    pub fn measure(&self) -> ReconcileMeasurer {
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}
