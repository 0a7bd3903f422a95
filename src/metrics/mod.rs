//! Prometheus metrics for the detection agents and failover flows
//!
//! Metrics live in a process-wide registry. Nothing is served over HTTP;
//! embedders scrape [`Metrics::gather`] however they expose the process.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Sweep metrics
    /// Completed sweeps by db type
    pub sweeps_total: IntCounterVec,
    /// Sweep duration histogram (in seconds)
    pub sweep_duration_seconds: HistogramVec,
    /// Instances assigned to the agent by db type
    pub sweep_instances: IntGaugeVec,

    // Detection metrics
    /// Probe outcomes by db type and status
    pub probe_results_total: IntCounterVec,

    // GM metrics
    /// GM report outcomes (delivered, suppressed, exhausted, encode_error)
    pub gm_reports_total: IntCounterVec,
    /// Currently connected GM nodes by db type
    pub gm_connected: IntGaugeVec,

    // Switch metrics
    /// Switch stage outcomes
    pub switch_stage_total: IntCounterVec,
    /// Name-service release failures by provider
    pub name_service_failures_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sweeps_total = IntCounterVec::new(
            Opts::new("dbha_sweeps_total", "Total number of completed detection sweeps"),
            &["db_type"],
        )
        .unwrap();

        let sweep_duration_seconds = HistogramVec::new(
            HistogramOpts::new("dbha_sweep_duration_seconds", "Sweep duration in seconds")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["db_type"],
        )
        .unwrap();

        let sweep_instances = IntGaugeVec::new(
            Opts::new("dbha_sweep_instances", "Instances assigned to the agent"),
            &["db_type"],
        )
        .unwrap();

        let probe_results_total = IntCounterVec::new(
            Opts::new("dbha_probe_results_total", "Total probe outcomes by status"),
            &["db_type", "status"],
        )
        .unwrap();

        let gm_reports_total = IntCounterVec::new(
            Opts::new("dbha_gm_reports_total", "Total GM report attempts by outcome"),
            &["outcome"],
        )
        .unwrap();

        let gm_connected = IntGaugeVec::new(
            Opts::new("dbha_gm_connected", "Connected GM nodes"),
            &["db_type"],
        )
        .unwrap();

        let switch_stage_total = IntCounterVec::new(
            Opts::new("dbha_switch_stage_total", "Switch stage outcomes"),
            &["stage", "result"], // check/do/final/rollback, ok/failed
        )
        .unwrap();

        let name_service_failures_total = IntCounterVec::new(
            Opts::new(
                "dbha_name_service_failures_total",
                "Name-service release failures by provider",
            ),
            &["provider"],
        )
        .unwrap();

        registry.register(Box::new(sweeps_total.clone())).unwrap();
        registry
            .register(Box::new(sweep_duration_seconds.clone()))
            .unwrap();
        registry.register(Box::new(sweep_instances.clone())).unwrap();
        registry
            .register(Box::new(probe_results_total.clone()))
            .unwrap();
        registry.register(Box::new(gm_reports_total.clone())).unwrap();
        registry.register(Box::new(gm_connected.clone())).unwrap();
        registry
            .register(Box::new(switch_stage_total.clone()))
            .unwrap();
        registry
            .register(Box::new(name_service_failures_total.clone()))
            .unwrap();

        Self {
            registry,
            sweeps_total,
            sweep_duration_seconds,
            sweep_instances,
            probe_results_total,
            gm_reports_total,
            gm_connected,
            switch_stage_total,
            name_service_failures_total,
        }
    }

    /// Record a completed sweep
    pub fn record_sweep(&self, db_type: &str, instances: usize, duration_secs: f64) {
        self.sweeps_total.with_label_values(&[db_type]).inc();
        self.sweep_duration_seconds
            .with_label_values(&[db_type])
            .observe(duration_secs);
        self.sweep_instances
            .with_label_values(&[db_type])
            .set(instances as i64);
    }

    pub fn record_probe(&self, db_type: &str, status: &str) {
        self.probe_results_total
            .with_label_values(&[db_type, status])
            .inc();
    }

    pub fn record_gm_report(&self, outcome: &str) {
        self.gm_reports_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_gm_connected(&self, db_type: &str, connected: i64) {
        self.gm_connected.with_label_values(&[db_type]).set(connected);
    }

    pub fn record_switch_stage(&self, stage: &str, ok: bool) {
        let result = if ok { "ok" } else { "failed" };
        self.switch_stage_total
            .with_label_values(&[stage, result])
            .inc();
    }

    pub fn record_name_service_failure(&self, provider: &str) {
        self.name_service_failures_total
            .with_label_values(&[provider])
            .inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
