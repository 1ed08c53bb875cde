//! Prometheus metrics for the sharding layer
//!
//! Process-wide registry; `gather()` renders the text exposition format.

use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Shardgroup metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Query metrics
    /// Statements executed by group, shard and operation
    pub queries_total: IntCounterVec,
    /// Statement latency histogram (in seconds)
    pub query_duration_seconds: HistogramVec,
    /// Query errors by class
    pub query_errors_total: IntCounterVec,

    // Routing metrics
    /// Routed operations by group and shard
    pub routes_total: IntCounterVec,

    // Retry metrics
    /// Retry decisions by outcome (retried, exhausted, permanent)
    pub retry_total: IntCounterVec,

    // Fan-out metrics
    /// Cross-shard operations by result
    pub fanout_total: IntCounterVec,
    /// Cross-shard operation latency (in seconds)
    pub fanout_duration_seconds: HistogramVec,

    // Health check metrics
    /// Health check results
    pub health_check_total: IntCounterVec,
    /// Current connection counts by health status
    pub health_connections: IntGaugeVec,
}

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter definition");
    register(registry, vec)
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let opts = HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec());
    let vec = HistogramVec::new(opts, labels).expect("valid histogram definition");
    register(registry, vec)
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let queries_total = counter_vec(
            &registry,
            "shardgroup_queries_total",
            "Total number of statements executed",
            &["group", "shard", "op"],
        );
        let query_duration_seconds = histogram_vec(
            &registry,
            "shardgroup_query_duration_seconds",
            "Statement latency in seconds",
            &["group", "op"],
        );
        let query_errors_total = counter_vec(
            &registry,
            "shardgroup_query_errors_total",
            "Total number of failed statements",
            &["class"], // permanent, exhausted, not_found
        );
        let routes_total = counter_vec(
            &registry,
            "shardgroup_routes_total",
            "Total number of routed operations",
            &["group", "shard"],
        );
        let retry_total = counter_vec(
            &registry,
            "shardgroup_retry_total",
            "Retry decisions by outcome",
            &["outcome"],
        );
        let fanout_total = counter_vec(
            &registry,
            "shardgroup_fanout_total",
            "Total number of cross-shard operations",
            &["result"],
        );
        let fanout_duration_seconds = histogram_vec(
            &registry,
            "shardgroup_fanout_duration_seconds",
            "Cross-shard operation latency in seconds",
            &["result"],
        );
        let health_check_total = counter_vec(
            &registry,
            "shardgroup_health_check_total",
            "Total number of health checks by result",
            &["result"], // success, failure
        );
        let health_connections = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(
                    "shardgroup_health_connections",
                    "Current number of connections by health status",
                ),
                &["status"],
            )
            .expect("valid gauge definition"),
        );

        Self {
            registry,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            routes_total,
            retry_total,
            fanout_total,
            fanout_duration_seconds,
            health_check_total,
            health_connections,
        }
    }

    /// Record a statement execution
    pub fn record_query(&self, group: &str, shard_id: u32, op: &str, duration_secs: f64) {
        self.queries_total
            .with_label_values(&[group, &shard_id.to_string(), op])
            .inc();
        self.query_duration_seconds
            .with_label_values(&[group, op])
            .observe(duration_secs);
    }

    /// Record a query error
    pub fn record_query_error(&self, class: &str) {
        self.query_errors_total.with_label_values(&[class]).inc();
    }

    /// Record route decision
    pub fn record_route(&self, group: &str, shard_id: u32) {
        self.routes_total
            .with_label_values(&[group, &shard_id.to_string()])
            .inc();
    }

    /// Record a retry decision
    pub fn record_retry(&self, outcome: &str) {
        self.retry_total.with_label_values(&[outcome]).inc();
    }

    /// Record a finished cross-shard operation
    pub fn record_fanout(&self, result: &str, duration_secs: f64) {
        self.fanout_total.with_label_values(&[result]).inc();
        self.fanout_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    /// Record a health check result
    pub fn record_health_check(&self, result: &str) {
        self.health_check_total.with_label_values(&[result]).inc();
    }

    /// Update connection health counts
    pub fn set_health_connections(&self, healthy: i64, unhealthy: i64) {
        self.health_connections
            .with_label_values(&["healthy"])
            .set(healthy);
        self.health_connections
            .with_label_values(&["unhealthy"])
            .set(unhealthy);
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
