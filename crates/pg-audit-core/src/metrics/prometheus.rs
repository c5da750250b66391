//! Prometheus metrics for the PostgreSQL audit proxy.
//!
//! Provides counters, histograms, and gauges for monitoring connection
//! pairs, handshake interception and the audit trail.

use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Proxy metrics collection.
///
/// Contains all metrics exposed by the proxy for monitoring.
pub struct ProxyMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Current live client/backend pairs.
    pub active_pairs: IntGauge,

    /// Total pairs opened (backend connect succeeded).
    pub pairs_opened: IntCounter,

    /// Client connections dropped because the connection limit was reached.
    pub connections_rejected: IntCounter,

    /// Backend connection attempts that failed.
    pub backend_connect_failures: IntCounter,

    /// SSLRequest negotiations answered with a refusal.
    pub ssl_requests_refused: IntCounter,

    /// Audit records written, by direction.
    pub audit_records: CounterVec,

    /// Audit appends that failed.
    pub audit_write_errors: Counter,

    /// Bytes relayed, by direction.
    pub bytes_relayed: CounterVec,

    /// Pairs torn down because of an error, by error kind.
    pub pair_errors: CounterVec,

    /// Pair lifetime histogram.
    pub pair_duration_seconds: HistogramVec,
}

impl ProxyMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_pairs = IntGauge::new(
            "pg_audit_active_pairs",
            "Current number of live client/backend pairs",
        )
        .expect("metric creation should succeed");

        let pairs_opened = IntCounter::new(
            "pg_audit_pairs_opened_total",
            "Total number of client/backend pairs opened",
        )
        .expect("metric creation should succeed");

        let connections_rejected = IntCounter::new(
            "pg_audit_connections_rejected_total",
            "Client connections dropped at the connection limit",
        )
        .expect("metric creation should succeed");

        let backend_connect_failures = IntCounter::new(
            "pg_audit_backend_connect_failures_total",
            "Failed backend connection attempts",
        )
        .expect("metric creation should succeed");

        let ssl_requests_refused = IntCounter::new(
            "pg_audit_ssl_requests_refused_total",
            "SSLRequest negotiations refused",
        )
        .expect("metric creation should succeed");

        let audit_records = CounterVec::new(
            Opts::new(
                "pg_audit_records_total",
                "Audit records written by traffic direction",
            ),
            &["direction"],
        )
        .expect("metric creation should succeed");

        let audit_write_errors = Counter::new(
            "pg_audit_write_errors_total",
            "Audit records that could not be appended",
        )
        .expect("metric creation should succeed");

        let bytes_relayed = CounterVec::new(
            Opts::new("pg_audit_bytes_relayed_total", "Bytes relayed by direction"),
            &["direction"],
        )
        .expect("metric creation should succeed");

        let pair_errors = CounterVec::new(
            Opts::new(
                "pg_audit_pair_errors_total",
                "Pairs torn down by an error, by error kind",
            ),
            &["kind"],
        )
        .expect("metric creation should succeed");

        let pair_duration_seconds = HistogramVec::new(
            HistogramOpts::new("pg_audit_pair_duration_seconds", "Pair lifetime in seconds")
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0]),
            &["outcome"],
        )
        .expect("metric creation should succeed");

        // Register all metrics
        registry
            .register(Box::new(active_pairs.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(pairs_opened.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(connections_rejected.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(backend_connect_failures.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(ssl_requests_refused.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(audit_records.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(audit_write_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_relayed.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(pair_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(pair_duration_seconds.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            active_pairs,
            pairs_opened,
            connections_rejected,
            backend_connect_failures,
            ssl_requests_refused,
            audit_records,
            audit_write_errors,
            bytes_relayed,
            pair_errors,
            pair_duration_seconds,
        }
    }

    /// Record a pair being opened.
    pub fn pair_opened(&self) {
        self.pairs_opened.inc();
        self.active_pairs.inc();
    }

    /// Record a pair being torn down.
    pub fn pair_closed(&self, outcome: &str, duration_seconds: f64) {
        self.active_pairs.dec();
        self.pair_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_seconds);
    }

    /// Record a pair error.
    pub fn record_pair_error(&self, kind: &str) {
        self.pair_errors.with_label_values(&[kind]).inc();
    }

    /// Record a rejected client connection.
    pub fn record_rejected(&self) {
        self.connections_rejected.inc();
    }

    /// Record a failed backend connection attempt.
    pub fn record_backend_failure(&self) {
        self.backend_connect_failures.inc();
    }

    /// Record a refused SSLRequest.
    pub fn record_ssl_refused(&self) {
        self.ssl_requests_refused.inc();
    }

    /// Record an audit record written.
    pub fn record_audit(&self, direction: &str) {
        self.audit_records.with_label_values(&[direction]).inc();
    }

    /// Record a failed audit append.
    pub fn record_audit_error(&self) {
        self.audit_write_errors.inc();
    }

    /// Record bytes relayed in a direction.
    pub fn record_bytes(&self, direction: &str, bytes: u64) {
        self.bytes_relayed
            .with_label_values(&[direction])
            .inc_by(bytes as f64);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}
