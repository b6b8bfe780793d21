//! Prometheus metrics for the fleet supervisor
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

use crate::registry::FleetStats;
use crate::rpc::CircuitState;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Supervisor metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Heartbeat metrics
    /// Heartbeat results by outcome (success, failure, skipped)
    pub heartbeats_total: IntCounterVec,
    /// Ping latency histogram (in seconds)
    pub ping_duration_seconds: HistogramVec,

    // Fleet metrics
    /// Current host counts by status
    pub hosts: IntGaugeVec,
    /// Current number of bound workers
    pub fleet_workers: IntGauge,

    // Circuit breaker metrics
    /// Circuit state (0 closed, 1 open, 2 half-open)
    pub circuit_state: IntGauge,
    /// Opens since startup
    pub circuit_crashes: IntGauge,

    // Healing / redistribution metrics
    /// Orphaned workers healed, by action taken
    pub orphans_healed_total: IntCounterVec,
    /// Worker migrations by outcome
    pub migrations_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let heartbeats_total = IntCounterVec::new(
            Opts::new("argus_heartbeats_total", "Heartbeat results by outcome"),
            &["result"], // success, failure, skipped
        )
        .unwrap();

        let ping_duration_seconds = HistogramVec::new(
            HistogramOpts::new("argus_ping_duration_seconds", "Host ping latency in seconds")
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0,
                ]),
            &["host"],
        )
        .unwrap();

        let hosts = IntGaugeVec::new(
            Opts::new("argus_hosts", "Current number of hosts by status"),
            &["status"], // active, stale, error, terminated
        )
        .unwrap();

        let fleet_workers = IntGauge::new(
            "argus_fleet_workers",
            "Current number of workers bound to hosts",
        )
        .unwrap();

        let circuit_state = IntGauge::new(
            "argus_circuit_state",
            "Circuit breaker state (0 closed, 1 open, 2 half-open)",
        )
        .unwrap();

        let circuit_crashes = IntGauge::new(
            "argus_circuit_crashes",
            "Number of circuit opens since startup",
        )
        .unwrap();

        let orphans_healed_total = IntCounterVec::new(
            Opts::new(
                "argus_orphans_healed_total",
                "Orphaned workers processed, by action taken",
            ),
            &["action"], // rebind, terminate, skip
        )
        .unwrap();

        let migrations_total = IntCounterVec::new(
            Opts::new(
                "argus_migrations_total",
                "Idle-worker migrations by outcome",
            ),
            &["outcome"], // executed, failed
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(heartbeats_total.clone()))
            .unwrap();
        registry
            .register(Box::new(ping_duration_seconds.clone()))
            .unwrap();
        registry.register(Box::new(hosts.clone())).unwrap();
        registry.register(Box::new(fleet_workers.clone())).unwrap();
        registry.register(Box::new(circuit_state.clone())).unwrap();
        registry
            .register(Box::new(circuit_crashes.clone()))
            .unwrap();
        registry
            .register(Box::new(orphans_healed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(migrations_total.clone()))
            .unwrap();

        Self {
            registry,
            heartbeats_total,
            ping_duration_seconds,
            hosts,
            fleet_workers,
            circuit_state,
            circuit_crashes,
            orphans_healed_total,
            migrations_total,
        }
    }

    /// Record a heartbeat result
    pub fn record_heartbeat(&self, result: &str) {
        self.heartbeats_total.with_label_values(&[result]).inc();
    }

    /// Record a ping latency observation
    pub fn observe_ping(&self, host: &str, duration_secs: f64) {
        self.ping_duration_seconds
            .with_label_values(&[host])
            .observe(duration_secs);
    }

    /// Update fleet gauges from a registry snapshot
    pub fn set_fleet(&self, stats: &FleetStats) {
        self.hosts
            .with_label_values(&["active"])
            .set(stats.active as i64);
        self.hosts
            .with_label_values(&["stale"])
            .set(stats.stale as i64);
        self.hosts
            .with_label_values(&["error"])
            .set(stats.error as i64);
        self.hosts
            .with_label_values(&["terminated"])
            .set(stats.terminated as i64);
        self.fleet_workers.set(stats.workers as i64);
    }

    /// Update circuit gauges from a breaker snapshot
    pub fn set_circuit(&self, state: CircuitState, crash_count: u64) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.circuit_state.set(value);
        self.circuit_crashes.set(crash_count as i64);
    }

    /// Record a healed orphan
    pub fn record_orphan(&self, action: &str) {
        self.orphans_healed_total.with_label_values(&[action]).inc();
    }

    /// Record a migration outcome
    pub fn record_migration(&self, outcome: &str) {
        self.migrations_total.with_label_values(&[outcome]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an exposition-endpoint path to its response.
fn respond(path: &str) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::{Response, StatusCode};

    match path {
        "/metrics" => Response::builder()
            .header(hyper::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(Full::new(Bytes::from(metrics().gather())))
            .unwrap(),
        "/health" => Response::new(Full::new(Bytes::from("ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    }
}

/// Serve `/metrics` and `/health` until the task is dropped.
pub async fn serve_metrics(addr: &str) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{info, warn};

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics exposition listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let service = service_fn(|req: hyper::Request<hyper::body::Incoming>| async move {
                Ok::<_, Infallible>(respond(req.uri().path()))
            });
            let served = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
            if let Err(e) = served {
                warn!(peer = %peer, error = %e, "Metrics connection error");
            }
        });
    }
}
