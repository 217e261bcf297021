//! Metrics and tracing setup for tidemark.
//!
//! Provides a global [`ServerMetrics`] singleton backed by the
//! `prometheus` crate, plus an optional lightweight HTTP server for
//! Prometheus scraping.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use prometheus::Encoder;
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<ServerMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static ServerMetrics {
    METRICS.get_or_init(ServerMetrics::new)
}

/// All Prometheus metrics for a tidemark server.
pub struct ServerMetrics {
    pub registry: Registry,

    // ── connections ──
    pub connections_total: IntCounter,
    pub active_sessions: IntGauge,
    pub auth_rejections: IntCounter,

    // ── requests ──
    pub requests_received: IntCounter,
    pub requests_by_type: IntCounterVec,
    pub permission_denials: IntCounter,
    pub malformed_frames: IntCounter,

    // ── store ──
    pub records_inserted: IntCounter,

    // ── persistence ──
    pub flush_runs: IntCounter,
    pub flush_duration_secs: Histogram,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for flush duration.
const FLUSH_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl ServerMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "tidemark_connections_total",
            "Total accepted WebSocket connections",
        ))
        .expect("connections_total counter");
        let active_sessions = IntGauge::with_opts(Opts::new(
            "tidemark_active_sessions",
            "Currently open authenticated sessions",
        ))
        .expect("active_sessions gauge");
        let auth_rejections = IntCounter::with_opts(Opts::new(
            "tidemark_auth_rejections_total",
            "Handshakes rejected for a missing or unknown API key",
        ))
        .expect("auth_rejections counter");

        let requests_received = IntCounter::with_opts(Opts::new(
            "tidemark_requests_received_total",
            "Total inbound requests dispatched",
        ))
        .expect("requests_received counter");
        let requests_by_type = IntCounterVec::new(
            Opts::new(
                "tidemark_requests_by_type_total",
                "Inbound requests, by type tag",
            ),
            &["msg_type"],
        )
        .expect("requests_by_type counter vec");
        let permission_denials = IntCounter::with_opts(Opts::new(
            "tidemark_permission_denials_total",
            "Requests refused for insufficient scope",
        ))
        .expect("permission_denials counter");
        let malformed_frames = IntCounter::with_opts(Opts::new(
            "tidemark_malformed_frames_total",
            "Frames that failed envelope or payload validation",
        ))
        .expect("malformed_frames counter");

        let records_inserted = IntCounter::with_opts(Opts::new(
            "tidemark_records_inserted_total",
            "Records upserted into the store",
        ))
        .expect("records_inserted counter");

        let flush_runs = IntCounter::with_opts(Opts::new(
            "tidemark_flush_runs_total",
            "Completed flush ticker runs",
        ))
        .expect("flush_runs counter");
        let flush_duration_secs = Histogram::with_opts(
            HistogramOpts::new(
                "tidemark_flush_duration_seconds",
                "Wall time of one full flush pass",
            )
            .buckets(FLUSH_BUCKETS.to_vec()),
        )
        .expect("flush_duration_secs histogram");

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .expect("register connections_total");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(auth_rejections.clone()))
            .expect("register auth_rejections");
        registry
            .register(Box::new(requests_received.clone()))
            .expect("register requests_received");
        registry
            .register(Box::new(requests_by_type.clone()))
            .expect("register requests_by_type");
        registry
            .register(Box::new(permission_denials.clone()))
            .expect("register permission_denials");
        registry
            .register(Box::new(malformed_frames.clone()))
            .expect("register malformed_frames");
        registry
            .register(Box::new(records_inserted.clone()))
            .expect("register records_inserted");
        registry
            .register(Box::new(flush_runs.clone()))
            .expect("register flush_runs");
        registry
            .register(Box::new(flush_duration_secs.clone()))
            .expect("register flush_duration_secs");

        Self {
            registry,
            connections_total,
            active_sessions,
            auth_rejections,
            requests_received,
            requests_by_type,
            permission_denials,
            malformed_frames,
            records_inserted,
            flush_runs,
            flush_duration_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: time one flush pass. Records elapsed time on drop.
pub fn start_flush_timer() -> prometheus::HistogramTimer {
    metrics().flush_duration_secs.start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
