use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "profile_exporter";

/// Prometheus metrics for ingestion and export.
///
/// All metrics use the "profile_exporter" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Samples accepted by an accumulator.
    pub samples_added: Counter,
    /// Samples rejected by the buffer and dropped.
    pub samples_dropped: Counter,
    /// Per-application export outcomes by result (success/failure).
    pub exports: CounterVec,
    /// Completed export cycles.
    pub export_cycles: Counter,
    /// Applications currently registered.
    pub applications: Gauge,
    /// Wall time of one export cycle (1ms-60s buckets).
    pub export_cycle_duration: Histogram,
    /// Serialized artifact size (1KiB-64MiB buckets).
    pub artifact_size: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_added = Counter::with_opts(
            Opts::new("samples_added_total", "Samples accepted by an accumulator.")
                .namespace(NAMESPACE),
        )?;
        let samples_dropped = Counter::with_opts(
            Opts::new(
                "samples_dropped_total",
                "Samples rejected by the profile buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let exports = CounterVec::new(
            Opts::new("exports_total", "Per-application export outcomes.").namespace(NAMESPACE),
            &["result"],
        )?;
        let export_cycles = Counter::with_opts(
            Opts::new("export_cycles_total", "Completed export cycles.").namespace(NAMESPACE),
        )?;
        let applications = Gauge::with_opts(
            Opts::new("applications", "Applications currently registered.").namespace(NAMESPACE),
        )?;
        let export_cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "export_cycle_duration_seconds",
                "Wall time of one export cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let artifact_size = Histogram::with_opts(
            HistogramOpts::new("artifact_size_bytes", "Serialized artifact size.")
                .namespace(NAMESPACE)
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 9)?),
        )?;

        registry.register(Box::new(samples_added.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(exports.clone()))?;
        registry.register(Box::new(export_cycles.clone()))?;
        registry.register(Box::new(applications.clone()))?;
        registry.register(Box::new(export_cycle_duration.clone()))?;
        registry.register(Box::new(artifact_size.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_added,
            samples_dropped,
            exports,
            export_cycles,
            applications,
            export_cycle_duration,
            artifact_size,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
