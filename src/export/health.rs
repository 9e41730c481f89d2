use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus self-telemetry for the engine.
///
/// All metrics use the "meshoor" namespace. These describe the engine
/// itself (cache behavior, batching, reporting cadence), not the proxied
/// traffic; traffic stats flow through the per-worker stat host.
pub struct EngineMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Stat cache hits, flushed in coalesced increments.
    pub cache_hits: IntCounter,
    /// Stat cache misses (one per newly resolved dimension combination).
    pub cache_misses: IntCounter,
    /// Distinct dimension combinations currently cached, per worker.
    pub cached_combinations: IntGauge,
    /// Stat instances created under the active configuration.
    pub stats_created: IntGauge,
    /// Successful configuration applications.
    pub reconfigures: IntCounter,

    /// Edge batches flushed to the queue.
    pub edge_batches_flushed: IntCounter,
    /// Assertions appended to batches.
    pub edge_assertions: IntCounter,
    /// Edge report batches handed to the export collaborator.
    pub edge_reports: IntCounter,
    /// Edge export failures by sink.
    pub edge_export_errors: IntCounterVec,

    /// TCP connection records currently tracked.
    pub tcp_records_tracked: IntGauge,
    /// Periodic and final TCP reports performed.
    pub tcp_reports: IntCounter,
    /// TCP records evicted after exceeding the idle timeout.
    pub tcp_records_evicted: IntCounter,

    /// Stream events dropped because a worker channel was full.
    pub events_dropped: IntCounter,
}

impl EngineMetrics {
    /// Creates the metrics instance with all series registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cache_hits = IntCounter::with_opts(
            Opts::new("stat_cache_hits_total", "Total stat cache hits.").namespace("meshoor"),
        )?;
        let cache_misses = IntCounter::with_opts(
            Opts::new("stat_cache_misses_total", "Total stat cache misses.").namespace("meshoor"),
        )?;
        let cached_combinations = IntGauge::with_opts(
            Opts::new(
                "stat_cache_combinations",
                "Distinct dimension combinations currently cached.",
            )
            .namespace("meshoor"),
        )?;
        let stats_created = IntGauge::with_opts(
            Opts::new(
                "stats_created",
                "Stat instances created under the active configuration.",
            )
            .namespace("meshoor"),
        )?;
        let reconfigures = IntCounter::with_opts(
            Opts::new(
                "reconfigures_total",
                "Successful configuration applications.",
            )
            .namespace("meshoor"),
        )?;

        let edge_batches_flushed = IntCounter::with_opts(
            Opts::new(
                "edge_batches_flushed_total",
                "Edge batches flushed to the report queue.",
            )
            .namespace("meshoor"),
        )?;
        let edge_assertions = IntCounter::with_opts(
            Opts::new(
                "edge_assertions_total",
                "Traffic assertions appended to batches.",
            )
            .namespace("meshoor"),
        )?;
        let edge_reports = IntCounter::with_opts(
            Opts::new(
                "edge_reports_total",
                "Edge report batches handed to the export collaborator.",
            )
            .namespace("meshoor"),
        )?;
        let edge_export_errors = IntCounterVec::new(
            Opts::new("edge_export_errors_total", "Edge export failures by sink.")
                .namespace("meshoor"),
            &["sink"],
        )?;

        let tcp_records_tracked = IntGauge::with_opts(
            Opts::new(
                "tcp_records_tracked",
                "TCP connection records currently tracked.",
            )
            .namespace("meshoor"),
        )?;
        let tcp_reports = IntCounter::with_opts(
            Opts::new(
                "tcp_reports_total",
                "Periodic and final TCP reports performed.",
            )
            .namespace("meshoor"),
        )?;
        let tcp_records_evicted = IntCounter::with_opts(
            Opts::new(
                "tcp_records_evicted_total",
                "TCP records evicted after exceeding the idle timeout.",
            )
            .namespace("meshoor"),
        )?;

        let events_dropped = IntCounter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Stream events dropped because a worker channel was full.",
            )
            .namespace("meshoor"),
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cached_combinations.clone()))?;
        registry.register(Box::new(stats_created.clone()))?;
        registry.register(Box::new(reconfigures.clone()))?;
        registry.register(Box::new(edge_batches_flushed.clone()))?;
        registry.register(Box::new(edge_assertions.clone()))?;
        registry.register(Box::new(edge_reports.clone()))?;
        registry.register(Box::new(edge_export_errors.clone()))?;
        registry.register(Box::new(tcp_records_tracked.clone()))?;
        registry.register(Box::new(tcp_reports.clone()))?;
        registry.register(Box::new(tcp_records_evicted.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cache_hits,
            cache_misses,
            cached_combinations,
            stats_created,
            reconfigures,
            edge_batches_flushed,
            edge_assertions,
            edge_reports,
            edge_export_errors,
            tcp_records_tracked,
            tcp_reports,
            tcp_records_evicted,
            events_dropped,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "self-telemetry server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "self-telemetry server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the self-telemetry server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Registry for test inspection.
    pub fn registry(&self) -> &Registry {
        &self.registry
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
