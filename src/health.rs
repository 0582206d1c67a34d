use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "aggregoor" namespace. Organized by stage:
/// - Ingest: event intake and dispatch
/// - Flush: aggregation cycle and write queue
/// - Schema: unit lifecycle and reconciliation
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Total telemetry events accepted for dispatch.
    pub events_received: Counter,
    /// Total events dropped because the intake channel was full.
    pub events_dropped: Counter,
    /// Samples dropped per metric definition (fold or merge failures).
    pub samples_dropped: CounterVec,

    // === Flush ===
    /// Total aggregation flush cycles.
    pub flush_cycles: Counter,
    /// Metric identities in the generation detached by the last cycle.
    pub generation_size: Histogram,
    /// Persist sessions currently held, per granularity.
    pub sessions_active: GaugeVec,
    /// Write requests handed to the queue.
    pub write_requests_enqueued: Counter,
    /// Requests sitting in the write queue channel.
    pub queue_depth: Gauge,
    /// Write groups delivered to the backend.
    pub write_groups_flushed: Counter,
    /// Rows acknowledged by the backend.
    pub write_rows_written: Counter,
    /// Write groups dropped, by reason (error/timeout).
    pub write_group_errors: CounterVec,
    /// Rows the backend rejected inside otherwise delivered groups.
    pub write_rows_rejected: Counter,
    /// Backend write group duration.
    pub write_duration: Histogram,
    /// Rows per flushed batch.
    pub flush_batch_size: Histogram,

    // === Schema ===
    /// Schema operations executed, by kind (create/alter/delete).
    pub schema_operations: CounterVec,
    /// Schema operations failed, by kind.
    pub schema_failures: CounterVec,
    /// Units currently tracked by the schema registry.
    pub units_tracked: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let events_received = Counter::with_opts(
            Opts::new("events_received_total", "Total telemetry events accepted for dispatch.")
                .namespace("aggregoor"),
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Total events dropped because the intake channel was full.",
            )
            .namespace("aggregoor"),
        )?;
        let samples_dropped = CounterVec::new(
            Opts::new(
                "samples_dropped_total",
                "Samples dropped per metric definition due to fold or merge failures.",
            )
            .namespace("aggregoor"),
            &["metric"],
        )?;

        // === Flush ===
        let flush_cycles = Counter::with_opts(
            Opts::new("flush_cycles_total", "Total aggregation flush cycles.")
                .namespace("aggregoor"),
        )?;
        let generation_size = Histogram::with_opts(
            HistogramOpts::new(
                "generation_size",
                "Metric identities in the generation detached by a flush cycle.",
            )
            .namespace("aggregoor")
            .buckets(vec![10.0, 100.0, 1000.0, 10000.0, 50000.0, 100000.0]),
        )?;
        let sessions_active = GaugeVec::new(
            Opts::new("sessions_active", "Persist sessions currently held, per granularity.")
                .namespace("aggregoor"),
            &["granularity"],
        )?;
        let write_requests_enqueued = Counter::with_opts(
            Opts::new("write_requests_enqueued_total", "Write requests handed to the queue.")
                .namespace("aggregoor"),
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new("queue_depth", "Requests sitting in the write queue channel.")
                .namespace("aggregoor"),
        )?;
        let write_groups_flushed = Counter::with_opts(
            Opts::new("write_groups_flushed_total", "Write groups delivered to the backend.")
                .namespace("aggregoor"),
        )?;
        let write_rows_written = Counter::with_opts(
            Opts::new("write_rows_written_total", "Rows acknowledged by the backend.")
                .namespace("aggregoor"),
        )?;
        let write_group_errors = CounterVec::new(
            Opts::new("write_group_errors_total", "Write groups dropped, by reason.")
                .namespace("aggregoor"),
            &["reason"],
        )?;
        let write_rows_rejected = Counter::with_opts(
            Opts::new(
                "write_rows_rejected_total",
                "Rows the backend rejected inside otherwise delivered groups.",
            )
            .namespace("aggregoor"),
        )?;
        let write_duration = Histogram::with_opts(
            HistogramOpts::new("write_duration_seconds", "Backend write group duration.")
                .namespace("aggregoor")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new("flush_batch_size", "Rows per flushed batch.")
                .namespace("aggregoor")
                .buckets(vec![100.0, 500.0, 1000.0, 5000.0, 10000.0, 25000.0, 50000.0]),
        )?;

        // === Schema ===
        let schema_operations = CounterVec::new(
            Opts::new("schema_operations_total", "Schema operations executed, by kind.")
                .namespace("aggregoor"),
            &["operation"],
        )?;
        let schema_failures = CounterVec::new(
            Opts::new("schema_failures_total", "Schema operations failed, by kind.")
                .namespace("aggregoor"),
            &["operation"],
        )?;
        let units_tracked = Gauge::with_opts(
            Opts::new("units_tracked", "Units currently tracked by the schema registry.")
                .namespace("aggregoor"),
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(flush_cycles.clone()))?;
        registry.register(Box::new(generation_size.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(write_requests_enqueued.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(write_groups_flushed.clone()))?;
        registry.register(Box::new(write_rows_written.clone()))?;
        registry.register(Box::new(write_group_errors.clone()))?;
        registry.register(Box::new(write_rows_rejected.clone()))?;
        registry.register(Box::new(write_duration.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(schema_operations.clone()))?;
        registry.register(Box::new(schema_failures.clone()))?;
        registry.register(Box::new(units_tracked.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            samples_dropped,
            flush_cycles,
            generation_size,
            sessions_active,
            write_requests_enqueued,
            queue_depth,
            write_groups_flushed,
            write_rows_written,
            write_group_errors,
            write_rows_rejected,
            write_duration,
            flush_batch_size,
            schema_operations,
            schema_failures,
            units_tracked,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() { ":9091" } else { &self.addr };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
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
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string());
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string())
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
