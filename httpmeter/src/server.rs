//! Demo application instrumented with the metrics layer.

use std::time::Duration;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use httpmeter_api::{ExemplarFn, MetricsHandler, PrometheusLayer};
use httpmeter_core::labels::from_header;
use httpmeter_core::logging::generate_trace_id;
use httpmeter_core::ExporterConfig;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Deserialize)]
struct SlowParams {
    #[serde(default = "default_delay_ms")]
    delay_ms: u64,
}

const fn default_delay_ms() -> u64 {
    250
}

async fn index() -> &'static str {
    "httpmeter demo: try /items/42, /slow, /error, /metrics"
}

async fn get_item(Path(id): Path<u64>) -> impl IntoResponse {
    Json(serde_json::json!({ "id": id, "name": format!("item-{id}") }))
}

async fn slow(Query(params): Query<SlowParams>) -> impl IntoResponse {
    tokio::time::sleep(Duration::from_millis(params.delay_ms.min(10_000))).await;
    Json(serde_json::json!({ "slept_ms": params.delay_ms }))
}

async fn error() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "simulated failure")
}

/// Exemplar carrying the caller's request ID, or a fresh trace ID.
fn request_id_exemplar() -> ExemplarFn {
    ExemplarFn::with_request(|request| {
        let trace_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map_or_else(generate_trace_id, str::to_string);
        vec![("trace_id".to_string(), trace_id)]
    })
}

/// Build the demo router with metrics and exposition routes.
pub fn create_router(exporter: ExporterConfig) -> anyhow::Result<Router> {
    let metrics_layer = PrometheusLayer::builder()
        .config(exporter)
        .label("client", from_header("x-client", None::<Vec<String>>))
        .exemplars(request_id_exemplar())
        .build()?;

    let router = Router::new()
        .route("/", get(index))
        .route("/items/{id}", get(get_item))
        .route("/slow", get(slow))
        .route("/error", get(error))
        .merge(MetricsHandler::from_env().router())
        .layer(metrics_layer)
        .layer(TraceLayer::new_for_http());

    Ok(router)
}

/// Serve until ctrl-c or SIGTERM.
pub async fn serve(address: &str, router: Router) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
