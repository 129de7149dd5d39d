//! Axum HTTP surface for triggering and inspecting ingestion runs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use govcon_sync::{AdapterStatus, IngestError, IngestionCoordinator};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "govcon-web";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IngestionCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<IngestionCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Serialize)]
struct SourcesResponse {
    sources: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    adapters: Vec<AdapterStatus>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/ingest/sources", get(sources_handler))
        .route("/ingest/status", get(status_handler))
        .route("/ingest/runs", post(run_all_handler))
        .route("/ingest/runs/{source_id}", post(run_source_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Json<SourcesResponse> {
    Json(SourcesResponse {
        sources: state.coordinator.source_ids(),
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        adapters: state.coordinator.statuses(),
    })
}

async fn run_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.run_all().await {
        Ok(result) => Json(result).into_response(),
        Err(err) => ingest_error(err),
    }
}

async fn run_source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source_id): AxumPath<String>,
) -> Response {
    match state.coordinator.run_for_adapter(&source_id).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => ingest_error(err),
    }
}

fn ingest_error(err: IngestError) -> Response {
    let status = match &err {
        IngestError::UnknownSource(_) => StatusCode::NOT_FOUND,
        IngestError::Orchestration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, status = status.as_u16(), "ingest request failed");
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
