use anyhow::{Context, Result};
use std::time::Duration;

use tracing::{error, info};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::metrics::metrics_handler;
use super::query::client_interface;
use super::{log_requests, state::*, ServerConfig};
use crate::model::SourceId;
use crate::sync::{Health, SyncHandle, SyncHandleError};

const DEFAULT_PROBLEMS_LIMIT: usize = 100;
const MAX_PROBLEMS_LIMIT: usize = 1000;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub version: String,
    pub health: Health,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

fn current_health(sync_handle: &OptionalSyncHandle) -> Health {
    sync_handle
        .as_ref()
        .map(SyncHandle::health)
        .unwrap_or(Health::Healthy)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        health: current_health(&state.sync_handle),
    };
    Json(stats)
}

async fn health(State(sync_handle): State<OptionalSyncHandle>) -> Response {
    let health = current_health(&sync_handle);
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

fn sync_error_response(err: SyncHandleError) -> Response {
    error!("Sync request failed: {}", err);
    let status = match err {
        SyncHandleError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn sync_disabled() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "sync scheduler is not running" })),
    )
        .into_response()
}

async fn run_sync(State(sync_handle): State<OptionalSyncHandle>) -> Response {
    let Some(handle) = sync_handle else {
        return sync_disabled();
    };
    match handle.run_now().await {
        Ok(report) => {
            info!(
                "Sync run on request: {} synced, {} failed",
                report.synced_count(),
                report.failed_count()
            );
            Json(report).into_response()
        }
        Err(err) => sync_error_response(err),
    }
}

async fn sync_status(State(sync_handle): State<OptionalSyncHandle>) -> Response {
    let Some(handle) = sync_handle else {
        return sync_disabled();
    };
    match handle.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => sync_error_response(err),
    }
}

#[derive(Deserialize, Debug)]
struct ProblemsParams {
    limit: Option<usize>,
}

async fn source_problems(
    State(sync_handle): State<OptionalSyncHandle>,
    Path(id): Path<i64>,
    Query(params): Query<ProblemsParams>,
) -> Response {
    let Some(handle) = sync_handle else {
        return sync_disabled();
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PROBLEMS_LIMIT)
        .min(MAX_PROBLEMS_LIMIT);
    match handle.problems(SourceId(id), limit).await {
        Ok(Some(problems)) => Json(problems).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => sync_error_response(err),
    }
}

pub fn make_app(config: ServerConfig, store: GuardedMeetingStore, sync_handle: OptionalSyncHandle) -> Router {
    let state = ServerState::new(config, store, sync_handle);

    let query_routes: Router = Router::new()
        .route("/client_interface/{format}", get(client_interface))
        .route("/client_interface/{format}/", get(client_interface))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let sync_routes: Router = Router::new()
        .route("/run", post(run_sync))
        .route("/status", get(sync_status))
        .route("/sources/{id}/problems", get(source_problems))
        .with_state(state.clone());

    let home_router: Router = Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone());

    home_router
        .merge(query_routes)
        .nest("/sync", sync_routes)
        .layer(middleware::from_fn_with_state(state, log_requests))
}

/// Serves until `shutdown` is cancelled.
pub async fn run_server(
    config: ServerConfig,
    store: GuardedMeetingStore,
    sync_handle: OptionalSyncHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let app = make_app(config, store, sync_handle);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
