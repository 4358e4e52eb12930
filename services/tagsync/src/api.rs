//! HTTP control surface
//!
//! Thin JSON wrappers over the [`Supervisor`]; no synchronization logic
//! lives here.

use crate::config::BridgeConfig;
use crate::supervisor::{StartOutcome, Supervisor};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

type SharedState = Arc<Supervisor>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowseParams {
    host: String,
    program_id: String,
    node_id: Option<String>,
}

pub fn create_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/live", get(live_values))
        .route("/config", get(stored_config))
        .route("/tags/{tag_id}", delete(remove_tag))
        .route("/browse", get(browse))
        .layer(CorsLayer::permissive())
        .with_state(supervisor)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(
    port: u16,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control API listening on {}", addr);

    axum::serve(listener, create_router(supervisor).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn start(
    State(supervisor): State<SharedState>,
    Json(config): Json<BridgeConfig>,
) -> impl IntoResponse {
    match supervisor.start(config).await {
        StartOutcome::Active => (StatusCode::OK, Json(ActionResponse::ok("Bridge started"))),
        StartOutcome::Failed(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ActionResponse::failed(reason)),
        ),
    }
}

async fn stop(State(supervisor): State<SharedState>) -> impl IntoResponse {
    supervisor.stop().await;
    Json(ActionResponse::ok("Bridge stopped"))
}

async fn status(State(supervisor): State<SharedState>) -> impl IntoResponse {
    Json(supervisor.status().await)
}

async fn live_values(State(supervisor): State<SharedState>) -> impl IntoResponse {
    Json(supervisor.live_values())
}

async fn stored_config(State(supervisor): State<SharedState>) -> impl IntoResponse {
    match supervisor.stored_config().await {
        Ok(Some(config)) => Json(config).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ActionResponse::failed("No configuration stored")),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ActionResponse::failed(e.to_string())),
        )
            .into_response(),
    }
}

async fn remove_tag(
    State(supervisor): State<SharedState>,
    Path(tag_id): Path<String>,
) -> impl IntoResponse {
    match supervisor.remove_tag(&tag_id).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ActionResponse::ok(format!("Tag {tag_id} removed"))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ActionResponse::failed(e.to_string())),
        ),
    }
}

async fn browse(
    State(supervisor): State<SharedState>,
    Query(params): Query<BrowseParams>,
) -> impl IntoResponse {
    match supervisor
        .browse(&params.host, &params.program_id, params.node_id.as_deref())
        .await
    {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ActionResponse::failed(e.to_string())),
        )
            .into_response(),
    }
}
