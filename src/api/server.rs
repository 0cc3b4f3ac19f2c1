//! HTTP server implementation for the API

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use super::{handlers, models::ApiResponse, models::RunOptions};
use crate::catalog::ItemStore;
use crate::queue::ProcessingQueueController;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: ProcessingQueueController,
    pub store: Arc<dyn ItemStore>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
        .route("/api/episodes/:id/process", post(process_episode_handler))
        .route("/api/series/:id/process", post(process_series_handler))
        .route("/api/library/process", post(process_library_handler))
        .route("/api/cancel", post(cancel_handler))
        .route("/api/queue/clear", post(clear_queue_handler))
        .route("/api/progress", get(progress_handler))
        .route("/api/debug/start", post(start_debug_handler))
        .route("/api/debug/log", get(debug_log_handler))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

/// Configure and start the HTTP server
pub async fn start_http_server(
    controller: ProcessingQueueController,
    store: Arc<dyn ItemStore>,
    port: u16,
) -> Result<()> {
    let app = router(AppState { controller, store });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("🌐 API server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ApiResponse::<()>::error(message))).into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match handlers::health_check(&state.controller).await {
        Ok(data) => (StatusCode::OK, Json(data)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn process_episode_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(options): Query<RunOptions>,
) -> impl IntoResponse {
    match handlers::process_episode(&state.controller, state.store.as_ref(), &id, options).await {
        Ok(Some(data)) => (StatusCode::ACCEPTED, Json(ApiResponse::success(data))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Episode not found: {}", id)),
        Err(e) => {
            warn!("Failed to queue episode {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn process_series_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(options): Query<RunOptions>,
) -> impl IntoResponse {
    match handlers::process_series(&state.controller, &id, options).await {
        Ok(data) => (StatusCode::ACCEPTED, Json(ApiResponse::success(data))).into_response(),
        Err(e) => {
            warn!("Failed to queue series {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn process_library_handler(
    State(state): State<AppState>,
    Query(options): Query<RunOptions>,
) -> impl IntoResponse {
    match handlers::process_library(&state.controller, options).await {
        Ok(data) => (StatusCode::ACCEPTED, Json(ApiResponse::success(data))).into_response(),
        Err(e) => {
            warn!("Failed to queue library: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn cancel_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(handlers::cancel(&state.controller)))
}

async fn clear_queue_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(handlers::clear_queue(&state.controller)))
}

async fn progress_handler(State(state): State<AppState>) -> impl IntoResponse {
    match handlers::progress(&state.controller) {
        Ok(data) => (StatusCode::OK, Json(data)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn start_debug_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(handlers::start_debug(&state.controller)))
}

async fn debug_log_handler(State(state): State<AppState>) -> impl IntoResponse {
    match handlers::debug_log(&state.controller) {
        Some(log) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            log,
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No debug log captured".to_string()),
    }
}
