use crate::config::ApiConfig;
use crate::credentials::CredentialResolver;
use crate::deletion::{DeletionCoordinator, DeletionResult};
use crate::document_store::DocumentStore;
use crate::events::{EventError, Notification};
use crate::models::content_type_for;
use crate::object_store::{is_allowed_image, sanitize_key, ObjectStore, ALLOWED_EXTENSIONS};
use crate::pipeline::{AnalysisHandler, HandlerOutcome, HandlerState};
use crate::view::{ResultView, ResultViewComposer};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Largest accepted image upload
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<AnalysisHandler>,
    pub deletion: Arc<DeletionCoordinator>,
    pub views: Arc<ResultViewComposer>,
    pub objects: Arc<dyn ObjectStore>,
    pub store: Arc<dyn DocumentStore>,
    pub resolver: Arc<CredentialResolver>,
    pub collection: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Query parameters for the gallery listing
#[derive(Debug, Deserialize)]
pub struct ImageListQuery {
    /// Only keys starting with this prefix
    pub prefix: Option<String>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Gallery listing response
#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<ResultView>,
    pub count: usize,
}

/// Event intake response
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventResponse {
    Processed(HandlerOutcome),
    Ignored { event_type: String },
}

/// Upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub key: String,
    pub content_type: String,
    pub size_bytes: usize,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if config.cors_origins.is_empty() {
            cors.allow_origin(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/events", post(receive_event))
        .route("/api/v1/images", get(list_images))
        .route(
            "/api/v1/images/*key",
            get(get_image).put(upload_image).delete(delete_image),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "analysis-service"
    }))
}

/// Ready when the document store accepts a resolved credential
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = &state.store;
    let collection = state.collection.as_str();

    let check = state
        .resolver
        .with_credential(|credential| async move {
            store.ensure_collection_exists(&credential, collection).await
        })
        .await;

    match check {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "document_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "document_store": "unavailable",
                "error": e.to_string()
            })),
        ),
    }
}

/// Object-created notification intake. A degraded outcome answers 503 so
/// the delivery service retries.
#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn receive_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    let notification = Notification::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Rejected event");
        let code = match e {
            EventError::Malformed(_) => "MALFORMED_EVENT",
            EventError::MissingObjectName => "MISSING_OBJECT_NAME",
        };
        api_error(StatusCode::BAD_REQUEST, e.to_string(), code)
    })?;

    let event = match notification {
        Notification::ObjectCreated(event) => event,
        Notification::Ignored { event_type } => {
            info!(event_type = %event_type, "Ignoring event");
            return Ok((StatusCode::OK, Json(EventResponse::Ignored { event_type })));
        }
    };

    let outcome = state.handler.handle_event(&event).await;
    let status = match outcome.state {
        HandlerState::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    Ok((status, Json(EventResponse::Processed(outcome))))
}

/// Gallery listing
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<ImageListQuery>,
) -> Result<Json<ImageListResponse>, ApiError> {
    let images = state
        .views
        .list_views(params.prefix, params.limit.min(1000))
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to list images");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list images",
                "LIST_ERROR",
            )
        })?;

    Ok(Json(ImageListResponse {
        count: images.len(),
        images,
    }))
}

/// Image with its analysis state
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ResultView>, ApiError> {
    let view = state.views.view(&key).await.map_err(|e| {
        error!(error = %e, "Failed to get image");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get image",
            "OBJECT_STORE_ERROR",
        )
    })?;

    view.map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Image not found", "NOT_FOUND"))
}

/// Store an image. Analysis follows from the object-created notification.
#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn upload_image(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    // Sanitizing can strip the name down to a bare extension
    let key = sanitize_key(&key);
    if !is_allowed_image(&key) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Allowed image types: {}", ALLOWED_EXTENSIONS.join(", ")),
            "UNSUPPORTED_TYPE",
        ));
    }
    if body.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Empty upload", "EMPTY_BODY"));
    }

    let content_type = content_type_for(&key);
    let size_bytes = body.len();

    state
        .objects
        .put(&key, body.to_vec(), content_type)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to store image");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store image",
                "UPLOAD_ERROR",
            )
        })?;

    info!(key = %key, size_bytes, "Image uploaded");

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            key,
            content_type: content_type.to_string(),
            size_bytes,
        }),
    ))
}

/// Delete an image and its analysis
#[instrument(skip(state))]
async fn delete_image(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> (StatusCode, Json<DeletionResult>) {
    let result = state.deletion.delete_asset_and_analysis(&key).await;

    let status = if !result.is_clean() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else if result.asset_removed || result.document_removed {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };

    (status, Json(result))
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting analysis API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
