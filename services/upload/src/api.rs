use crate::config::ApiConfig;
use crate::error::PipelineError;
use crate::metadata_store::VideoStore;
use crate::pipeline::UploadPipeline;
use crate::receiver::UploadRequest;
use crate::resolver::{ReferenceResolver, SignedVideo};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the caller identity, set by the authenticating gateway
pub const USER_ID_HEADER: &str = "x-user-id";

/// Name of the multipart field holding the video
pub const VIDEO_FIELD: &str = "video";

/// Allowance for multipart boundaries and part headers on top of the video ceiling
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<UploadPipeline>,
    pub resolver: ReferenceResolver,
    pub videos: Arc<dyn VideoStore>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a pipeline error to its HTTP status and error code
pub fn error_response(err: PipelineError) -> ApiError {
    let status = match err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Authorization { .. } => StatusCode::FORBIDDEN,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Processing(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Storage(_) | PipelineError::Persistence(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status.is_server_error() {
        error!(error = %err, category = err.category(), "Request failed");
    }

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.category().to_uppercase(),
        }),
    )
}

fn unauthenticated(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "UNAUTHENTICATED".to_string(),
        }),
    )
}

/// Caller identity forwarded by the gateway after token verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| unauthenticated("Missing caller identity"))?;

        value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(AuthenticatedUser)
            .ok_or_else(|| unauthenticated("Invalid caller identity"))
    }
}

fn parse_video_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|e| error_response(PipelineError::Validation(format!("Invalid ID: {e}"))))
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig, max_upload_bytes: u64) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = usize::try_from(max_upload_bytes + MULTIPART_OVERHEAD_BYTES)
        .unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/videos/:video_id", get(get_video))
        .route("/api/v1/videos/:video_id/upload", post(upload_video))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "video-upload-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.videos.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Upload the `video` part of a multipart form and publish it
#[instrument(skip(state, multipart))]
async fn upload_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    mut multipart: Multipart,
) -> Result<Json<SignedVideo>, ApiError> {
    let video_id = parse_video_id(&video_id)?;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error_response(PipelineError::Validation(format!("Invalid multipart body: {e}")))
    })? {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        let body = Box::pin(field.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())));

        let outcome = state
            .pipeline
            .run(UploadRequest {
                user_id,
                video_id,
                content_type,
                body,
            })
            .await
            .map_err(error_response)?;

        let signed = state
            .resolver
            .sign_record(outcome.video)
            .await
            .map_err(error_response)?;

        return Ok(Json(signed));
    }

    warn!(video_id = %video_id, "Upload without a video part");
    Err(error_response(PipelineError::Validation(format!(
        "Missing form field '{VIDEO_FIELD}'"
    ))))
}

/// Get a video record with a freshly signed URL
#[instrument(skip(state))]
async fn get_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<SignedVideo>, ApiError> {
    let video_id = parse_video_id(&video_id)?;

    let video = state
        .pipeline
        .authorize(user_id, video_id)
        .await
        .map_err(error_response)?;

    let signed = state
        .resolver
        .sign_record(video)
        .await
        .map_err(error_response)?;

    Ok(Json(signed))
}

/// Start the upload API server and serve until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    max_upload_bytes: u64,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config, max_upload_bytes);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (PipelineError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (
                PipelineError::Authorization {
                    user_id: Uuid::nil(),
                    video_id: Uuid::nil(),
                },
                StatusCode::FORBIDDEN,
            ),
            (PipelineError::NotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (
                PipelineError::Processing("no ratio".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                PipelineError::Storage("s3".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                PipelineError::Persistence("db".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let category = err.category().to_uppercase();
            let (status, Json(body)) = error_response(err);
            assert_eq!(status, expected);
            assert_eq!(body.code, category);
        }
    }

    #[test]
    fn test_parse_video_id() {
        assert!(parse_video_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        let (status, _) = parse_video_id("not-a-uuid").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn extract(header: Option<&str>) -> Result<AuthenticatedUser, ApiError> {
        let mut builder = Request::builder().uri("/api/v1/videos/x");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthenticatedUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_authenticated_user_extraction() {
        let user_id = Uuid::new_v4();
        let user = extract(Some(&user_id.to_string())).await.unwrap();
        assert_eq!(user, AuthenticatedUser(user_id));

        let (status, _) = extract(None).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, Json(body)) = extract(Some("garbage")).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, "UNAUTHENTICATED");
    }
}
