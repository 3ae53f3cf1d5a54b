use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::RagError;
use crate::filters::question::validate_question;
use crate::filters::rate_limiter::{rate_limit, RateLimiter};
use crate::indexer::extractor::{looks_like_pdf, PageExtractor};
use crate::logger::ChatLogger;
use crate::models::{
    ChatRequest, ErrorDetail, HistoryMessage, ResetResponse, StatusResponse, StreamEvent, UploadResponse,
};
use crate::rag::cache::{fingerprint, ContentCache};
use crate::rag::embeddings::Embedder;
use crate::rag::generation::{ChatModel, GenerationStreamer};
use crate::rag::ingestion::IngestionPipeline;
use crate::rag::retrieval::RetrievalEngine;
use crate::rag::retry::RetryPolicy;
use crate::rag::vector_index::IndexOptions;
use crate::rag::vector_store::VectorStore;
use crate::session::SessionState;

/// Body limit for every route except `/upload`.
pub const REQUEST_BODY_LIMIT: usize = 1024 * 1024;
/// Headroom over the file size limit for multipart framing.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pipeline: Arc<IngestionPipeline>,
    pub streamer: Arc<GenerationStreamer>,
    pub session: Arc<SessionState>,
    pub chat_log: Arc<ChatLogger>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        extractor: Arc<dyn PageExtractor>,
        chat_log: ChatLogger,
    ) -> Self {
        let store = Arc::new(VectorStore::new(
            settings.vector_store_path.clone(),
            embedder,
            IndexOptions::from_settings(&settings),
        ));
        let pipeline = IngestionPipeline::new(
            store.clone(),
            ContentCache::new(settings.cache_dir.clone()),
            extractor,
            &settings,
        );
        let streamer = GenerationStreamer::new(
            Arc::new(RetrievalEngine::new(store)),
            chat,
            RetryPolicy::new(
                settings.chat_max_retries,
                Duration::from_secs(settings.chat_base_delay_secs),
            ),
            settings.retriever_k,
        );

        Self {
            rate_limiter: Arc::new(RateLimiter::from_settings(&settings)),
            pipeline: Arc::new(pipeline),
            streamer: Arc::new(streamer),
            session: Arc::new(SessionState::new()),
            chat_log: Arc::new(chat_log),
            settings: Arc::new(settings),
        }
    }

    /// Drop the active index (memory and disk), the transcript and the session.
    pub async fn reset_session(&self) -> anyhow::Result<()> {
        self.pipeline.store().clear().await?;
        self.pipeline.forget_last_run().await;
        self.chat_log.clear().await?;
        self.session.clear().await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Rag(#[from] RagError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::Multipart(e) => (e.status(), e.body_text()),
            Self::Rag(RagError::Content(msg)) => (StatusCode::BAD_REQUEST, msg),
            Self::Rag(e @ RagError::IndexNotFound) => (StatusCode::BAD_REQUEST, e.to_string()),
            Self::Rag(e @ RagError::IngestionInProgress) => (StatusCode::CONFLICT, e.to_string()),
            Self::Rag(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "An unexpected error occurred.".to_string())
            }
            Self::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "An unexpected error occurred.".to_string())
            }
        };
        (status, Json(ErrorDetail { detail })).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.settings.max_file_size_bytes() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/upload",
            post(upload_document).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/chat", post(chat))
        .route("/status", get(get_status))
        .route("/history", get(get_history))
        .route("/reset", post(reset_session))
        .route("/clear_chat", post(clear_chat))
        .layer(middleware::from_fn_with_state(state.rate_limiter.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(DefaultBodyLimit::max(REQUEST_BODY_LIMIT))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.settings))
        .with_state(state)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins = settings.allowed_origins();
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([REQUEST_ID_HEADER])
}

async fn request_id(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let span = tracing::info_span!("request", request_id = %id);

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.settings.api_key.as_deref() else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer ").map(str::trim))
        });

    if provided != Some(expected) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorDetail {
                detail: "Invalid or missing API key".to_string(),
            }),
        )
            .into_response();
    }
    next.run(request).await
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Base name only, so a client-supplied path never reaches the filesystem.
fn display_name(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn validate_pdf(content: &[u8], filename: &str, settings: &Settings) -> Result<(), ApiError> {
    if content.len() > settings.max_file_size_bytes() {
        return Err(ApiError::PayloadTooLarge(format!(
            "File too large. Maximum size is {}MB.",
            settings.max_file_size_mb
        )));
    }
    if !filename.to_lowercase().ends_with(".pdf") {
        return Err(ApiError::BadRequest(
            "Invalid file type. Only PDF files are accepted.".to_string(),
        ));
    }
    if !looks_like_pdf(content) {
        return Err(ApiError::BadRequest(
            "Invalid PDF file. The file does not appear to be a valid PDF.".to_string(),
        ));
    }
    Ok(())
}

async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let filename = field.file_name().map(display_name).unwrap_or_default();
            let content = field.bytes().await?;
            upload = Some((filename, content));
            break;
        }
    }
    let (filename, content) = upload.ok_or_else(|| ApiError::BadRequest("Missing file field".to_string()))?;
    validate_pdf(&content, &filename, &state.settings)?;

    let hash = fingerprint(&content);
    tracing::debug!(hash = %hash, filename = %filename, "upload_hash_computed");

    let temp_dir = &state.settings.temp_dir;
    tokio::fs::create_dir_all(temp_dir).await.map_err(RagError::from)?;
    let path = temp_dir.join(format!("{}.pdf", Uuid::new_v4()));
    tokio::fs::write(&path, &content).await.map_err(RagError::from)?;

    // Ingestion outlives a disconnected client so the index and the session stay in step.
    let pipeline = state.pipeline.clone();
    let session = state.session.clone();
    let name = filename.clone();
    let outcome = tokio::spawn(async move {
        let result = pipeline.ingest(&path, Some(&hash)).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "temp file cleanup failed");
        }
        if result.is_ok() {
            session.set_document(name).await;
        }
        result
    })
    .await
    .map_err(RagError::from)??;

    let report = outcome.report();
    tracing::info!(filename = %filename, chunk_count = ?report.chunk_count, cache_hit = report.cache_hit, "upload indexed");

    let status = if outcome.cache_hit() {
        "Loaded from Cache"
    } else {
        "Uploaded & Indexed"
    };
    Ok(Json(UploadResponse {
        filename,
        status: status.to_string(),
        chunks: outcome.chunk_count().unwrap_or(0),
    }))
}

async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Result<Response, ApiError> {
    let question = validate_question(&request.question).map_err(|e| ApiError::Unprocessable(e.to_string()))?;
    state.chat_log.add_message("user", &question).await?;

    let mut events = Box::pin(state.streamer.generate(question));
    let chat_log = state.chat_log.clone();
    let body = async_stream::stream! {
        let mut answer = String::new();
        while let Some(event) = events.next().await {
            if let StreamEvent::Token(token) = &event {
                answer.push_str(token);
            }
            yield Ok::<_, std::convert::Infallible>(event.to_ndjson());
        }
        if !answer.is_empty() {
            if let Err(e) = chat_log.add_message("assistant", &answer).await {
                tracing::warn!(error = %e, "failed to record answer");
            }
        }
    };

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.pipeline.status().await;
    Json(StatusResponse {
        filename: state.session.document().await,
        indexing: status.is_indexing,
        last_indexed_at: status.last_indexed_at,
        total_chunks: status.total_chunks,
        last_fingerprint: status.last_fingerprint,
        last_error: status.last_error,
    })
}

async fn get_history(State(state): State<AppState>) -> Result<Json<Vec<HistoryMessage>>, ApiError> {
    Ok(Json(state.chat_log.history().await?))
}

async fn reset_session(State(state): State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    state.reset_session().await?;
    Ok(Json(ResetResponse {
        status: "Session Reset".to_string(),
    }))
}

async fn clear_chat(State(state): State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    state.chat_log.clear().await?;
    Ok(Json(ResetResponse {
        status: "Chat History Cleared".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            max_file_size_mb: 1,
            ..Settings::default()
        }
    }

    #[test]
    fn display_name_strips_directories() {
        assert_eq!(display_name("../../etc/report.pdf"), "report.pdf");
        assert_eq!(display_name("report.pdf"), "report.pdf");
    }

    #[test]
    fn pdf_validation_checks_size_then_extension_then_magic() {
        let s = settings();
        let big = vec![b'%'; 2 * 1024 * 1024];
        assert!(matches!(validate_pdf(&big, "a.pdf", &s), Err(ApiError::PayloadTooLarge(_))));
        assert!(matches!(validate_pdf(b"%PDF-1.4", "a.txt", &s), Err(ApiError::BadRequest(_))));
        assert!(matches!(validate_pdf(b"hello", "a.pdf", &s), Err(ApiError::BadRequest(_))));
        assert!(validate_pdf(b"%PDF-1.4", "A.PDF", &s).is_ok());
    }
}
