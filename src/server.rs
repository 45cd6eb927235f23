//! HTTP API for document upload, chat, summaries, and payment webhooks.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/documents` | Upload a document (JSON, base64 body) |
//! | `GET`    | `/documents/{id}` | Document status and metadata |
//! | `DELETE` | `/documents/{id}` | Delete a document and its data |
//! | `POST`   | `/documents/{id}/chat` | Ask a question about a document |
//! | `POST`   | `/documents/{id}/summary` | Summarize a document |
//! | `GET`    | `/documents/{id}/messages` | Recent chat history |
//! | `POST`   | `/webhooks/payment` | Payment provider callback |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses carry a machine-readable code:
//!
//! ```json
//! { "error": { "code": "UNSUPPORTED_FORMAT", "message": "..." } }
//! ```
//!
//! Plan-limit rejections (`DAILY_LIMIT_REACHED`, `MONTHLY_LIMIT_REACHED`)
//! return HTTP 200 with an error payload so API-gateway retry layers do not
//! hammer a request that will keep failing until the window rolls over.
//! `INSUFFICIENT_CREDITS` is 402; validation and extraction failures are
//! 400; upstream provider failures are 500.
//!
//! # Auth
//!
//! Every `/documents` route requires `Authorization: Bearer <token>`; the
//! token maps to an account row. The webhook route is authenticated by its
//! HMAC signature instead.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::cache::SummaryCache;
use crate::chat::{self, ChatError};
use crate::completion::{select_provider, CompletionProvider};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::extract::ExtractError;
use crate::ingest::{self, IngestDeps, IngestError, Upload};
use crate::ledger::{self, QuotaOutcome};
use crate::ocr::{HttpOcrClient, OcrClient};
use crate::retrieval;
use crate::webhook::{self, WebhookError};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    embedder: Option<Arc<dyn Embedder>>,
    provider: Option<Arc<dyn CompletionProvider>>,
    ocr: Option<Arc<dyn OcrClient>>,
    cache: Arc<SummaryCache>,
    webhook_secret: Option<Arc<Vec<u8>>>,
}

/// Starts the HTTP server on `[server].bind`. Runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::run_migrations(&pool).await?;

    let embedder = if config.embedding.is_enabled() {
        Some(create_embedder(&config.embedding)?)
    } else {
        None
    };
    let provider: Option<Arc<dyn CompletionProvider>> = match select_provider(&config.completion) {
        Ok(p) => {
            info!(provider = p.name(), "completion backend selected");
            Some(p)
        }
        Err(e) => {
            info!("no completion backend configured: {e}");
            None
        }
    };
    let ocr: Option<Arc<dyn OcrClient>> = match HttpOcrClient::from_config(&config.ocr) {
        Ok(client) => Some(Arc::new(client)),
        Err(_) => None,
    };
    let webhook_secret = std::env::var("PAYMENT_WEBHOOK_SECRET")
        .ok()
        .map(|s| Arc::new(s.into_bytes()));

    let cache = Arc::new(SummaryCache::new(
        config.cache.capacity,
        std::time::Duration::from_secs(config.cache.ttl_secs),
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        embedder,
        provider,
        ocr,
        cache,
        webhook_secret,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_upload))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/documents/{id}/chat", post(handle_chat))
        .route("/documents/{id}/summary", post(handle_summary))
        .route("/documents/{id}/messages", get(handle_messages))
        .route("/webhooks/payment", post(handle_payment_webhook))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    info!("listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(code: &'static str, message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, code, message)
}

fn not_found() -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Document not found")
}

fn unauthorized() -> AppError {
    AppError::new(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        "Missing or invalid bearer token",
    )
}

fn internal(err: impl std::fmt::Display) -> AppError {
    error!("internal error: {err}");
    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        "Internal server error",
    )
}

/// Map a quota rejection to the wire contract. Window limits are HTTP 200
/// with an error payload; an empty balance is 402.
fn quota_response(outcome: QuotaOutcome) -> Response {
    let (status, message) = match outcome {
        QuotaOutcome::DailyLimitReached => (StatusCode::OK, "Daily limit reached for your plan"),
        QuotaOutcome::MonthlyLimitReached => {
            (StatusCode::OK, "Monthly limit reached for your plan")
        }
        QuotaOutcome::InsufficientCredits => {
            (StatusCode::PAYMENT_REQUIRED, "Not enough credits")
        }
        QuotaOutcome::Allowed => unreachable!(),
    };
    let body = ErrorBody {
        error: ErrorDetail {
            code: outcome.code().to_string(),
            message: message.to_string(),
        },
    };
    (status, Json(body)).into_response()
}

fn chat_error_response(err: ChatError) -> Response {
    match err {
        ChatError::DocumentNotFound => not_found().into_response(),
        ChatError::DocumentNotReady(status) => bad_request(
            "DOCUMENT_NOT_READY",
            format!("Document is not ready (status: {status})"),
        )
        .into_response(),
        ChatError::QuotaDenied(outcome) => quota_response(outcome),
        ChatError::Completion(e) => internal(e).into_response(),
        ChatError::Other(e) => internal(e).into_response(),
    }
}

// ============ Auth ============

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(unauthorized)?;

    ledger::resolve_token(&state.pool, token)
        .await
        .map_err(internal)?
        .ok_or_else(unauthorized)
}

// ============ Handlers ============

#[derive(Deserialize)]
struct UploadRequest {
    filename: String,
    content_type: String,
    /// Base64-encoded file body.
    data: String,
}

#[derive(Serialize)]
struct DocumentResponse {
    id: String,
    title: String,
    kind: String,
    status: String,
    page_count: i64,
    used_ocr: bool,
}

impl From<crate::models::Document> for DocumentResponse {
    fn from(d: crate::models::Document) -> Self {
        Self {
            id: d.id,
            title: d.title,
            kind: d.kind,
            status: d.status.as_str().to_string(),
            page_count: d.page_count,
            used_ocr: d.used_ocr,
        }
    }
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UploadRequest>,
) -> Result<Response, AppError> {
    let user_id = authenticate(&state, &headers).await?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.data)
        .map_err(|_| bad_request("INVALID_BODY", "data is not valid base64"))?;
    if bytes.is_empty() {
        return Err(bad_request("INVALID_BODY", "empty file body"));
    }

    let deps = IngestDeps {
        embedder: state.embedder.clone(),
        ocr: state.ocr.clone(),
    };
    let upload = Upload {
        user_id,
        filename: req.filename,
        content_type: req.content_type,
        bytes,
    };

    match ingest::ingest_document(&state.pool, &state.config, &deps, upload).await {
        Ok(doc) => Ok((StatusCode::CREATED, Json(DocumentResponse::from(doc))).into_response()),
        Err(IngestError::UnsupportedFormat(msg)) => {
            Err(bad_request("UNSUPPORTED_FORMAT", msg))
        }
        Err(IngestError::Extract(ExtractError::InsufficientContent(n))) => Err(bad_request(
            "EXTRACTION_FAILED",
            format!("Document has too little extractable text ({n} chars)"),
        )),
        Err(IngestError::Extract(e)) => Err(bad_request("EXTRACTION_FAILED", e.to_string())),
        Err(IngestError::OcrUnavailable) => Err(bad_request(
            "EXTRACTION_FAILED",
            "Document appears to be scanned and OCR is not configured",
        )),
        Err(IngestError::QuotaDenied(outcome)) => Ok(quota_response(outcome)),
        Err(e) => Err(internal(e)),
    }
}

async fn handle_get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let user_id = authenticate(&state, &headers).await?;
    let doc = ingest::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
        .filter(|d| d.user_id == user_id)
        .ok_or_else(not_found)?;
    Ok(Json(DocumentResponse::from(doc)))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let user_id = authenticate(&state, &headers).await?;
    let doc = ingest::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
        .filter(|d| d.user_id == user_id)
        .ok_or_else(not_found)?;

    retrieval::delete_document_data(&state.pool, &doc.id)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
    context_chunks: usize,
    input_tokens: u32,
    output_tokens: u32,
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let user_id = authenticate(&state, &headers).await?;
    if req.question.trim().is_empty() {
        return Err(bad_request("INVALID_BODY", "question must not be empty"));
    }
    let embedder = state
        .embedder
        .as_ref()
        .ok_or_else(|| bad_request("EMBEDDINGS_DISABLED", "embedding provider is disabled"))?;
    let provider = state
        .provider
        .clone()
        .ok_or_else(|| internal("no completion provider configured"))?;

    match chat::ask(
        &state.pool,
        &state.config,
        embedder.as_ref(),
        provider,
        &user_id,
        &id,
        &req.question,
    )
    .await
    {
        Ok(answer) => Ok(Json(ChatResponse {
            answer: answer.text,
            context_chunks: answer.context_chunks,
            input_tokens: answer.input_tokens,
            output_tokens: answer.output_tokens,
        })
        .into_response()),
        Err(e) => Ok(chat_error_response(e)),
    }
}

#[derive(Serialize)]
struct SummaryResponse {
    summary: String,
    cached: bool,
}

async fn handle_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let user_id = authenticate(&state, &headers).await?;
    let provider = state
        .provider
        .clone()
        .ok_or_else(|| internal("no completion provider configured"))?;

    match chat::summarize(&state.pool, &state.config, provider, &state.cache, &user_id, &id).await {
        Ok(summary) => Ok(Json(SummaryResponse {
            summary: summary.text,
            cached: summary.cached,
        })
        .into_response()),
        Err(e) => Ok(chat_error_response(e)),
    }
}

#[derive(Serialize)]
struct MessageResponse {
    role: String,
    content: String,
    created_at: i64,
}

async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageResponse>>, AppError> {
    let user_id = authenticate(&state, &headers).await?;
    ingest::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
        .filter(|d| d.user_id == user_id)
        .ok_or_else(not_found)?;

    let messages = chat::list_messages(&state.pool, &id, &user_id, 50)
        .await
        .map_err(internal)?;
    Ok(Json(
        messages
            .into_iter()
            .map(|m| MessageResponse {
                role: m.role.as_str().to_string(),
                content: m.content,
                created_at: m.created_at,
            })
            .collect(),
    ))
}

async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let secret = state
        .webhook_secret
        .as_ref()
        .ok_or_else(|| internal("PAYMENT_WEBHOOK_SECRET is not set"))?;
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("INVALID_SIGNATURE", "missing X-Signature header"))?;

    match webhook::handle_webhook(&state.pool, secret, &body, signature).await {
        Ok(outcome) => Ok(Json(serde_json::json!({ "received": true, "outcome": format!("{outcome:?}").to_lowercase() }))
            .into_response()),
        Err(WebhookError::InvalidSignature) | Err(WebhookError::MalformedSignature) => Err(
            bad_request("INVALID_SIGNATURE", "webhook signature verification failed"),
        ),
        Err(WebhookError::MalformedPayload(msg)) => Err(bad_request("INVALID_BODY", msg)),
        Err(WebhookError::UnknownPlan(plan)) => {
            Err(bad_request("INVALID_BODY", format!("unknown plan: {plan}")))
        }
        Err(WebhookError::Other(e)) => Err(internal(e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
