//! HTTP API.
//!
//! Model management, context caching and an OpenAI-compatible chat
//! endpoint:
//! - GET /health, GET /metrics
//! - /api/v1/models: load, list, switch, unload
//! - /api/v1/contexts: ingest, query, list, get, promote, demote, delete, stats
//! - POST /v1/chat/completions
//!
//! Every JSON response carries `status: "success" | "error"`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, ContextFilter, ContextInfo, Tier};
use crate::engine::{ModelSource, ModelType, SamplingParams};
use crate::error::CoreError;
use crate::pipeline::{CompletionRequest, IngestRequest, QueryRequest, QueryUsage};
use crate::registry::descriptor::ModelInfo;
use crate::server::streaming::generation_to_sse_stream;
use crate::service::VpidService;

/// Shared handler state.
pub type AppState = Arc<VpidService>;

/// Build the router with all routes and the middleware stack.
pub fn build_router(state: AppState) -> Router {
    let server = &state.config.server;
    let max_concurrent = server.max_concurrent_requests.max(1);
    let timeout = Duration::from_secs(server.request_timeout_secs.max(1));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/models/load", post(load_model))
        .route("/api/v1/models/switch", post(switch_model))
        .route("/api/v1/models/unload", post(unload_model))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/v1/contexts", get(list_contexts))
        .route("/api/v1/contexts/ingest", post(ingest_context))
        .route("/api/v1/contexts/stats", get(context_stats))
        .route(
            "/api/v1/contexts/{id}",
            get(get_context).delete(delete_context),
        )
        .route("/api/v1/contexts/{id}/query", post(query_context))
        .route("/api/v1/contexts/{id}/promote", post(promote_context))
        .route("/api/v1/contexts/{id}/demote", post(demote_context))
        .with_state(state)
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ─── Envelope & Errors ─────────────────────────────────────────────────────

/// Successful response: `{"status": "success", ...body}`.
#[derive(Debug, Serialize)]
pub struct Success<T> {
    status: &'static str,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        status: "success",
        body,
    })
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

/// A core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

/// HTTP status for each error kind.
pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::ContextNotFound(_) | CoreError::ModelNotLoaded(_) => StatusCode::NOT_FOUND,
        CoreError::DuplicateModel(_) | CoreError::ModelBusy(_) | CoreError::ModelMismatch { .. } => {
            StatusCode::CONFLICT
        }
        CoreError::LoadFailure { .. } | CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CoreError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
        CoreError::StorageFailure(_)
        | CoreError::PromotionFailure { .. }
        | CoreError::ComputeFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::StorageCorruption(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "Request failed");
        } else {
            warn!(kind = self.0.kind(), error = %self.0, "Request rejected");
        }
        let body = ErrorBody {
            status: "error",
            error: ErrorDetail {
                kind: self.0.kind(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// JSON body extractor whose rejections use the error envelope.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(CoreError::InvalidRequest(rejection.body_text()))),
        }
    }
}

type ApiResult<T> = Result<Json<Success<T>>, ApiError>;

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub uptime_secs: u64,
    pub models_loaded: usize,
    pub active_model: Option<String>,
    pub contexts: usize,
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
    pub file_path: String,
    #[serde(default)]
    pub model_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelResponse {
    pub model: ModelInfo,
}

#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub active_model: Option<String>,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchModelRequest {
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct SwitchModelResponse {
    pub model_id: String,
    pub vpid: u32,
    pub sequence: u64,
    pub superseded: bool,
}

#[derive(Debug, Deserialize)]
pub struct UnloadModelRequest {
    pub model_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct UnloadModelResponse {
    pub model_id: String,
    pub unloaded: bool,
}

#[derive(Debug, Deserialize)]
pub struct IngestContextRequest {
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub reuse_existing: bool,
}

#[derive(Debug, Serialize)]
pub struct IngestContextResponse {
    pub context_id: String,
    pub name: String,
    pub model_id: String,
    pub token_count: usize,
    pub tier: Tier,
    pub reused: bool,
}

#[derive(Debug, Deserialize)]
pub struct QueryContextRequest {
    pub query: String,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryContextResponse {
    pub context_id: String,
    pub model_id: String,
    pub response: String,
    pub cache_hit: bool,
    pub usage: QueryUsage,
}

#[derive(Debug, Deserialize)]
pub struct ListContextsParams {
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ContextListResponse {
    pub count: usize,
    pub contexts: Vec<ContextInfo>,
}

#[derive(Debug, Serialize)]
pub struct ContextResponse {
    pub context: ContextInfo,
}

#[derive(Debug, Deserialize)]
pub struct TierRequest {
    pub tier: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteContextResponse {
    pub context_id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub stats: CacheStats,
}

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

fn default_temperature() -> f64 {
    SamplingParams::default().temperature
}

fn default_top_p() -> f64 {
    SamplingParams::default().top_p
}

/// Chat completion response (non-streaming).
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

fn parse_tier(raw: &str) -> Result<Tier, ApiError> {
    raw.parse::<Tier>()
        .map_err(|e| ApiError(CoreError::InvalidRequest(e)))
}

// ─── Service Routes ────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Success<HealthResponse>> {
    success(HealthResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        models_loaded: state.registry.len(),
        active_model: state.registry.active().map(|d| d.model_id().to_string()),
        contexts: state.cache.len(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ─── Model Routes ──────────────────────────────────────────────────────────

async fn load_model(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoadModelRequest>,
) -> ApiResult<ModelResponse> {
    let model_type = match req.model_type.as_deref() {
        Some(raw) => raw.parse::<ModelType>().map_err(CoreError::InvalidRequest)?,
        None => ModelType::default(),
    };
    let source = ModelSource {
        file_path: req.file_path.into(),
        model_type,
    };
    let descriptor = state.registry.load(&req.model_id, source).await?;
    let active = matches!(state.registry.active(), Some(d) if d.vpid() == descriptor.vpid());
    Ok(success(ModelResponse {
        model: descriptor.info(active),
    }))
}

async fn list_models(State(state): State<AppState>) -> Json<Success<ModelListResponse>> {
    success(ModelListResponse {
        active_model: state.registry.active().map(|d| d.model_id().to_string()),
        models: state.registry.list(),
    })
}

async fn switch_model(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SwitchModelRequest>,
) -> ApiResult<SwitchModelResponse> {
    let outcome = state.scheduler.switch(&req.model_id)?;
    Ok(success(SwitchModelResponse {
        model_id: outcome.descriptor.model_id().to_string(),
        vpid: outcome.descriptor.vpid(),
        sequence: outcome.sequence,
        superseded: outcome.superseded,
    }))
}

async fn unload_model(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<UnloadModelRequest>,
) -> ApiResult<UnloadModelResponse> {
    state.registry.unload(&req.model_id, req.force)?;
    Ok(success(UnloadModelResponse {
        model_id: req.model_id,
        unloaded: true,
    }))
}

async fn chat_completions(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    info!(
        request_id = %request_id,
        model = %req.model,
        messages = req.messages.len(),
        stream = req.stream,
        "Chat completion request"
    );

    let prompt = req
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let completion = CompletionRequest {
        request_id: request_id.clone(),
        model: req.model.clone(),
        prompt,
        max_tokens: req.max_tokens,
        sampling: SamplingParams {
            temperature: req.temperature,
            top_p: req.top_p,
        },
    };

    if req.stream {
        let rx = state.generator.stream(completion)?;
        let stream = generation_to_sse_stream(rx, request_id, req.model);
        return Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let done = state.generator.complete(completion).await?;
    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: done.model_id,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: done.text,
            },
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens: done.prompt_tokens,
            completion_tokens: done.completion_tokens,
            total_tokens: done.prompt_tokens + done.completion_tokens,
        },
    };
    Ok(success(response).into_response())
}

// ─── Context Routes ────────────────────────────────────────────────────────

async fn ingest_context(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<IngestContextRequest>,
) -> ApiResult<IngestContextResponse> {
    let outcome = state
        .ingest
        .ingest(IngestRequest {
            content: req.content,
            model_id: req.model_id,
            name: req.name,
            ttl_seconds: req.ttl_seconds,
            reuse_existing: req.reuse_existing,
        })
        .await?;
    let context = outcome.context;
    Ok(success(IngestContextResponse {
        context_id: context.context_id,
        name: context.name,
        model_id: context.model_id,
        token_count: context.token_count,
        tier: context.tier,
        reused: outcome.reused,
    }))
}

async fn query_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
    ApiJson(req): ApiJson<QueryContextRequest>,
) -> Result<Response, ApiError> {
    let request = QueryRequest {
        context_id,
        query: req.query,
        max_tokens: req.max_tokens,
        model_id: req.model_id,
    };

    if req.stream {
        let stream = state.query.stream(request).await?;
        let request_id = Uuid::new_v4().to_string();
        info!(
            request_id = %request_id,
            context_id = %stream.context_id,
            cache_hit = stream.cache_hit,
            "Streaming context query"
        );
        let events = generation_to_sse_stream(stream.events, request_id, stream.model_id);
        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let result = state.query.query(request).await?;
    Ok(success(QueryContextResponse {
        context_id: result.context_id,
        model_id: result.model_id,
        response: result.response,
        cache_hit: result.cache_hit,
        usage: result.usage,
    })
    .into_response())
}

async fn list_contexts(
    State(state): State<AppState>,
    Query(params): Query<ListContextsParams>,
) -> ApiResult<ContextListResponse> {
    let tier = params.tier.as_deref().map(parse_tier).transpose()?;
    let contexts = state.cache.list(&ContextFilter {
        tier,
        model_id: params.model_id,
    });
    Ok(success(ContextListResponse {
        count: contexts.len(),
        contexts,
    }))
}

async fn get_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> ApiResult<ContextResponse> {
    Ok(success(ContextResponse {
        context: state.cache.get(&context_id)?,
    }))
}

async fn promote_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
    ApiJson(req): ApiJson<TierRequest>,
) -> ApiResult<ContextResponse> {
    let tier = parse_tier(&req.tier)?;
    Ok(success(ContextResponse {
        context: state.cache.promote(&context_id, tier).await?,
    }))
}

async fn demote_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
    ApiJson(req): ApiJson<TierRequest>,
) -> ApiResult<ContextResponse> {
    let tier = parse_tier(&req.tier)?;
    Ok(success(ContextResponse {
        context: state.cache.demote(&context_id, tier).await?,
    }))
}

async fn delete_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> ApiResult<DeleteContextResponse> {
    state.cache.delete(&context_id).await?;
    Ok(success(DeleteContextResponse {
        context_id,
        deleted: true,
    }))
}

async fn context_stats(State(state): State<AppState>) -> Json<Success<StatsResponse>> {
    success(StatsResponse {
        stats: state.cache.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&CoreError::ContextNotFound("c".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CoreError::ModelBusy("m".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CoreError::CapacityExceeded {
                tier: "hot".into(),
                needed: 1
            }),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            status_for(&CoreError::StorageCorruption("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&CoreError::StorageFailure("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_success_envelope_flattens_body() {
        let Json(body) = success(UnloadModelResponse {
            model_id: "m".into(),
            unloaded: true,
        });
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["model_id"], "m");
        assert_eq!(value["unloaded"], true);
    }
}
