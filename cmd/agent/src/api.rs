use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use guarder_core::error::{StoreError, SynthesisError, TelemetryError};
use guarder_core::metrics::Metrics;
use guarder_core::rule::{FilterRule, RuleSpec};
use guarder_core::store::{RuleStore, RuleTable};
use guarder_core::synth::{AnalysisRequest, GenerationConfig, REDACTED_KEY, Synthesizer};
use guarder_core::telemetry::TelemetryReader;
use prometheus_client::encoding::text::encode;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub type SharedStore = Arc<RuleStore<Box<dyn RuleTable>>>;

#[derive(Clone)]
pub struct ApiState {
    pub store: SharedStore,
    pub reader: Arc<dyn TelemetryReader>,
    pub synth: Arc<Synthesizer>,
    pub metrics: Arc<Metrics>,
}

// ── Errors ───────────────────────────────────────────────────────────

/// Every failure leaves as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: &self.message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::Validation(_) | StoreError::IdOutOfRange { .. } => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) | StoreError::CapacityExceeded(_) => StatusCode::CONFLICT,
            StoreError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<SynthesisError> for ApiError {
    fn from(e: SynthesisError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e.body_text()))
    }
}

fn parse_id(raw: &str) -> Result<u32, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid rule id {raw:?}")))
}

// ── Router ───────────────────────────────────────────────────────────

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/filters", get(list_filters).post(add_filter))
        .route(
            "/filters/{id}",
            get(get_filter).put(update_filter).delete(remove_filter),
        )
        .route("/filters/{id}/enable", post(enable_filter))
        .route("/filters/{id}/disable", post(disable_filter))
        .route("/ai/config", get(get_ai_config).post(set_ai_config))
        .route("/ai/status", get(ai_status))
        .route("/ai/generate", post(generate))
        .route("/ai/analyze", post(analyze))
        .route("/connections", get(connections))
        .route("/icmp", get(icmp))
        .route("/stats", get(stats));

    Router::new()
        .nest("/api", api)
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Bind the API socket. Called before serving so a taken port fails
/// startup.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API address {addr}"))
}

pub async fn serve(listener: TcpListener, state: ApiState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP API listening");
    }
    axum::serve(listener, router(state)).await
}

/// Allow any origin; answer preflight requests directly.
async fn cors(req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

// ── Filters ──────────────────────────────────────────────────────────

async fn list_filters(State(state): State<ApiState>) -> Json<Vec<FilterRule>> {
    Json(state.store.list())
}

async fn add_filter(
    State(state): State<ApiState>,
    payload: Result<Json<RuleSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<FilterRule>), ApiError> {
    let Json(spec) = payload?;
    let rule = state.store.add(&spec.normalized())?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<FilterRule>, ApiError> {
    let id = parse_id(&id)?;
    state
        .store
        .get(id)
        .map(Json)
        .ok_or_else(|| StoreError::NotFound(id).into())
}

async fn update_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<RuleSpec>, JsonRejection>,
) -> Result<Json<FilterRule>, ApiError> {
    let id = parse_id(&id)?;
    let Json(mut spec) = payload?;
    spec.id = id;
    Ok(Json(state.store.update(&spec.normalized())?))
}

async fn remove_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.store.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<FilterRule>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.enable(id)?))
}

async fn disable_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<FilterRule>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.disable(id)?))
}

// ── Rule synthesis ───────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusMessage {
    status: &'static str,
    message: &'static str,
}

async fn get_ai_config(State(state): State<ApiState>) -> Json<GenerationConfig> {
    Json(state.synth.config().redacted())
}

async fn set_ai_config(
    State(state): State<ApiState>,
    payload: Result<Json<GenerationConfig>, JsonRejection>,
) -> Result<Json<StatusMessage>, ApiError> {
    let Json(mut config) = payload?;
    // Clients echo back the redacted key from GET; keep the real one.
    if config.api_key == REDACTED_KEY {
        config.api_key = state.synth.config().api_key;
    }
    state
        .synth
        .replace_config(config)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(StatusMessage {
        status: "success",
        message: "AI configuration updated",
    }))
}

async fn ai_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.synth.status())
}

async fn generate(
    State(state): State<ApiState>,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let response = state.synth.synthesize(state.reader.as_ref(), &request).await?;
    if !response.success {
        warn!(
            failure = ?response.failure,
            "rule synthesis returned no result: {}",
            response.error.as_deref().unwrap_or_default()
        );
    }
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    #[serde(default)]
    include_icmp: bool,
    #[serde(default)]
    include_tcp: bool,
    #[serde(default)]
    include_stats: bool,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    success: bool,
    summary: String,
}

async fn analyze(
    State(state): State<ApiState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let Json(req) = payload?;
    let request = AnalysisRequest {
        include_icmp: req.include_icmp,
        include_tcp: req.include_tcp,
        include_stats: req.include_stats,
        ..Default::default()
    };
    let summary = state.synth.digest(state.reader.as_ref(), &request)?;
    Ok(Json(AnalyzeResponse {
        success: true,
        summary,
    }))
}

// ── Telemetry ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TableEntry {
    key: String,
    info: String,
}

async fn connections(State(state): State<ApiState>) -> Result<Json<Vec<TableEntry>>, ApiError> {
    let entries = state
        .reader
        .connections()?
        .into_iter()
        .map(|c| TableEntry {
            key: c.key(),
            info: c.details(),
        })
        .collect();
    Ok(Json(entries))
}

async fn icmp(State(state): State<ApiState>) -> Result<Json<Vec<TableEntry>>, ApiError> {
    let entries = state
        .reader
        .icmp_flows()?
        .into_iter()
        .map(|f| TableEntry {
            key: f.key(),
            info: f.details(),
        })
        .collect();
    Ok(Json(entries))
}

async fn stats(State(state): State<ApiState>) -> Result<Response, ApiError> {
    Ok(match state.reader.stats()? {
        Some(stats) => Json(stats).into_response(),
        None => Json(guarder_core::telemetry::PerfStats::default()).into_response(),
    })
}

// ── Observability ────────────────────────────────────────────────────

async fn metrics_handler(State(state): State<ApiState>) -> Response {
    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &state.metrics.registry) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode error: {e}"),
        )
            .into_response();
    }
    let mut response = Response::new(axum::body::Body::from(buf));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/openmetrics-text; version=1.0.0; charset=utf-8"),
    );
    response
}

async fn healthz() -> Response {
    (StatusCode::OK, "ok").into_response()
}
