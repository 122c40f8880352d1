//! HTTP API server for flowcheck.
//!
//! Records use snake_case JSON; flow documents keep their camelCase shape.

pub mod middleware;
mod stream;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info_span, warn};

use crate::engine::LifecycleController;
use crate::error::Error;
use crate::flow::{parse_flow, validate_flow, FlowConfig};
use crate::metrics;
use crate::progress::ExecutionWatcher;
use crate::storage::{
    CaseReport, ExecutionListQuery, LogQuery, LogScope, NewLogEntry, SqliteStorage, StepReport,
    SuiteCaseEntry, SuiteReport, TestSuite,
};
use middleware::{access_log_middleware, request_id_middleware, RequestLogConfig};

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<Value>)>;

/// Create a sanitized error response for external consumers.
///
/// Server-side failures are logged in full; the client only sees the code
/// and a safe message.
fn external_error_response(e: Error) -> (StatusCode, Json<Value>) {
    let status = e.status_code();
    if status.is_server_error() {
        error!("API error: {:?}", e);
    } else {
        debug!("API request rejected: {}", e);
    }
    (status, Json(e.to_external_json()))
}

/// Create CORS layer from `FLOWCHECK_CORS_ORIGINS`.
///
/// - FLOWCHECK_CORS_ORIGINS: comma-separated origins (default: http://localhost:3000)
/// - FLOWCHECK_CORS_ALLOW_ALL: "true" allows any origin
pub fn create_cors_layer() -> CorsLayer {
    let allow_all = std::env::var("FLOWCHECK_CORS_ALLOW_ALL")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if allow_all {
        warn!("CORS configured to allow all origins");
        return CorsLayer::very_permissive();
    }

    let origins_str = std::env::var("FLOWCHECK_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    let mut origins: Vec<HeaderValue> = origins_str
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(e) => {
                warn!("Invalid CORS origin '{}': {}", s, e);
                None
            }
        })
        .collect();
    if origins.is_empty() {
        warn!("No valid CORS origins configured, using localhost:3000");
        origins.push(HeaderValue::from_static("http://localhost:3000"));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Concurrency limit from `FLOWCHECK_MAX_CONCURRENT_REQUESTS` (default 100).
pub fn create_concurrency_limit() -> tower::limit::ConcurrencyLimitLayer {
    let max = std::env::var("FLOWCHECK_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
    tower::limit::ConcurrencyLimitLayer::new(max)
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub controller: LifecycleController,
    pub watcher: ExecutionWatcher,
}

impl AppState {
    fn storage(&self) -> &SqliteStorage {
        self.controller.storage()
    }
}

/// Create the API router (without state applied).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/flows/validate", post(validate_flow_handler))
        .route("/api/test-cases/{id}", put(save_test_case).get(get_test_case))
        .route("/api/test-suites/{id}", put(save_suite).get(get_suite))
        .route("/api/test-suites/{id}/execute", post(execute_suite))
        .route("/api/test-suites/{id}/executions", get(list_suite_executions))
        .route("/api/settings", get(get_settings).put(save_settings))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/stop", post(stop_execution))
        .route("/api/executions/{id}/retry", post(retry_execution))
        .route("/api/executions/{id}/stream", get(stream::stream_execution))
        .route("/api/executions/{id}/logs", get(stream::execution_logs))
        .route("/api/execution-logs", get(query_logs))
        .route("/api/worker/steps/{id}", post(report_step))
        .route("/api/worker/cases/{id}", post(report_case))
        .route("/api/worker/executions/{id}", post(report_suite))
        .route("/api/worker/logs", post(append_log))
}

/// Create the complete API router with state and middleware.
pub fn create_router(state: AppState) -> Router {
    let request_log = RequestLogConfig::default();
    create_api_routes()
        .layer(axum::middleware::from_fn_with_state(
            request_log.clone(),
            access_log_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            request_log,
            request_id_middleware,
        ))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
        .layer(create_cors_layer())
        .layer(create_concurrency_limit())
        .with_state(state)
}

fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

// ============================================================================
// Health and metrics
// ============================================================================

async fn health_check(State(state): State<AppState>) -> Response {
    match state.storage().check_health().await {
        Ok(health) => Json(json!({
            "status": "ok",
            "foreign_keys_enabled": health.foreign_keys_enabled,
            "integrity_check": health.integrity_check,
            "foreign_key_violations": health.foreign_key_violations.len(),
            "orphaned_case_executions": health.orphaned_case_executions,
            "orphaned_step_executions": health.orphaned_step_executions,
            "journal_mode": health.journal_mode,
            "busy_timeout_ms": health.busy_timeout_ms,
        }))
        .into_response(),
        Err(e) => {
            error!("Health check failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": "Health check failed"})),
            )
                .into_response()
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

// ============================================================================
// Flows and test cases
// ============================================================================

/// Accepts a JSON or YAML flow document.
async fn validate_flow_handler(body: Bytes) -> Response {
    let source = String::from_utf8_lossy(&body);
    let flow = match parse_flow(&source) {
        Ok(flow) => flow,
        Err(e) => return external_error_response(e).into_response(),
    };

    match validate_flow(&flow) {
        Ok(validated) => {
            metrics::record_flow_validation(true);
            Json(json!({
                "valid": true,
                "order": validated.order.nodes,
                "orphans": validated.order.orphans,
                "steps": validated.steps,
            }))
            .into_response()
        }
        Err(e) => {
            metrics::record_flow_validation(false);
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"valid": false, "error": e.report()})),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct SaveTestCaseRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    flow_config: FlowConfig,
}

async fn save_test_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SaveTestCaseRequest>,
) -> ApiResult<Json<Value>> {
    let saved = state
        .storage()
        .save_test_case(
            &id,
            &request.name,
            request.description.as_deref(),
            &request.flow_config,
        )
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"success": true, "test_case": saved})))
}

async fn get_test_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.storage().get_test_case(&id).await {
        Ok(Some(test_case)) => Ok(Json(json!(test_case))),
        Ok(None) => Err(external_error_response(Error::NotFound(format!(
            "test case '{}'",
            id
        )))),
        Err(e) => Err(external_error_response(e)),
    }
}

// ============================================================================
// Suites and settings
// ============================================================================

#[derive(Deserialize)]
struct SaveSuiteRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    use_global_settings: bool,
    #[serde(default)]
    environment_config: Option<Value>,
    #[serde(default)]
    test_cases: Vec<SuiteCaseEntry>,
}

fn default_true() -> bool {
    true
}

async fn save_suite(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SaveSuiteRequest>,
) -> ApiResult<Json<Value>> {
    let now = Utc::now();
    let suite = TestSuite {
        id,
        name: request.name,
        description: request.description,
        use_global_settings: request.use_global_settings,
        environment_config: request.environment_config,
        test_cases: request.test_cases,
        created_at: now,
        updated_at: now,
    };
    state
        .storage()
        .save_suite(&suite)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"success": true, "suite_id": suite.id})))
}

async fn get_suite(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.storage().get_suite(&id).await {
        Ok(Some(suite)) => Ok(Json(json!(suite))),
        Ok(None) => Err(external_error_response(Error::NotFound(format!(
            "test suite '{}'",
            id
        )))),
        Err(e) => Err(external_error_response(e)),
    }
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let settings = state
        .storage()
        .get_settings()
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"settings": settings.unwrap_or_else(|| json!({}))})))
}

async fn save_settings(
    State(state): State<AppState>,
    Json(settings): Json<Value>,
) -> ApiResult<Json<Value>> {
    state
        .storage()
        .save_settings(&settings)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"success": true})))
}

// ============================================================================
// Executions
// ============================================================================

#[derive(Deserialize, Default)]
struct TriggerRequest {
    #[serde(default)]
    triggered_by: Option<String>,
}

impl TriggerRequest {
    fn triggered_by(&self) -> &str {
        self.triggered_by.as_deref().unwrap_or("api")
    }
}

async fn execute_suite(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<TriggerRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let receipt = state
        .controller
        .dispatch(&id, request.triggered_by())
        .await
        .map_err(external_error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": receipt.dispatched, "data": receipt})),
    ))
}

async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<TriggerRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let receipt = state
        .controller
        .retry(&id, request.triggered_by())
        .await
        .map_err(external_error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": receipt.dispatched, "data": receipt})),
    ))
}

async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let receipt = state
        .controller
        .stop(&id)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"success": true, "data": receipt})))
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.storage().get_hierarchy(&id).await {
        Ok(Some(hierarchy)) => {
            let pass_rate = hierarchy.execution.pass_rate();
            no_store(
                Json(json!({
                    "execution": hierarchy.execution,
                    "cases": hierarchy.cases,
                    "pass_rate": pass_rate,
                }))
                .into_response(),
            )
        }
        Ok(None) => {
            external_error_response(Error::NotFound(format!("execution '{}'", id))).into_response()
        }
        Err(e) => external_error_response(e).into_response(),
    }
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionListQuery>,
) -> ApiResult<Json<Value>> {
    let page = state
        .storage()
        .query_executions(&query)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!(page)))
}

async fn list_suite_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(mut query): Query<ExecutionListQuery>,
) -> ApiResult<Json<Value>> {
    query.suite_id = Some(id);
    list_executions(State(state), Query(query)).await
}

async fn query_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Value>> {
    let logs = state
        .storage()
        .query_logs(&query)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"total": logs.len(), "logs": logs})))
}

// ============================================================================
// Worker reporting
// ============================================================================

async fn report_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<StepReport>,
) -> ApiResult<Json<Value>> {
    let applied = state
        .controller
        .report_step(&id, &report)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"applied": applied})))
}

async fn report_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<CaseReport>,
) -> ApiResult<Json<Value>> {
    let applied = state
        .controller
        .report_case(&id, &report)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"applied": applied})))
}

async fn report_suite(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<SuiteReport>,
) -> ApiResult<Json<Value>> {
    let applied = state
        .controller
        .report_suite(&id, &report)
        .await
        .map_err(external_error_response)?;
    Ok(Json(json!({"applied": applied})))
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScopeKind {
    Suite,
    Case,
    Step,
}

#[derive(Deserialize)]
struct AppendLogRequest {
    scope: ScopeKind,
    id: String,
    #[serde(flatten)]
    entry: NewLogEntry,
}

async fn append_log(
    State(state): State<AppState>,
    Json(request): Json<AppendLogRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let scope = match request.scope {
        ScopeKind::Suite => LogScope::Suite(request.id),
        ScopeKind::Case => LogScope::Case(request.id),
        ScopeKind::Step => LogScope::Step(request.id),
    };
    let id = state
        .controller
        .append_log(&scope, &request.entry)
        .await
        .map_err(external_error_response)?;
    Ok((StatusCode::CREATED, Json(json!({"id": id}))))
}
