//! Conversational analytics HTTP API.
//!
//! Exposes the full service surface — authentication, natural-language
//! analytics, saved queries, and alerts — as a JSON HTTP API consumed by
//! the chat dashboard.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service banner |
//! | `GET`  | `/health` | Aggregate health of warehouse, assistant, and API |
//! | `POST` | `/auth/register` | Create a user |
//! | `POST` | `/auth/login` | Issue an access token |
//! | `GET`  | `/auth/me` | Current user profile |
//! | `POST` | `/auth/logout` | Deactivate the user's sessions |
//! | `GET`  | `/auth/users` | List users (admin) |
//! | `POST` | `/analytics/query` | Natural-language query pipeline |
//! | `GET`  | `/analytics/supplier-performance` | Supplier metrics + insights |
//! | `GET`  | `/analytics/sales-forecast` | Monthly sales history + insights |
//! | `GET`  | `/analytics/schema` | Schema catalog + live table list |
//! | `GET`  | `/analytics/table/{name}` | Column detail + sample rows |
//! | `GET`  | `/analytics/history` | Conversation history |
//! | `POST` | `/analytics/validate-sql` | Statement guard verdict + analysis |
//! | `GET`  | `/analytics/dashboard` | Headline metrics |
//! | `POST`/`GET` | `/queries/saved` | Save / list saved queries |
//! | `GET`/`PUT`/`DELETE` | `/queries/saved/{id}` | Manage one saved query |
//! | `POST` | `/queries/saved/{id}/execute` | Run a saved query |
//! | `GET`  | `/queries/cache/stats` | Result-cache statistics |
//! | `DELETE` | `/queries/cache/clear` | Purge the result cache (admin) |
//! | `GET`  | `/queries/templates` | Canned query templates |
//! | `POST`/`GET` | `/alerts` | Create / list alerts |
//! | `GET`/`PUT`/`DELETE` | `/alerts/{id}` | Manage one alert |
//! | `POST` | `/alerts/{id}/test` | Evaluate an alert now |
//! | `GET`  | `/alerts/{id}/history` | Alert trigger history |
//! | `POST` | `/alerts/check-all` | Evaluate every active alert |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Forbidden operation: DROP" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `upstream` (502), `internal` (500).
//!
//! # Authentication
//!
//! All routes except `/`, `/health`, `/auth/register`, and `/auth/login`
//! require `Authorization: Bearer <token>` carrying a token from
//! `/auth/login`.
//!
//! # CORS
//!
//! The configured dashboard origin (`[server].cors_origin`) is permitted;
//! `"*"` opens the API to any origin.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::alerts::{self, AlertInput, AlertUpdate};
use crate::assistant::Assistant;
use crate::auth;
use crate::cache;
use crate::catalog;
use crate::config::Config;
use crate::db;
use crate::memory;
use crate::models::{AlertView, User, UserProfile};
use crate::notify::Notifier;
use crate::pipeline;
use crate::queries::{self, SavedQueryInput};
use crate::warehouse::{self, WarehouseClient};

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    warehouse: Arc<WarehouseClient>,
    assistant: Arc<Assistant>,
    notifier: Arc<Notifier>,
}

/// Starts the analytics API server.
///
/// Binds to the address configured in `[server].bind` and serves until the
/// process is terminated. The token-signing secret must be present in the
/// environment before startup.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    // Fail fast on missing secrets rather than on the first login request
    config.secret_key()?;

    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;
    crate::migrate::apply(&pool).await?;

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        warehouse: Arc::new(WarehouseClient::new(config)?),
        assistant: Arc::new(Assistant::new(config)?),
        notifier: Arc::new(Notifier::from_config(&config.notify)),
    };

    let cors = if config.server.cors_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origin = config
            .server
            .cors_origin
            .parse::<axum::http::HeaderValue>()?;
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route("/auth/me", get(handle_me))
        .route("/auth/logout", post(handle_logout))
        .route("/auth/users", get(handle_list_users))
        .route("/analytics/query", post(handle_query))
        .route(
            "/analytics/supplier-performance",
            get(handle_supplier_performance),
        )
        .route("/analytics/sales-forecast", get(handle_sales_forecast))
        .route("/analytics/schema", get(handle_schema))
        .route("/analytics/table/{name}", get(handle_table))
        .route("/analytics/history", get(handle_history))
        .route("/analytics/validate-sql", post(handle_validate_sql))
        .route("/analytics/dashboard", get(handle_dashboard))
        .route(
            "/queries/saved",
            post(handle_save_query).get(handle_list_saved),
        )
        .route(
            "/queries/saved/{id}",
            get(handle_get_saved)
                .put(handle_update_saved)
                .delete(handle_delete_saved),
        )
        .route("/queries/saved/{id}/execute", post(handle_execute_saved))
        .route("/queries/cache/stats", get(handle_cache_stats))
        .route("/queries/cache/clear", delete(handle_cache_clear))
        .route("/queries/templates", get(handle_templates))
        .route("/alerts", post(handle_create_alert).get(handle_list_alerts))
        .route(
            "/alerts/{id}",
            get(handle_get_alert)
                .put(handle_update_alert)
                .delete(handle_delete_alert),
        )
        .route("/alerts/{id}/test", post(handle_test_alert))
        .route("/alerts/{id}/history", get(handle_alert_history))
        .route("/alerts/check-all", post(handle_check_all))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "analytics API starting");
    println!("Analytics API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// Internal error type that converts into the JSON error contract.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn upstream(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

/// Map library errors onto the HTTP error contract by message shape, so
/// store/guard/upstream layers don't need their own HTTP error types.
fn classify_error(err: anyhow::Error) -> AppError {
    // `{:#}` keeps the context chain, so upstream causes stay matchable
    let msg = format!("{:#}", err);

    if msg.contains("not found") || msg.contains("Unknown user") {
        not_found(msg)
    } else if msg.contains("token") {
        unauthorized(msg)
    } else if msg.contains("Forbidden operation")
        || msg.contains("must start with")
        || msg.contains("Unmatched")
        || msg.contains("Invalid")
        || msg.contains("already registered")
        || msg.contains("must not be empty")
        || msg.contains("No fields to update")
        || msg.contains("Failed to generate SQL")
    {
        bad_request(msg)
    } else if msg.contains("Warehouse") || msg.contains("Assistant API") {
        upstream(msg)
    } else {
        internal(msg)
    }
}

// ============ Authentication helpers ============

/// Resolve the bearer token in `headers` to a user row.
async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Authorization header must be a Bearer token"))?;

    let secret = state
        .config
        .secret_key()
        .map_err(|e| internal(e.to_string()))?;

    let claims = auth::decode_token(&secret, token).map_err(|e| unauthorized(e.to_string()))?;

    auth::get_user_by_username(&state.pool, &claims.sub)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found("User not found"))
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let user = require_user(state, headers).await?;
    if !user.is_admin() {
        return Err(forbidden("Admin access required"));
    }
    Ok(user)
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ============ GET / and GET /health ============

async fn handle_root() -> Json<Value> {
    Json(json!({
        "service": "Conversant Analytics API",
        "status": "active",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": now_iso(),
    }))
}

/// Aggregate health. Always answers 200 so orchestration health checks can
/// distinguish "process up but dependencies degraded" from "process down";
/// the per-service booleans carry the detail.
async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let (warehouse_ok, assistant_ok) = tokio::join!(
        state.warehouse.test_connection(),
        state.assistant.test_connection(),
    );

    let status = if warehouse_ok && assistant_ok {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "services": {
            "warehouse": warehouse_ok,
            "assistant": assistant_ok,
            "api": "active",
        },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": now_iso(),
    }))
}

// ============ /auth ============

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    full_name: Option<String>,
}

async fn handle_register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<UserProfile>, AppError> {
    if !request.email.contains('@') {
        return Err(bad_request("Invalid email address"));
    }

    let user = auth::create_user(
        &state.pool,
        &request.username,
        &request.email,
        &request.password,
        request.full_name.as_deref(),
        "user",
    )
    .await
    .map_err(classify_error)?;

    Ok(Json(UserProfile::from(&user)))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn handle_login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, AppError> {
    let user = auth::authenticate(&state.pool, &request.username, &request.password)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| unauthorized("Incorrect username or password"))?;

    if !user.is_active {
        return Err(bad_request("Inactive user"));
    }

    auth::update_last_login(&state.pool, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let expiry_minutes = state.config.auth.token_expiry_minutes;
    let secret = state
        .config
        .secret_key()
        .map_err(|e| internal(e.to_string()))?;

    let access_token =
        auth::issue_token(&secret, &user, expiry_minutes).map_err(|e| internal(e.to_string()))?;

    let session_id = auth::record_session(&state.pool, user.id, expiry_minutes)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": expiry_minutes * 60,
        "session_id": session_id,
        "user": UserProfile::from(&user),
    })))
}

async fn handle_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, AppError> {
    let user = require_user(&state, &headers).await?;
    Ok(Json(UserProfile::from(&user)))
}

async fn handle_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;

    auth::deactivate_sessions(&state.pool, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(json!({ "message": "Successfully logged out" })))
}

async fn handle_list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserProfile>>, AppError> {
    require_admin(&state, &headers).await?;

    let users = auth::list_users(&state.pool)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(users.iter().map(UserProfile::from).collect()))
}

// ============ /analytics ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    session_id: Option<String>,
    #[serde(default = "default_true")]
    use_cache: bool,
}

fn default_true() -> bool {
    true
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Json<pipeline::QueryOutcome>, AppError> {
    let user = require_user(&state, &headers).await?;

    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let outcome = pipeline::execute_question(
        &state.config,
        &state.pool,
        &state.warehouse,
        &state.assistant,
        &user,
        &request.query,
        request.session_id,
        request.use_cache,
    )
    .await
    .map_err(classify_error)?;

    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct DaysParams {
    #[serde(default = "default_days")]
    days: u32,
}

fn default_days() -> u32 {
    30
}

async fn handle_supplier_performance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DaysParams>,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let result = state
        .warehouse
        .supplier_performance(&state.pool, params.days)
        .await
        .map_err(classify_error)?;

    let insights = state
        .assistant
        .insights(
            &result,
            &format!(
                "Supplier performance analysis for the last {} days",
                params.days
            ),
        )
        .await;

    Ok(Json(json!({
        "data": result.data,
        "metadata": result.metadata,
        "insights": insights,
        "period_days": params.days,
        "timestamp": now_iso(),
    })))
}

#[derive(Deserialize)]
struct MonthsParams {
    #[serde(default = "default_months")]
    months: u32,
}

fn default_months() -> u32 {
    12
}

async fn handle_sales_forecast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<MonthsParams>,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let result = state
        .warehouse
        .sales_history(&state.pool, params.months)
        .await
        .map_err(classify_error)?;

    let insights = state
        .assistant
        .insights(
            &result,
            &format!(
                "Historical sales data for the last {} months for forecasting",
                params.months
            ),
        )
        .await;

    Ok(Json(json!({
        "data": result.data,
        "metadata": result.metadata,
        "insights": insights,
        "period_months": params.months,
        "timestamp": now_iso(),
    })))
}

async fn handle_schema(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let tables = state
        .warehouse
        .table_info(&state.pool, None)
        .await
        .map_err(classify_error)?;

    Ok(Json(json!({
        "schema_context": catalog::prompt_context(),
        "tables": tables.data,
        "timestamp": now_iso(),
    })))
}

async fn handle_table(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let columns = state
        .warehouse
        .table_info(&state.pool, Some(&name))
        .await
        .map_err(classify_error)?;

    let sample = state
        .warehouse
        .sample_data(&state.pool, &name, 5)
        .await
        .map_err(classify_error)?;

    Ok(Json(json!({
        "table_name": name,
        "columns": columns.data,
        "sample_data": sample.data,
        "timestamp": now_iso(),
    })))
}

#[derive(Deserialize)]
struct HistoryParams {
    session_id: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

async fn handle_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;

    let entries = memory::history(
        &state.pool,
        user.id,
        params.session_id.as_deref(),
        params.limit,
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    let count = entries.len();
    Ok(Json(json!({
        "history": entries,
        "count": count,
        "timestamp": now_iso(),
    })))
}

#[derive(Deserialize)]
struct ValidateSqlRequest {
    sql_query: String,
}

async fn handle_validate_sql(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ValidateSqlRequest>,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let verdict = warehouse::validate_statement(&request.sql_query);

    let (is_valid, message) = match &verdict {
        Ok(()) => (true, "Valid query".to_string()),
        Err(e) => (false, e.to_string()),
    };

    let performance_analysis = if is_valid {
        Some(
            state
                .warehouse
                .analyze_performance(&state.pool, &request.sql_query)
                .await
                .unwrap_or_else(|e| json!({ "error": e.to_string() })),
        )
    } else {
        None
    };

    Ok(Json(json!({
        "is_valid": is_valid,
        "message": message,
        "performance_analysis": performance_analysis,
        "timestamp": now_iso(),
    })))
}

/// Headline metrics for the dashboard landing view. Failures are isolated
/// per metric so one broken statement doesn't blank the whole board.
async fn handle_dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let metrics: &[(&str, &str)] = &[
        ("total_orders", "SELECT COUNT(*) as count FROM ORDERS"),
        (
            "total_revenue",
            "SELECT SUM(TOTALPRICE) as revenue FROM ORDERS",
        ),
        (
            "active_suppliers",
            "SELECT COUNT(DISTINCT SUPPKEY) as count FROM LINEITEM \
             WHERE SHIPDATE >= DATEADD(month, -1, CURRENT_DATE)",
        ),
        (
            "top_customers",
            "SELECT COUNT(DISTINCT CUSTKEY) as count FROM ORDERS \
             WHERE ORDERDATE >= DATEADD(month, -1, CURRENT_DATE)",
        ),
    ];

    let mut dashboard = serde_json::Map::new();
    for (name, sql) in metrics {
        let value = match state.warehouse.execute(&state.pool, sql, true).await {
            Ok(result) => result.data.into_iter().next().unwrap_or_else(|| json!({})),
            Err(e) => json!({ "error": e.to_string() }),
        };
        dashboard.insert(name.to_string(), value);
    }

    Ok(Json(json!({
        "metrics": dashboard,
        "timestamp": now_iso(),
    })))
}

// ============ /queries ============

#[derive(Deserialize)]
struct SavedQueryRequest {
    name: String,
    sql_query: String,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl SavedQueryRequest {
    fn into_input(self) -> SavedQueryInput {
        SavedQueryInput {
            name: self.name,
            sql_query: self.sql_query,
            description: self.description,
            tags: self.tags,
        }
    }
}

async fn handle_save_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SavedQueryRequest>,
) -> Result<Json<crate::models::SavedQuery>, AppError> {
    let user = require_user(&state, &headers).await?;

    let saved = queries::save(&state.pool, user.id, &request.into_input())
        .await
        .map_err(classify_error)?;

    Ok(Json(saved))
}

async fn handle_list_saved(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::models::SavedQuery>>, AppError> {
    let user = require_user(&state, &headers).await?;

    let saved = queries::list(&state.pool, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(saved))
}

async fn handle_get_saved(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<crate::models::SavedQuery>, AppError> {
    let user = require_user(&state, &headers).await?;

    queries::get(&state.pool, id, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .map(Json)
        .ok_or_else(|| not_found("Saved query not found"))
}

async fn handle_update_saved(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(request): Json<SavedQueryRequest>,
) -> Result<Json<crate::models::SavedQuery>, AppError> {
    let user = require_user(&state, &headers).await?;

    queries::update(&state.pool, id, user.id, &request.into_input())
        .await
        .map_err(classify_error)?
        .map(Json)
        .ok_or_else(|| not_found("Saved query not found"))
}

async fn handle_delete_saved(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;

    let existed = queries::delete(&state.pool, id, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    if !existed {
        return Err(not_found("Saved query not found"));
    }

    Ok(Json(json!({ "message": "Saved query deleted successfully" })))
}

#[derive(Deserialize)]
struct ExecuteParams {
    #[serde(default = "default_true")]
    use_cache: bool,
}

async fn handle_execute_saved(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(params): Query<ExecuteParams>,
) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;

    let saved = queries::get(&state.pool, id, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found("Saved query not found"))?;

    let result = state
        .warehouse
        .execute(&state.pool, &saved.sql_query, params.use_cache)
        .await
        .map_err(classify_error)?;

    queries::record_execution(&state.pool, id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(json!({
        "query_id": id,
        "query_name": saved.name,
        "sql_query": saved.sql_query,
        "data": result.data,
        "metadata": result.metadata,
        "execution_time": result.execution_time,
        "from_cache": result.from_cache,
        "timestamp": now_iso(),
    })))
}

async fn handle_cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let stats = cache::stats(&state.pool)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(json!({
        "cache_stats": stats,
        "timestamp": now_iso(),
    })))
}

async fn handle_cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers).await?;

    let removed = cache::clear(&state.pool)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(json!({
        "message": "Query cache cleared successfully",
        "entries_removed": removed,
        "timestamp": now_iso(),
    })))
}

async fn handle_templates(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let templates = catalog::templates();
    let count = templates.len();

    Ok(Json(json!({
        "templates": templates,
        "count": count,
        "timestamp": now_iso(),
    })))
}

// ============ /alerts ============

#[derive(Deserialize)]
struct AlertCreateRequest {
    alert_name: String,
    metric: String,
    threshold_value: f64,
    condition: String,
    notification_method: String,
    sql_query: String,
}

async fn handle_create_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AlertCreateRequest>,
) -> Result<Json<AlertView>, AppError> {
    let user = require_user(&state, &headers).await?;

    let input = AlertInput {
        name: request.alert_name,
        metric: request.metric,
        threshold: request.threshold_value,
        condition: request.condition,
        notification_method: request.notification_method,
        sql_query: request.sql_query,
    };

    let alert = alerts::create(&state.pool, user.id, &input)
        .await
        .map_err(classify_error)?;

    Ok(Json(AlertView::from(&alert)))
}

async fn handle_list_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AlertView>>, AppError> {
    let user = require_user(&state, &headers).await?;

    let all = alerts::list(&state.pool, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(all.iter().map(AlertView::from).collect()))
}

async fn handle_get_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<AlertView>, AppError> {
    let user = require_user(&state, &headers).await?;

    alerts::get(&state.pool, id, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .map(|a| Json(AlertView::from(&a)))
        .ok_or_else(|| not_found("Alert not found"))
}

#[derive(Deserialize)]
struct AlertUpdateRequest {
    alert_name: Option<String>,
    threshold_value: Option<f64>,
    condition: Option<String>,
    notification_method: Option<String>,
    is_active: Option<bool>,
}

async fn handle_update_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(request): Json<AlertUpdateRequest>,
) -> Result<Json<AlertView>, AppError> {
    let user = require_user(&state, &headers).await?;

    let changes = AlertUpdate {
        name: request.alert_name,
        threshold: request.threshold_value,
        condition: request.condition,
        notification_method: request.notification_method,
        is_active: request.is_active,
    };

    alerts::update(&state.pool, id, user.id, &changes)
        .await
        .map_err(classify_error)?
        .map(|a| Json(AlertView::from(&a)))
        .ok_or_else(|| not_found("Alert not found"))
}

async fn handle_delete_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;

    let existed = alerts::delete(&state.pool, id, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    if !existed {
        return Err(not_found("Alert not found"));
    }

    Ok(Json(json!({ "message": "Alert deleted successfully" })))
}

async fn handle_test_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;

    let alert = alerts::get(&state.pool, id, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found("Alert not found"))?;

    let (condition_met, metric_value) = alerts::evaluate(&state.warehouse, &state.pool, &alert)
        .await
        .map_err(classify_error)?;

    let mut response = json!({
        "alert_id": id,
        "condition_met": condition_met,
        "metric_value": metric_value,
        "threshold_value": alert.threshold,
        "condition": alert.condition.as_str(),
        "timestamp": now_iso(),
    });

    if condition_met {
        let sent =
            alerts::process_trigger(&state.pool, &state.notifier, &alert, metric_value, &user)
                .await
                .map_err(|e| internal(e.to_string()))?;
        response["notification_sent"] = json!(sent);
    }

    Ok(Json(response))
}

#[derive(Deserialize)]
struct AlertHistoryParams {
    #[serde(default = "default_alert_history_limit")]
    limit: i64,
}

fn default_alert_history_limit() -> i64 {
    50
}

async fn handle_alert_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(params): Query<AlertHistoryParams>,
) -> Result<Json<Value>, AppError> {
    let user = require_user(&state, &headers).await?;

    if alerts::get(&state.pool, id, user.id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .is_none()
    {
        return Err(not_found("Alert not found"));
    }

    let entries = alerts::history(&state.pool, id, params.limit)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let count = entries.len();
    Ok(Json(json!({
        "alert_id": id,
        "history": entries,
        "count": count,
    })))
}

async fn handle_check_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let _user = require_user(&state, &headers).await?;

    let report = alerts::check_all(&state.pool, &state.warehouse, &state.notifier)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(json!({
        "checked_count": report.checked_count,
        "triggered_count": report.triggered_count,
        "results": report.results,
        "timestamp": now_iso(),
    })))
}
