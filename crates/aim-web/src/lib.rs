//! JSON control-plane and read API for the asset inventory mirror.
//!
//! Sync triggers are fire-and-forget: the handler acknowledges immediately
//! and the run outcome is observable via logs and `/scheduler/status`.

use std::sync::Arc;

use aim_core::{AssetRecord, SyncScope, UserRecord};
use aim_sync::{CircuitState, SyncScheduler};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "aim-web";

#[derive(Clone)]
pub struct AppState {
    /// Absent when the process runs without a mirror database; the listing
    /// endpoints answer 503 in that case, the sync endpoints are unaffected.
    pub pool: Option<PgPool>,
    pub scheduler: Arc<SyncScheduler>,
}

impl AppState {
    pub fn new(pool: Option<PgPool>, scheduler: Arc<SyncScheduler>) -> Self {
        Self { pool, scheduler }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListingQuery {
    page: Option<usize>,
    per_page: Option<usize>,
}

impl ListingQuery {
    fn limits(&self) -> (i64, i64) {
        let per_page = self.per_page.unwrap_or(50).clamp(1, 500) as i64;
        let page = self.page.unwrap_or(1).max(1) as i64;
        (per_page, (page - 1) * per_page)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(sync_all_handler))
        .route("/sync/assets", post(sync_assets_handler))
        .route("/sync/users", post(sync_users_handler))
        .route("/sync/now", post(sync_now_handler))
        .route("/scheduler/start", post(scheduler_start_handler))
        .route("/scheduler/stop", post(scheduler_stop_handler))
        .route("/scheduler/status", get(scheduler_status_handler))
        .route("/assets", get(assets_handler))
        .route("/users", get(users_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn accepted(scope: SyncScope) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "scheduled", "scope": scope })),
    )
        .into_response()
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    state.scheduler.trigger_now(SyncScope::All);
    accepted(SyncScope::All)
}

async fn sync_assets_handler(State(state): State<Arc<AppState>>) -> Response {
    state.scheduler.trigger_now(SyncScope::Assets);
    accepted(SyncScope::Assets)
}

async fn sync_users_handler(State(state): State<Arc<AppState>>) -> Response {
    state.scheduler.trigger_now(SyncScope::Users);
    accepted(SyncScope::Users)
}

async fn sync_now_handler(State(state): State<Arc<AppState>>) -> Response {
    state.scheduler.trigger_now(SyncScope::All);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "triggered" })),
    )
        .into_response()
}

async fn scheduler_start_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.start().await {
        Ok(()) => Json(serde_json::json!({ "status": "started" })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn scheduler_stop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.stop().await {
        Ok(()) => Json(serde_json::json!({ "status": "stopped" })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let service = state.scheduler.service();
    let breaker = match service.breaker_state() {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half-open",
    };
    let next_runs = if state.scheduler.is_started() {
        state
            .scheduler
            .next_run_times(4)
            .into_iter()
            .map(|t| t.to_rfc3339())
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };
    Json(serde_json::json!({
        "scheduler_running": state.scheduler.is_started(),
        "sync_in_progress": service.is_running(),
        "circuit": breaker,
        "next_runs": next_runs,
        "last_report": service.last_report(),
    }))
    .into_response()
}

async fn assets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    let Some(pool) = &state.pool else {
        return no_database();
    };
    let (limit, offset) = query.limits();
    match load_assets(pool, limit, offset).await {
        Ok(rows) => Json(serde_json::json!({ "count": rows.len(), "rows": rows })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn users_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    let Some(pool) = &state.pool else {
        return no_database();
    };
    let (limit, offset) = query.limits();
    match load_users(pool, limit, offset).await {
        Ok(rows) => Json(serde_json::json!({ "count": rows.len(), "rows": rows })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let database = match &state.pool {
        Some(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
        None => false,
    };
    Json(serde_json::json!({ "status": "ok", "database": database })).into_response()
}

fn no_database() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "mirror database is not configured" })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn load_assets(pool: &PgPool, limit: i64, offset: i64) -> anyhow::Result<Vec<AssetRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, asset_name, asset_tag, serial, model, model_no, status,
               category, manufacturer, location, company, department,
               assigned_user, warranty_months, warranty_expires, created_at
          FROM assets
         ORDER BY asset_name, id
         LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(AssetRecord {
            id: row.try_get("id")?,
            asset_name: row.try_get("asset_name")?,
            asset_tag: row.try_get("asset_tag")?,
            serial: row.try_get("serial")?,
            model: row.try_get("model")?,
            model_no: row.try_get("model_no")?,
            status: row.try_get("status")?,
            category: row.try_get("category")?,
            manufacturer: row.try_get("manufacturer")?,
            location: row.try_get("location")?,
            company: row.try_get("company")?,
            department: row.try_get("department")?,
            assigned_user: row.try_get("assigned_user")?,
            warranty_months: row.try_get("warranty_months")?,
            warranty_expires: row.try_get("warranty_expires")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

async fn load_users(pool: &PgPool, limit: i64, offset: i64) -> anyhow::Result<Vec<UserRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, first_name, last_name, username, email, region,
               department_id, department_name, location_id, assets_count,
               license_count
          FROM users
         ORDER BY last_name, first_name, id
         LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(UserRecord {
            id: row.try_get("id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            region: row.try_get("region")?,
            department_id: row.try_get("department_id")?,
            department_name: row.try_get("department_name")?,
            location_id: row.try_get("location_id")?,
            assets_count: row.try_get("assets_count")?,
            license_count: row.try_get("license_count")?,
        });
    }
    Ok(out)
}
