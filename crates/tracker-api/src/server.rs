//! Axum server and routes.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracker_types::{
    snapshot_from_value, AuditOrder, AuditQuery, AuditRecord, BaseResponse, ImportRequest,
    KeyRequest, MutationContext, Operation, Snapshot, StoreError, TableSchema, TrackerStore,
    UpdateRequest, UpsertSummary,
};
use uuid::Uuid;

/// Header carrying the acting user, copied into `changed_by`.
pub const ACTOR_HEADER: &str = "x-actor";

pub struct AppState {
    pub store: Arc<dyn TrackerStore>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/tables", get(handle_tables))
        .route("/entities/:table", post(handle_insert).get(handle_list))
        .route("/entities/:table/get", post(handle_get))
        .route("/entities/:table/update", post(handle_update))
        .route("/entities/:table/delete", post(handle_delete))
        .route("/entities/:table/import", post(handle_import))
        .route("/audit/logs", get(handle_audit_logs))
        .route("/audit/logs/:table/:identifier", get(handle_record_history))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type Reply<T> = (StatusCode, Json<BaseResponse<T>>);

fn ok<T>(data: T) -> Reply<T> {
    (StatusCode::OK, Json(BaseResponse::ok(data)))
}

fn fail<T>(status: StatusCode, message: impl Into<String>) -> Reply<T> {
    (
        status,
        Json(BaseResponse::error(i32::from(status.as_u16()), message)),
    )
}

fn status_for(err: &StoreError) -> StatusCode {
    match err {
        StoreError::UnknownTable(_) | StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::BadRequest(_) | StoreError::Audit(_) => StatusCode::BAD_REQUEST,
        StoreError::AuditStore(_) | StoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_fail<T>(err: StoreError) -> Reply<T> {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "store failure");
    }
    fail(status, err.to_string())
}

/// Mutation context for one request: actor from the header, a fresh request id in metadata.
fn request_context(headers: &HeaderMap) -> MutationContext {
    let changed_by = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);
    MutationContext {
        changed_by,
        metadata: Some(serde_json::json!({ "request_id": Uuid::new_v4().to_string() })),
    }
}

fn snapshot<T>(value: serde_json::Value) -> Result<Snapshot, Reply<T>> {
    snapshot_from_value(value).map_err(|e| fail(StatusCode::BAD_REQUEST, e.to_string()))
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_tables(State(state): State<Arc<AppState>>) -> Reply<Vec<TableSchema>> {
    ok(state.store.tables())
}

async fn handle_insert(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Reply<AuditRecord> {
    let row = match snapshot(body) {
        Ok(r) => r,
        Err(reply) => return reply,
    };
    let ctx = request_context(&headers);
    match state.store.insert(&table, row, &ctx).await {
        Ok(record) => {
            tracing::info!(entity_type = %table, audit_id = record.id, "row inserted");
            ok(record)
        }
        Err(e) => store_fail(e),
    }
}

async fn handle_list(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> Reply<Vec<Snapshot>> {
    match state.store.list(&table).await {
        Ok(rows) => ok(rows),
        Err(e) => store_fail(e),
    }
}

async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Json(req): Json<KeyRequest>,
) -> Reply<Snapshot> {
    let key = match snapshot(req.key) {
        Ok(k) => k,
        Err(reply) => return reply,
    };
    match state.store.get(&table, &key).await {
        Ok(Some(row)) => ok(row),
        Ok(None) => fail(StatusCode::NOT_FOUND, format!("no {} row with that key", table)),
        Err(e) => store_fail(e),
    }
}

async fn handle_update(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateRequest>,
) -> Reply<AuditRecord> {
    let (key, changes) = match (snapshot(req.key), snapshot(req.changes)) {
        (Ok(k), Ok(c)) => (k, c),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    let ctx = request_context(&headers);
    match state.store.update(&table, &key, changes, &ctx).await {
        Ok(record) => {
            tracing::info!(entity_type = %table, audit_id = record.id, "row updated");
            ok(record)
        }
        Err(e) => store_fail(e),
    }
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(req): Json<KeyRequest>,
) -> Reply<AuditRecord> {
    let key = match snapshot(req.key) {
        Ok(k) => k,
        Err(reply) => return reply,
    };
    let ctx = request_context(&headers);
    match state.store.delete(&table, &key, &ctx).await {
        Ok(record) => {
            tracing::info!(entity_type = %table, audit_id = record.id, "row deleted");
            ok(record)
        }
        Err(e) => store_fail(e),
    }
}

async fn handle_import(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ImportRequest>,
) -> Reply<UpsertSummary> {
    let mut rows = Vec::with_capacity(req.rows.len());
    for (i, value) in req.rows.into_iter().enumerate() {
        match snapshot_from_value(value) {
            Ok(row) => rows.push(row),
            Err(e) => return fail(StatusCode::BAD_REQUEST, format!("row {}: {}", i, e)),
        }
    }
    let ctx = request_context(&headers);
    match state
        .store
        .bulk_upsert(&table, rows, req.mode, req.match_fields.as_deref(), &ctx)
        .await
    {
        Ok(summary) => ok(summary),
        Err(e) => store_fail(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub record_identifier: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

fn parse_time(name: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, String> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("{} must be an RFC 3339 timestamp: {}", name, e))
        })
        .transpose()
}

impl AuditLogQuery {
    fn into_query(self) -> Result<AuditQuery, String> {
        let operation = self
            .operation
            .map(|op| op.parse::<Operation>())
            .transpose()
            .map_err(|e| e.to_string())?;
        let order = match self.order.as_deref() {
            None | Some("id_desc") => AuditOrder::IdDesc,
            Some("timestamp_desc") => AuditOrder::TimestampDesc,
            Some(other) => return Err(format!("unknown order: {}", other)),
        };
        Ok(AuditQuery {
            entity_type: self.entity_type,
            operation,
            record_identifier: self.record_identifier,
            since: parse_time("since", self.since)?,
            until: parse_time("until", self.until)?,
            order,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

async fn handle_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AuditLogQuery>,
) -> Reply<Vec<AuditRecord>> {
    let query = match q.into_query() {
        Ok(query) => query,
        Err(msg) => return fail(StatusCode::BAD_REQUEST, msg),
    };
    run_audit_query(&state, &query).await
}

async fn handle_record_history(
    State(state): State<Arc<AppState>>,
    Path((table, identifier)): Path<(String, String)>,
) -> Reply<Vec<AuditRecord>> {
    run_audit_query(&state, &AuditQuery::for_record(table, identifier)).await
}

async fn run_audit_query(state: &AppState, query: &AuditQuery) -> Reply<Vec<AuditRecord>> {
    match state.store.query(query).await {
        Ok(records) => ok(records),
        Err(e) => store_fail(StoreError::from(e)),
    }
}
