use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::{parse_instant, Bucket, BucketConfig, Event, EventInput, Value};
use crate::ingest::{heartbeat as merge_heartbeat, HeartbeatError, DEFAULT_PULSETIME};
use crate::query::{run_query, QueryError};
use crate::storage::{StorageEngine, StoreError};

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<StorageEngine>,
    /// Pulse window for heartbeats that do not pass `pulsetime`
    pub default_pulsetime: f64,
}

impl AppState {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            default_pulsetime: DEFAULT_PULSETIME,
        }
    }
}

// ============================================================================
// Server Info
// ============================================================================

#[derive(Serialize)]
pub struct InfoResponse {
    pub hostname: String,
    pub version: &'static str,
    pub testing: bool,
    pub device_id: String,
}

pub async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let hostname = state.engine.hostname().to_string();
    Json(InfoResponse {
        device_id: hostname.clone(),
        hostname,
        version: env!("CARGO_PKG_VERSION"),
        testing: false,
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub buckets: usize,
    pub events: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        buckets: state.engine.bucket_count(),
        events: state.engine.total_events(),
    })
}

// ============================================================================
// Buckets
// ============================================================================

pub async fn list_buckets(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, Bucket>> {
    let buckets = state
        .engine
        .export_all()
        .into_iter()
        .map(|(bucket, _)| (bucket.id.clone(), bucket))
        .collect();
    Json(buckets)
}

pub async fn get_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
) -> Result<Json<Bucket>, ApiError> {
    state
        .engine
        .get_bucket(&bucket_id)
        .map(Json)
        .ok_or_else(|| bucket_not_found(&bucket_id))
}

pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
    body: Result<Json<BucketConfig>, JsonRejection>,
) -> Result<Json<Bucket>, ApiError> {
    let Json(config) = body?;
    Ok(Json(state.engine.create_or_update_bucket(&bucket_id, config)))
}

pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.delete_bucket(&bucket_id)?;
    Ok(Json(serde_json::json!({ "deleted": bucket_id })))
}

// ============================================================================
// Events
// ============================================================================

const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    /// Negative means unlimited
    pub limit: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
}

pub async fn get_events(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let limit = match params.limit {
        None => DEFAULT_EVENT_LIMIT,
        Some(n) if n < 0 => usize::MAX,
        Some(n) => n as usize,
    };
    let start = params.start.as_deref().and_then(parse_instant);
    let end = params.end.as_deref().and_then(parse_instant);

    let events = state.engine.latest_events(&bucket_id, limit, start, end)?;
    Ok(Json(events))
}

/// A single event or a list of events
#[derive(Deserialize)]
#[serde(untagged)]
pub enum EventsPayload {
    Many(Vec<EventInput>),
    One(EventInput),
}

pub async fn post_events(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
    body: Result<Json<EventsPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<Vec<Event>>), ApiError> {
    let Json(payload) = body?;
    let inputs = match payload {
        EventsPayload::Many(inputs) => inputs,
        EventsPayload::One(input) => vec![input],
    };
    let events = inputs.into_iter().map(EventInput::into_event).collect();
    let stored = state.engine.upsert_events(&bucket_id, events);
    tracing::debug!("Inserted {} events into {}", stored.len(), bucket_id);
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Serialize)]
pub struct CountResponse {
    pub count: usize,
}

pub async fn count_events(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    if state.engine.get_bucket(&bucket_id).is_none() {
        return Err(bucket_not_found(&bucket_id));
    }
    Ok(Json(CountResponse {
        count: state.engine.event_count(&bucket_id),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatParams {
    pub pulsetime: Option<f64>,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
    Query(params): Query<HeartbeatParams>,
    body: Result<Json<EventInput>, JsonRejection>,
) -> Result<Json<Event>, ApiError> {
    let Json(input) = body?;
    let pulsetime = params.pulsetime.unwrap_or(state.default_pulsetime);
    let event = merge_heartbeat(state.engine.as_ref(), &bucket_id, input.into_event(), pulsetime)?;
    Ok(Json(event))
}

// ============================================================================
// Query
// ============================================================================

/// Query statements, as a list of lines or one block of text
#[derive(Deserialize)]
#[serde(untagged)]
pub enum QueryText {
    Lines(Vec<String>),
    Text(String),
}

impl QueryText {
    fn into_lines(self) -> Vec<String> {
        match self {
            QueryText::Lines(lines) => lines,
            QueryText::Text(text) => text.lines().map(str::to_string).collect(),
        }
    }
}

#[derive(Deserialize)]
pub struct QueryRequest {
    pub timeperiods: Vec<String>,
    pub query: QueryText,
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let Json(request) = body?;
    let engine = Arc::clone(&state.engine);
    let timeperiods = request.timeperiods;
    let lines = request.query.into_lines();

    let results = tokio::task::spawn_blocking(move || {
        run_query(engine.as_ref(), &timeperiods, &lines)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Query task failed: {}", e)))??;

    Ok(Json(results))
}

// ============================================================================
// Export
// ============================================================================

#[derive(Serialize)]
pub struct BucketExport {
    pub bucket: Bucket,
    pub events: Vec<Event>,
}

#[derive(Serialize)]
pub struct ExportResponse {
    pub buckets: BTreeMap<String, BucketExport>,
}

pub async fn export_all(State(state): State<Arc<AppState>>) -> Json<ExportResponse> {
    let buckets = state
        .engine
        .export_all()
        .into_iter()
        .map(|(bucket, events)| (bucket.id.clone(), BucketExport { bucket, events }))
        .collect();
    Json(ExportResponse { buckets })
}

pub async fn export_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket_id): Path<String>,
) -> Result<Json<BucketExport>, ApiError> {
    let (bucket, events) = state.engine.export_bucket(&bucket_id)?;
    Ok(Json(BucketExport { bucket, events }))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    /// Body missing, not JSON, or of the wrong shape
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

fn bucket_not_found(bucket_id: &str) -> ApiError {
    ApiError::NotFound(format!("Bucket '{}' not found", bucket_id))
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BucketNotFound(id) => bucket_not_found(&id),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<HeartbeatError> for ApiError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::Store(e) => e.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => {
                tracing::error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
