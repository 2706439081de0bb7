use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    count_events, create_bucket, delete_bucket, export_all, export_bucket, get_bucket,
    get_events, health_check, heartbeat, info, list_buckets, post_events, query, AppState,
};
use crate::ingest::DEFAULT_PULSETIME;
use crate::storage::{PersistenceConfig, SnapshotManager, SnapshotWorker, StorageEngine};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Reported by `/api/0/info` and recorded on new buckets
    pub hostname: String,
    /// Snapshot directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    /// Threads evaluating query periods in parallel
    pub query_threads: usize,
    pub default_pulsetime: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5600,
            hostname: "localhost".to_string(),
            data_dir: None,
            snapshot_interval_secs: 300,
            query_threads: num_cpus::get(),
            default_pulsetime: DEFAULT_PULSETIME,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from `TIMEKEEP_*` environment variables.
    /// Unset or unparseable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("TIMEKEEP_HOST").unwrap_or(defaults.host);
        let port = std::env::var("TIMEKEEP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let hostname = std::env::var("TIMEKEEP_HOSTNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(defaults.hostname);
        let data_dir = std::env::var("TIMEKEEP_DATA_DIR")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);
        let snapshot_interval_secs = std::env::var("TIMEKEEP_SNAPSHOT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&s: &u64| s > 0)
            .unwrap_or(defaults.snapshot_interval_secs);
        let query_threads = std::env::var("TIMEKEEP_QUERY_THREADS")
            .ok()
            .and_then(|t| t.parse().ok())
            .filter(|&t: &usize| t > 0)
            .unwrap_or(defaults.query_threads);
        let default_pulsetime = std::env::var("TIMEKEEP_DEFAULT_PULSETIME")
            .ok()
            .and_then(|p| p.parse().ok())
            .filter(|p: &f64| p.is_finite() && *p >= 0.0)
            .unwrap_or(defaults.default_pulsetime);

        Self {
            host,
            port,
            hostname,
            data_dir,
            snapshot_interval_secs,
            query_threads,
            default_pulsetime,
        }
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/0/info", get(info))
        .route("/api/0/health", get(health_check))
        // Buckets
        .route("/api/0/buckets/", get(list_buckets))
        .route(
            "/api/0/buckets/:id",
            get(get_bucket).post(create_bucket).delete(delete_bucket),
        )
        // Events
        .route("/api/0/buckets/:id/events", get(get_events).post(post_events))
        .route("/api/0/buckets/:id/events/count", get(count_events))
        .route("/api/0/buckets/:id/heartbeat", post(heartbeat))
        // Query
        .route("/api/0/query", post(query))
        .route("/api/0/query/", post(query))
        // Export
        .route("/api/0/export", get(export_all))
        .route("/api/0/buckets/:id/export", get(export_bucket))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Arc::new(StorageEngine::with_hostname(config.hostname.clone()));

    // Restore the last snapshot and keep writing new ones
    let persistence = match &config.data_dir {
        Some(dir) => {
            let manager = Arc::new(SnapshotManager::new(
                PersistenceConfig::new(dir).with_snapshot_interval(config.snapshot_interval_secs),
            )?);
            match manager.restore_latest(&engine)? {
                Some(meta) => tracing::info!(
                    "Restored snapshot from {}: {} buckets, {} events",
                    meta.created_at,
                    meta.buckets,
                    meta.events
                ),
                None => tracing::info!("No snapshot found in {}", dir.display()),
            }

            let worker = Arc::new(SnapshotWorker::new(Arc::clone(&engine), Arc::clone(&manager)));
            let handle = Arc::clone(&worker).start();
            Some((manager, worker, handle))
        }
        None => {
            tracing::info!("No data directory configured, events are kept in memory only");
            None
        }
    };

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        default_pulsetime: config.default_pulsetime,
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting Timekeep server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some((manager, worker, handle)) = persistence {
        worker.stop();
        handle.abort();
        match manager.create_snapshot(&engine) {
            Ok(meta) => tracing::info!(
                "Final snapshot written: {} buckets, {} events",
                meta.buckets,
                meta.events
            ),
            Err(e) => tracing::error!("Final snapshot failed: {}", e),
        }
    }

    tracing::info!("Timekeep server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping server...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::util::ServiceExt;

    fn create_test_app() -> (Router, Arc<StorageEngine>) {
        let engine = Arc::new(StorageEngine::with_hostname("testhost"));
        let state = Arc::new(AppState::new(Arc::clone(&engine)));
        (build_router(state), engine)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let (app, _) = create_test_app();

        let (status, body) = send(&app, "GET", "/api/0/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["buckets"], json!(0));

        let (status, body) = send(&app, "GET", "/api/0/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hostname"], json!("testhost"));
        assert_eq!(body["device_id"], json!("testhost"));
        assert_eq!(body["testing"], json!(false));
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let (app, _) = create_test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/api/0/buckets/aw-watcher-window_testhost",
            Some(json!({"type": "currentwindow", "client": "aw-watcher-window"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], json!("currentwindow"));
        assert_eq!(body["hostname"], json!("testhost"));

        // Placeholder metadata does not overwrite
        let (_, body) = send(
            &app,
            "POST",
            "/api/0/buckets/aw-watcher-window_testhost",
            Some(json!({"type": "unknown"})),
        )
        .await;
        assert_eq!(body["type"], json!("currentwindow"));

        let (status, body) = send(&app, "GET", "/api/0/buckets/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("aw-watcher-window_testhost").is_some());

        let (status, _) = send(&app, "DELETE", "/api/0/buckets/aw-watcher-window_testhost", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/api/0/buckets/aw-watcher-window_testhost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let (status, _) = send(&app, "DELETE", "/api/0/buckets/aw-watcher-window_testhost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_and_list_events() {
        let (app, _) = create_test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/api/0/buckets/w/events",
            Some(json!([
                {"timestamp": "2024-03-01T10:00:00Z", "duration": 60, "data": {"app": "A"}},
                {"timestamp": "2024-03-01T10:05:00Z", "duration": 120, "data": {"app": "B"}},
                {"timestamp": "2024-03-01T10:10:00Z", "duration": 30, "data": {"app": "C"}}
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.as_array().unwrap().len(), 3);

        let (status, body) = send(
            &app,
            "POST",
            "/api/0/buckets/w/events",
            Some(json!({"timestamp": "2024-03-01T10:15:00Z", "data": {"app": "D"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body[0]["duration"], json!(0.0));

        let (_, body) = send(&app, "GET", "/api/0/buckets/w/events/count", None).await;
        assert_eq!(body["count"], json!(4));

        let (status, body) = send(&app, "GET", "/api/0/buckets/w/events?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        let events = body.as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["data"]["app"], json!("D"));

        let (_, body) = send(
            &app,
            "GET",
            "/api/0/buckets/w/events?start=2024-03-01T10:05:00Z&end=2024-03-01T10:10:00Z",
            None,
        )
        .await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, _) = send(&app, "GET", "/api/0/buckets/missing/events", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat_merges() {
        let (app, engine) = create_test_app();
        let uri = "/api/0/buckets/aw-watcher-afk_testhost/heartbeat?pulsetime=60";

        for ts in ["2024-03-01T10:00:00Z", "2024-03-01T10:00:30Z", "2024-03-01T10:01:15Z"] {
            let (status, _) = send(
                &app,
                "POST",
                uri,
                Some(json!({"timestamp": ts, "data": {"status": "not-afk"}})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, body) = send(
            &app,
            "POST",
            uri,
            Some(json!({"timestamp": "2024-03-01T10:01:20Z", "data": {"status": "afk"}})),
        )
        .await;
        assert_eq!(body["duration"], json!(0.0));

        let events = engine.export_bucket("aw-watcher-afk_testhost").unwrap().1;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].duration, 75.0);
    }

    #[tokio::test]
    async fn test_query_endpoint() {
        let (app, _) = create_test_app();

        send(
            &app,
            "POST",
            "/api/0/buckets/w/events",
            Some(json!([
                {"timestamp": "2024-03-01T10:00:00Z", "duration": 60, "data": {"app": "A"}},
                {"timestamp": "2024-03-01T10:05:00Z", "duration": 120, "data": {"app": "B"}}
            ])),
        )
        .await;
        send(
            &app,
            "POST",
            "/api/0/buckets/afk/events",
            Some(json!({"timestamp": "2024-03-01T10:00:00Z", "duration": 300, "data": {"status": "not-afk"}})),
        )
        .await;

        let request = json!({
            "timeperiods": [
                "2024-03-01T00:00:00Z/2024-03-02T00:00:00Z",
                "2024-02-01T00:00:00Z/2024-02-02T00:00:00Z"
            ],
            "query": [
                "events = query_bucket(\"w\");",
                "not_afk = filter_keyvals(query_bucket(\"afk\"), \"status\", [\"not-afk\"]);",
                "events = filter_period_intersect(events, not_afk);",
                "RETURN = {\"total\": sum_durations(events), \"apps\": merge_events_by_keys(events, [\"app\"])};"
            ]
        });

        let (status, body) = send(&app, "POST", "/api/0/query/", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["total"], json!(180.0));
        assert_eq!(results[0]["apps"].as_array().unwrap().len(), 2);
        assert_eq!(results[1]["total"], json!(0.0));
    }

    #[tokio::test]
    async fn test_query_content_errors_still_succeed() {
        let (app, _) = create_test_app();
        let request = json!({
            "timeperiods": ["not a period"],
            "query": "x = unknown_fn(y);\nRETURN = x;"
        });

        let (status, body) = send(&app, "POST", "/api/0/query", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([[]]));
    }

    #[tokio::test]
    async fn test_export() {
        let (app, _) = create_test_app();
        send(
            &app,
            "POST",
            "/api/0/buckets/w/events",
            Some(json!({"timestamp": "2024-03-01T10:00:00Z", "duration": 1, "data": {}})),
        )
        .await;

        let (status, body) = send(&app, "GET", "/api/0/export", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["buckets"]["w"]["bucket"]["id"], json!("w"));
        assert_eq!(body["buckets"]["w"]["events"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", "/api/0/buckets/w/export", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["events"][0]["timestamp"], json!("2024-03-01T10:00:00Z"));

        let (status, _) = send(&app, "GET", "/api/0/buckets/missing/export", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, engine) = create_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/api/0/buckets/w/events")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());

        let (status, body) = send(
            &app,
            "POST",
            "/api/0/query",
            Some(json!({"timeperiods": "2024-03-01/2024-03-02"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, "POST", "/api/0/buckets/w/heartbeat", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(engine.bucket_count(), 0);
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5600);
        assert!(config.data_dir.is_none());
        assert_eq!(config.default_pulsetime, DEFAULT_PULSETIME);
        assert!(config.query_threads > 0);
    }
}
