//! API layer -- axum routes, handlers, and error mapping.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use self::state::AppState;
use crate::error::CoreError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Handler error: an engine error, or the blocking worker itself failing.
#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

pub fn status_for(e: &CoreError) -> StatusCode {
    match e {
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::InvalidState { .. } => StatusCode::CONFLICT,
        CoreError::StoreUnavailable { .. } | CoreError::OrphanArtifact { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoreError::PartialBatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind(e: &CoreError) -> &'static str {
    match e {
        CoreError::NotFound { .. } => "not_found",
        CoreError::Validation(_) => "validation",
        CoreError::InvalidState { .. } => "invalid_state",
        CoreError::StoreUnavailable { .. } => "store_unavailable",
        CoreError::OrphanArtifact { .. } => "orphan_artifact",
        CoreError::PartialBatch { .. } => "partial_batch",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Core(e) => {
                let status = status_for(&e);
                let mut body = json!({
                    "error": { "kind": kind(&e), "message": e.to_string() }
                });
                match &e {
                    CoreError::PartialBatch { created_ids, .. } => {
                        body["error"]["created_ids"] = json!(created_ids);
                    }
                    CoreError::OrphanArtifact { bucket, path, .. } => {
                        body["error"]["bucket"] = json!(bucket);
                        body["error"]["path"] = json!(path);
                    }
                    CoreError::StoreUnavailable { store, .. } => {
                        body["error"]["store"] = json!(store);
                    }
                    _ => {}
                }
                (status, Json(body)).into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "request worker failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": { "kind": "internal", "message": msg } })),
                )
                    .into_response()
            }
        }
    }
}

/// Run a blocking engine call off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::objects::MemoryObjectStore;
    use crate::service::Services;
    use crate::settings::Settings;
    use crate::storage::temp_store;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (tempfile::TempDir, Router) {
        let (dir, store) = temp_store();
        let services = Services::assemble(
            &Settings::default(),
            store,
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryObjectStore::new()),
        )
        .unwrap();
        (dir, router(AppState::new(services)))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&CoreError::not_found("execution", 1)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&CoreError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&CoreError::kv("down")), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&CoreError::InvalidState {
                kind: "execution",
                id: "1".into(),
                current: "passed".into(),
                action: "start",
            }),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app();
        let (status, body) = call(&app, Method::GET, "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_execution_flow_over_http() {
        let (_dir, app) = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/executions",
            Some(json!({"test_case_id": 1, "suite": "smoke"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, _) = call(&app, Method::POST, &format!("/api/v1/executions/{id}/start"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::POST, &format!("/api/v1/executions/{id}/start"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "invalid_state");

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/executions/{id}/complete"),
            Some(json!({"outcome": "passed", "result": {"ok": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "passed");
        // The in-memory store serves nothing over HTTP.
        assert!(body["meta"]["result_url"].is_null());

        let (_, body) = call(&app, Method::GET, "/api/v1/stats", None).await;
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["success_rate"], 100.0);

        let (status, body) = call(&app, Method::GET, &format!("/api/v1/executions/{id}/artifacts"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["category"], "executions");
    }

    #[tokio::test]
    async fn test_validation_and_not_found() {
        let (_dir, app) = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/executions",
            Some(json!({"test_case_id": 1, "suite": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::GET, "/api/v1/executions/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/api/v1/config/unknown_key", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/api/v1/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_partial_batch_reports_created_ids() {
        let (_dir, app) = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/executions/batch",
            Some(json!({"test_case_ids": [1, 0, 3], "suite": "regression"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["kind"], "partial_batch");
        assert_eq!(body["error"]["created_ids"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let (_dir, app) = app();
        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/v1/config/storage_paths",
            Some(json!({"value": {"evidence": "evidence"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::GET, "/api/v1/config/storage_paths", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["value"]["evidence"], "evidence");
    }

    #[tokio::test]
    async fn test_catalog_and_artifacts() {
        let (_dir, app) = app();
        let (status, body) = call(&app, Method::POST, "/api/v1/projects", Some(json!({"name": "web"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let pid = body["data"]["id"].as_str().unwrap().to_string();
        let (status, _) = call(&app, Method::GET, &format!("/api/v1/projects/{pid}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/v1/projects", None).await;
        assert_eq!(body["meta"]["total"], 1);

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/test-cases",
            Some(json!({"title": "Login", "suite": "auth"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, body) = call(&app, Method::GET, "/api/v1/test-cases?suite=auth", None).await;
        assert_eq!(body["meta"]["total"], 1);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/artifacts/evidence",
            Some(json!({"execution_id": 99, "payload": {"log": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{body}");

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/artifacts/reports",
            Some(json!({"payload": {"summary": "ok"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, body) = call(&app, Method::GET, "/api/v1/artifacts", None).await;
        assert_eq!(body["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn test_project_update_and_delete_refresh_listing() {
        let (_dir, app) = app();
        let (_, body) = call(&app, Method::POST, "/api/v1/projects", Some(json!({"name": "web"}))).await;
        let pid = body["data"]["id"].as_str().unwrap().to_string();
        let (_, body) = call(&app, Method::GET, "/api/v1/projects", None).await;
        assert_eq!(body["data"][0]["name"], "web");

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/api/v1/projects/{pid}"),
            Some(json!({"name": "web-portal", "status": "archived"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let (_, body) = call(&app, Method::GET, "/api/v1/projects", None).await;
        assert_eq!(body["data"][0]["name"], "web-portal");
        assert_eq!(body["data"][0]["status"], "archived");

        let (status, _) = call(&app, Method::DELETE, &format!("/api/v1/projects/{pid}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/v1/projects", None).await;
        assert_eq!(body["meta"]["total"], 0);
        let (status, _) = call(&app, Method::GET, &format!("/api/v1/projects/{pid}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_test_case_crud_refreshes_listing() {
        let (_dir, app) = app();
        let (_, body) = call(
            &app,
            Method::POST,
            "/api/v1/test-cases",
            Some(json!({"title": "Login", "suite": "auth"})),
        )
        .await;
        let id = body["data"]["id"].as_i64().unwrap();
        let (_, body) = call(&app, Method::GET, "/api/v1/test-cases", None).await;
        assert_eq!(body["data"][0]["priority"], "medium");

        let (status, body) = call(&app, Method::GET, &format!("/api/v1/test-cases/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["title"], "Login");

        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/api/v1/test-cases/{id}"),
            Some(json!({"title": "Login with SSO", "priority": "high"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/v1/test-cases", None).await;
        assert_eq!(body["data"][0]["title"], "Login with SSO");
        assert_eq!(body["data"][0]["priority"], "high");

        let (status, _) = call(&app, Method::DELETE, &format!("/api/v1/test-cases/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/v1/test-cases", None).await;
        assert_eq!(body["meta"]["total"], 0);
        let (status, _) = call(&app, Method::GET, &format!("/api/v1/test-cases/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
