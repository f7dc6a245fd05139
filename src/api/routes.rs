//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::{blocking, ApiError};
use crate::catalog::{NewProject, NewTestCase, ProjectUpdate, TestCaseUpdate};
use crate::error::CoreError;
use crate::lifecycle::{BatchRequest, Completion, ExecutionFilter, ExecutionStatus, NewExecution};

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok((StatusCode::OK, Json(json!({ "data": data }))))
}

fn created(data: Value) -> ApiResult {
    Ok((StatusCode::CREATED, Json(json!({ "data": data }))))
}

fn listing<T: serde::Serialize>(items: &[T]) -> ApiResult {
    Ok((
        StatusCode::OK,
        Json(json!({ "data": items, "meta": { "total": items.len() } })),
    ))
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<Value, ApiError> {
    serde_json::to_value(v).map_err(|e| ApiError::Internal(e.to_string()))
}

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/config/{key}", get(get_config).put(put_config))
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/test-cases", get(list_test_cases).post(create_test_case))
        .route(
            "/test-cases/{id}",
            get(get_test_case).put(update_test_case).delete(delete_test_case),
        )
        .route("/executions", get(list_executions).post(create_execution))
        .route("/executions/batch", post(create_batch))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/start", post(start_execution))
        .route("/executions/{id}/complete", post(complete_execution))
        .route("/executions/{id}/artifacts", get(execution_artifacts))
        .route("/batches/{batch_id}", get(get_batch))
        .route("/stats", get(stats))
        .route("/artifacts", get(list_artifacts))
        .route("/artifacts/{category}", post(upload_artifact))
}

async fn health(State(state): State<AppState>) -> ApiResult {
    let services = state.services.clone();
    let report = blocking(move || Ok(services.health())).await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "data": report,
            "meta": {
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "version": env!("CARGO_PKG_VERSION")
            }
        })),
    ))
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

async fn get_config(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    let services = state.services.clone();
    let lookup = key.clone();
    let value = blocking(move || Ok(services.resolver.resolve(&lookup, Value::Null))).await?;
    if value.is_null() {
        return Err(CoreError::not_found("config", key).into());
    }
    ok(json!({ "key": key, "value": value }))
}

#[derive(Debug, Deserialize)]
struct ConfigBody {
    value: Value,
}

async fn put_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<ConfigBody>,
) -> ApiResult {
    if key.trim().is_empty() {
        return Err(CoreError::validation("config key is empty").into());
    }
    let services = state.services.clone();
    let k = key.clone();
    let value = body.value.clone();
    blocking(move || services.resolver.set(&k, &value)).await?;
    ok(json!({ "key": key, "value": body.value }))
}

// ---------------------------------------------------------------------------
// Catalogs
// ---------------------------------------------------------------------------

async fn list_projects(State(state): State<AppState>) -> ApiResult {
    let services = state.services.clone();
    let projects = blocking(move || services.projects.list()).await?;
    listing(&projects)
}

async fn create_project(State(state): State<AppState>, Json(req): Json<NewProject>) -> ApiResult {
    let services = state.services.clone();
    let project = blocking(move || services.projects.create(&req)).await?;
    created(to_value(&project)?)
}

async fn get_project(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let services = state.services.clone();
    let project = blocking(move || services.projects.get(&id)).await?;
    ok(to_value(&project)?)
}

async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ProjectUpdate>,
) -> ApiResult {
    let services = state.services.clone();
    let project = blocking(move || services.projects.update(&id, &update)).await?;
    ok(to_value(&project)?)
}

async fn delete_project(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let services = state.services.clone();
    let deleted = id.clone();
    blocking(move || services.projects.delete(&id)).await?;
    ok(json!({ "id": deleted, "deleted": true }))
}

#[derive(Debug, Deserialize)]
struct SuiteQuery {
    suite: Option<String>,
}

async fn list_test_cases(State(state): State<AppState>, Query(q): Query<SuiteQuery>) -> ApiResult {
    let services = state.services.clone();
    let cases = blocking(move || match q.suite {
        Some(suite) => services.test_cases.list_suite(&suite),
        None => services.test_cases.list(),
    })
    .await?;
    listing(&cases)
}

async fn create_test_case(State(state): State<AppState>, Json(req): Json<NewTestCase>) -> ApiResult {
    let services = state.services.clone();
    let tc = blocking(move || services.test_cases.create(&req)).await?;
    created(to_value(&tc)?)
}

async fn get_test_case(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let services = state.services.clone();
    let tc = blocking(move || services.test_cases.get(id)).await?;
    ok(to_value(&tc)?)
}

async fn update_test_case(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<TestCaseUpdate>,
) -> ApiResult {
    let services = state.services.clone();
    let tc = blocking(move || services.test_cases.update(id, &update)).await?;
    ok(to_value(&tc)?)
}

async fn delete_test_case(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let services = state.services.clone();
    blocking(move || services.test_cases.delete(id)).await?;
    ok(json!({ "id": id, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecutionQuery {
    status: Option<String>,
    suite: Option<String>,
    project_id: Option<String>,
    limit: Option<usize>,
}

async fn list_executions(State(state): State<AppState>, Query(q): Query<ExecutionQuery>) -> ApiResult {
    let services = state.services.clone();
    let unfiltered =
        q.status.is_none() && q.suite.is_none() && q.project_id.is_none() && q.limit.is_none();
    let status = q
        .status
        .as_deref()
        .map(str::parse::<ExecutionStatus>)
        .transpose()?;
    let filter = ExecutionFilter {
        status,
        suite: q.suite,
        project_id: q.project_id,
        limit: q.limit,
    };
    let executions = blocking(move || {
        if unfiltered {
            services.lifecycle.list_recent()
        } else {
            services.lifecycle.list(&filter)
        }
    })
    .await?;
    listing(&executions)
}

async fn create_execution(State(state): State<AppState>, Json(req): Json<NewExecution>) -> ApiResult {
    let services = state.services.clone();
    let execution = blocking(move || services.lifecycle.create(&req)).await?;
    state.services.notify_created(vec![execution.clone()]);
    created(to_value(&execution)?)
}

async fn create_batch(State(state): State<AppState>, Json(req): Json<BatchRequest>) -> ApiResult {
    let services = state.services.clone();
    let (batch, executions) = blocking(move || {
        let batch = services.lifecycle.create_batch(&req)?;
        let executions = batch
            .execution_ids
            .iter()
            .map(|id| services.lifecycle.get(*id))
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok((batch, executions))
    })
    .await?;
    state.services.notify_created(executions);
    created(to_value(&batch)?)
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let services = state.services.clone();
    let execution = blocking(move || services.lifecycle.get(id)).await?;
    ok(to_value(&execution)?)
}

async fn start_execution(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let services = state.services.clone();
    let execution = blocking(move || services.lifecycle.start(id)).await?;
    ok(to_value(&execution)?)
}

async fn complete_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(completion): Json<Completion>,
) -> ApiResult {
    let services = state.services.clone();
    let (execution, url) = blocking(move || {
        let execution = services.lifecycle.complete(id, &completion)?;
        let url = execution
            .result_artifact
            .as_deref()
            .and_then(|path| services.writer.public_url_for(path));
        Ok((execution, url))
    })
    .await?;
    Ok((
        StatusCode::OK,
        Json(json!({ "data": to_value(&execution)?, "meta": { "result_url": url } })),
    ))
}

async fn execution_artifacts(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let services = state.services.clone();
    let records = blocking(move || {
        services.lifecycle.get(id)?;
        services.writer.records_for_execution(id)
    })
    .await?;
    ok(to_value(&records)?)
}

async fn get_batch(State(state): State<AppState>, Path(batch_id): Path<String>) -> ApiResult {
    let services = state.services.clone();
    let batch = blocking(move || services.lifecycle.get_batch(&batch_id)).await?;
    ok(to_value(&batch)?)
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    let services = state.services.clone();
    let stats = blocking(move || services.lifecycle.stats()).await?;
    ok(to_value(&stats)?)
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ArtifactUpload {
    execution_id: Option<i64>,
    payload: Value,
}

async fn upload_artifact(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Json(upload): Json<ArtifactUpload>,
) -> ApiResult {
    let services = state.services.clone();
    let (artifact, url) = blocking(move || {
        let artifact = match upload.execution_id {
            Some(id) => services
                .writer
                .write_for_execution(&category, id, &upload.payload)?,
            None => services.writer.write(&category, &upload.payload)?,
        };
        let url = services.writer.public_url(&artifact);
        Ok((artifact, url))
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": to_value(&artifact)?, "meta": { "url": url } })),
    ))
}

#[derive(Debug, Deserialize)]
struct ArtifactQuery {
    category: Option<String>,
    limit: Option<usize>,
}

async fn list_artifacts(State(state): State<AppState>, Query(q): Query<ArtifactQuery>) -> ApiResult {
    let services = state.services.clone();
    let records = blocking(move || match (q.category, q.limit) {
        (None, None) => services.writer.list_recent(),
        (category, limit) => services
            .writer
            .list_records(category.as_deref(), limit.unwrap_or(100).min(1000)),
    })
    .await?;
    listing(&records)
}
