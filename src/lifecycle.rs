//! Execution lifecycle: `queued → running → {passed, failed, skipped, error}`.
//!
//! Transitions are compare-and-set against the `executions` table, so two
//! processes racing on the same execution cannot both win. Completing an
//! execution writes its result payload as a durable artifact inside the same
//! transaction that records the outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{self, ArtifactRef, DurableArtifactWriter};
use crate::cache::{CacheAsideCollection, CachePolicy};
use crate::error::{CoreError, Result};
use crate::kv::KeyValueStore;
use crate::storage::{self, SqliteStore};

/// Artifact category for completed-execution payloads.
pub const RESULTS_CATEGORY: &str = "executions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Skipped,
    Error,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Queued,
        ExecutionStatus::Running,
        ExecutionStatus::Passed,
        ExecutionStatus::Failed,
        ExecutionStatus::Skipped,
        ExecutionStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Queued | ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::validation(format!("unknown execution status: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub test_case_id: i64,
    pub project_id: Option<String>,
    pub suite: String,
    pub batch_id: Option<String>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub evidence: Vec<String>,
    pub result_artifact: Option<String>,
    pub environment: String,
    pub executor: String,
    pub parameters: Map<String, Value>,
}

fn default_environment() -> String {
    "default".to_string()
}

fn default_executor() -> String {
    "system".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub test_case_id: i64,
    #[serde(default)]
    pub project_id: Option<String>,
    pub suite: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_executor")]
    pub executor: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl NewExecution {
    pub fn new(test_case_id: i64, suite: impl Into<String>) -> Self {
        Self {
            test_case_id,
            project_id: None,
            suite: suite.into(),
            environment: default_environment(),
            executor: default_executor(),
            parameters: Map::new(),
        }
    }
}

/// Settings shared by every member of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub test_case_ids: Vec<i64>,
    #[serde(default)]
    pub project_id: Option<String>,
    pub suite: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_executor")]
    pub executor: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub batch_id: String,
    pub execution_ids: Vec<i64>,
    pub suite: String,
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub outcome: ExecutionStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Additional artifact paths to attach.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Completion {
    pub fn new(outcome: ExecutionStatus) -> Self {
        Self {
            outcome,
            result: Value::Null,
            error_message: None,
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: i64,
    pub count_by_status: BTreeMap<String, i64>,
    /// Percentage of passed among passed+failed, two decimals.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub suite: Option<String>,
    pub project_id: Option<String>,
    pub limit: Option<usize>,
}

/// `round(passed / (passed + failed) * 100, 2)`, zero when nothing finished.
pub fn success_rate(passed: i64, failed: i64) -> f64 {
    let denom = passed + failed;
    if denom <= 0 {
        return 0.0;
    }
    (passed as f64 / denom as f64 * 10_000.0).round() / 100.0
}

const COLUMNS: &str = "id, test_case_id, project_id, suite, batch_id, status, created_at, \
     started_at, completed_at, duration_ms, result_json, error_message, evidence_json, \
     result_artifact, environment, executor, parameters_json";

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(5)?;
    let status = status.parse::<ExecutionStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created: String = row.get(6)?;
    let result: Option<String> = row.get(10)?;
    let evidence: String = row.get(12)?;
    let parameters: String = row.get(16)?;
    Ok(Execution {
        id: row.get(0)?,
        test_case_id: row.get(1)?,
        project_id: row.get(2)?,
        suite: row.get(3)?,
        batch_id: row.get(4)?,
        status,
        created_at: storage::parse_ts(6, &created)?,
        started_at: storage::parse_opt_ts(7, row.get(7)?)?,
        completed_at: storage::parse_opt_ts(8, row.get(8)?)?,
        duration_ms: row.get(9)?,
        result: result.map(|r| storage::parse_json(10, &r)).transpose()?,
        error_message: row.get(11)?,
        evidence: storage::parse_json(12, &evidence)?,
        result_artifact: row.get(13)?,
        environment: row.get(14)?,
        executor: row.get(15)?,
        parameters: storage::parse_json(16, &parameters)?,
    })
}

fn fetch(conn: &Connection, id: i64) -> Result<Option<Execution>> {
    let sql = format!("SELECT {COLUMNS} FROM executions WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_execution).optional()?)
}

fn current_status(conn: &Connection, id: i64) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT status FROM executions WHERE id = ?1",
            params![id],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

fn query(conn: &Connection, filter: &ExecutionFilter, default_limit: usize) -> Result<Vec<Execution>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM executions
         WHERE (?1 IS NULL OR status = ?1)
           AND (?2 IS NULL OR suite = ?2)
           AND (?3 IS NULL OR project_id = ?3)
         ORDER BY created_at DESC, id DESC
         LIMIT ?4"
    );
    let limit = filter.limit.unwrap_or(default_limit).clamp(1, 1000) as i64;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                filter.status.map(|s| s.as_str()),
                filter.suite,
                filter.project_id,
                limit
            ],
            row_to_execution,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

struct Shared<'a> {
    project_id: Option<&'a str>,
    suite: &'a str,
    batch_id: Option<&'a str>,
    environment: &'a str,
    executor: &'a str,
    parameters: &'a Map<String, Value>,
}

fn validate_suite(suite: &str) -> Result<()> {
    if suite.trim().is_empty() {
        return Err(CoreError::validation("suite is required"));
    }
    Ok(())
}

fn validate_test_case(test_case_id: i64) -> Result<()> {
    if test_case_id <= 0 {
        return Err(CoreError::validation(format!(
            "test_case_id must be positive, got {test_case_id}"
        )));
    }
    Ok(())
}

pub struct ExecutionLifecycle {
    store: SqliteStore,
    writer: Arc<DurableArtifactWriter>,
    recent: Arc<CacheAsideCollection<Execution>>,
    page_size: usize,
}

impl ExecutionLifecycle {
    pub fn new(
        store: SqliteStore,
        writer: Arc<DurableArtifactWriter>,
        kv: Arc<dyn KeyValueStore>,
        policy: CachePolicy,
    ) -> Self {
        let page_size = policy.page_size;
        let loader_store = store.clone();
        let recent = Arc::new(CacheAsideCollection::new("executions", kv, policy, move || {
            loader_store.with_conn(|c| query(c, &ExecutionFilter::default(), page_size))
        }));
        // Any linked upload changes the evidence list of cached executions.
        writer.register_invalidation(recent.clone());
        Self {
            store,
            writer,
            recent,
            page_size,
        }
    }

    fn insert(&self, test_case_id: i64, shared: &Shared<'_>) -> Result<i64> {
        validate_test_case(test_case_id)?;
        self.store.with_conn(|c| {
            c.execute(
                "INSERT INTO executions
                    (test_case_id, project_id, suite, batch_id, status, created_at,
                     environment, executor, parameters_json)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8)",
                params![
                    test_case_id,
                    shared.project_id,
                    shared.suite,
                    shared.batch_id,
                    storage::ts(storage::now_ms()),
                    shared.environment,
                    shared.executor,
                    storage::to_json(shared.parameters)?,
                ],
            )?;
            Ok(c.last_insert_rowid())
        })
    }

    pub fn create(&self, req: &NewExecution) -> Result<Execution> {
        validate_suite(&req.suite)?;
        let id = self.insert(
            req.test_case_id,
            &Shared {
                project_id: req.project_id.as_deref(),
                suite: &req.suite,
                batch_id: None,
                environment: &req.environment,
                executor: &req.executor,
                parameters: &req.parameters,
            },
        )?;
        self.recent.invalidate_member(&id.to_string())?;
        info!(execution_id = id, test_case_id = req.test_case_id, suite = %req.suite, "execution queued");
        self.get(id)
    }

    /// One queued execution per test case. Stops at the first failure.
    pub fn create_batch(&self, req: &BatchRequest) -> Result<ExecutionBatch> {
        validate_suite(&req.suite)?;
        if req.test_case_ids.is_empty() {
            return Err(CoreError::validation("batch has no test cases"));
        }

        let batch_id = Uuid::new_v4().to_string();
        let shared = Shared {
            project_id: req.project_id.as_deref(),
            suite: &req.suite,
            batch_id: Some(&batch_id),
            environment: &req.environment,
            executor: &req.executor,
            parameters: &req.parameters,
        };

        let mut created = Vec::with_capacity(req.test_case_ids.len());
        for &test_case_id in &req.test_case_ids {
            match self.insert(test_case_id, &shared) {
                Ok(id) => created.push(id),
                Err(e) => {
                    warn!(%batch_id, created = created.len(), requested = req.test_case_ids.len(), error = %e, "batch creation stopped");
                    if !created.is_empty() {
                        if let Err(e) = self.recent.invalidate() {
                            error!(%batch_id, error = %e, "cache invalidation after partial batch failed");
                        }
                    }
                    return Err(CoreError::PartialBatch {
                        created: created.len(),
                        requested: req.test_case_ids.len(),
                        created_ids: created,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.recent.invalidate()?;
        info!(%batch_id, count = created.len(), suite = %req.suite, "execution batch queued");
        Ok(ExecutionBatch {
            batch_id,
            execution_ids: created,
            suite: req.suite.clone(),
            environment: req.environment.clone(),
        })
    }

    fn transition_error(&self, conn: &Connection, id: i64, action: &'static str) -> CoreError {
        match current_status(conn, id) {
            Ok(Some(current)) => CoreError::InvalidState {
                kind: "execution",
                id: id.to_string(),
                current,
                action,
            },
            Ok(None) => CoreError::not_found("execution", id),
            Err(e) => e,
        }
    }

    /// `queued → running`.
    pub fn start(&self, id: i64) -> Result<Execution> {
        self.store.with_conn(|c| {
            let changed = c.execute(
                "UPDATE executions SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![storage::ts(storage::now_ms()), id],
            )?;
            if changed == 0 {
                return Err(self.transition_error(c, id, "start"));
            }
            Ok(())
        })?;
        self.recent.invalidate_member(&id.to_string())?;
        info!(execution_id = id, "execution started");
        self.get(id)
    }

    /// `running → outcome`, writing the result artifact.
    pub fn complete(&self, id: i64, completion: &Completion) -> Result<Execution> {
        if !completion.outcome.is_terminal() {
            return Err(CoreError::validation(format!(
                "{} is not a terminal outcome",
                completion.outcome
            )));
        }

        let mut written: Option<ArtifactRef> = None;
        let outcome = self.store.with_transaction(|tx| {
            let Some(current) = fetch(tx, id)? else {
                return Err(CoreError::not_found("execution", id));
            };
            if current.status != ExecutionStatus::Running {
                return Err(CoreError::InvalidState {
                    kind: "execution",
                    id: id.to_string(),
                    current: current.status.to_string(),
                    action: "complete",
                });
            }

            let started_at = current.started_at.unwrap_or(current.created_at);
            let completed_at = storage::now_ms().max(started_at);
            let duration_ms = (completed_at - started_at).num_milliseconds();

            let mut evidence = current.evidence.clone();
            for path in &completion.artifacts {
                if !evidence.contains(path) {
                    evidence.push(path.clone());
                }
            }

            let payload = json!({
                "execution_id": id,
                "test_case_id": current.test_case_id,
                "suite": current.suite,
                "status": completion.outcome,
                "started_at": storage::ts(started_at),
                "completed_at": storage::ts(completed_at),
                "duration_ms": duration_ms,
                "result": completion.result,
                "error_message": completion.error_message,
                "artifacts": evidence,
                "environment": current.environment,
                "executor": current.executor,
            });

            let (artifact, ()) = self.writer.write_with(RESULTS_CATEGORY, &payload, |r| {
                artifacts::insert_row(tx, RESULTS_CATEGORY, Some(id), r)?;
                tx.execute(
                    "UPDATE executions
                     SET status = ?1, completed_at = ?2, duration_ms = ?3, result_json = ?4,
                         error_message = ?5, evidence_json = ?6, result_artifact = ?7
                     WHERE id = ?8 AND status = 'running'",
                    params![
                        completion.outcome.as_str(),
                        storage::ts(completed_at),
                        duration_ms,
                        storage::to_json(&completion.result)?,
                        completion.error_message,
                        storage::to_json(&evidence)?,
                        r.path,
                        id,
                    ],
                )?;
                Ok(())
            })?;
            written = Some(artifact);
            Ok(())
        });

        if let Err(e) = outcome {
            return Err(match (e, written) {
                (e @ CoreError::OrphanArtifact { .. }, _) => e,
                // The object made it, the commit did not.
                (e, Some(artifact)) => {
                    error!(execution_id = id, path = %artifact.path, error = %e, "result artifact stored but completion not committed");
                    CoreError::OrphanArtifact {
                        bucket: artifact.bucket,
                        path: artifact.path,
                        message: e.to_string(),
                    }
                }
                (e, None) => e,
            });
        }

        self.recent.invalidate_member(&id.to_string())?;
        self.writer.invalidate_recent()?;
        info!(execution_id = id, outcome = %completion.outcome, "execution completed");
        self.get(id)
    }

    pub fn get(&self, id: i64) -> Result<Execution> {
        self.store
            .with_conn(|c| fetch(c, id))?
            .ok_or_else(|| CoreError::not_found("execution", id))
    }

    pub fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        self.store.with_conn(|c| query(c, filter, self.page_size))
    }

    /// Most recent page, through the `executions` cache collection.
    pub fn list_recent(&self) -> Result<Vec<Execution>> {
        self.recent.get()
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<ExecutionBatch> {
        let members: Vec<(i64, String, String)> = self.store.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, suite, environment FROM executions WHERE batch_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![batch_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        let Some((_, suite, environment)) = members.first().cloned() else {
            return Err(CoreError::not_found("batch", batch_id));
        };
        Ok(ExecutionBatch {
            batch_id: batch_id.to_string(),
            execution_ids: members.into_iter().map(|(id, _, _)| id).collect(),
            suite,
            environment,
        })
    }

    /// Remove an execution. Its id is never handed out again.
    pub fn delete(&self, id: i64) -> Result<()> {
        let removed = self
            .store
            .with_conn(|c| Ok(c.execute("DELETE FROM executions WHERE id = ?1", params![id])?))?;
        if removed == 0 {
            return Err(CoreError::not_found("execution", id));
        }
        self.recent.invalidate_member(&id.to_string())?;
        info!(execution_id = id, "execution deleted");
        Ok(())
    }

    pub fn stats(&self) -> Result<ExecutionStats> {
        let counts: Vec<(String, i64)> = self.store.with_conn(|c| {
            let mut stmt = c.prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut count_by_status: BTreeMap<String, i64> = ExecutionStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut total = 0;
        for (status, count) in counts {
            total += count;
            *count_by_status.entry(status).or_insert(0) += count;
        }
        let passed = count_by_status.get("passed").copied().unwrap_or(0);
        let failed = count_by_status.get("failed").copied().unwrap_or(0);

        Ok(ExecutionStats {
            total,
            count_by_status,
            success_rate: success_rate(passed, failed),
        })
    }
}
