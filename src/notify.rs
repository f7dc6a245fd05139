//! Task-service notification for newly queued executions.
//!
//! Best effort: a failed post is logged and never affects the execution.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::lifecycle::Execution;

#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub execution_id: i64,
    pub test_case_id: i64,
    pub suite: String,
    pub environment: String,
    pub executor: String,
    pub batch_id: Option<String>,
    pub parameters: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl From<&Execution> for TaskDescriptor {
    fn from(e: &Execution) -> Self {
        Self {
            execution_id: e.id,
            test_case_id: e.test_case_id,
            suite: e.suite.clone(),
            environment: e.environment.clone(),
            executor: e.executor.clone(),
            batch_id: e.batch_id.clone(),
            parameters: e.parameters.clone(),
            created_at: e.created_at,
        }
    }
}

pub struct TaskNotifier {
    client: Client,
    url: String,
}

impl TaskNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build task service client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post the descriptor; returns whether the service accepted it.
    pub async fn notify(&self, execution: &Execution) -> bool {
        let task = TaskDescriptor::from(execution);
        match self.client.post(&self.url).json(&task).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(execution_id = task.execution_id, "task service notified");
                true
            }
            Ok(resp) => {
                warn!(execution_id = task.execution_id, status = %resp.status(), "task service rejected notification");
                false
            }
            Err(e) => {
                warn!(execution_id = task.execution_id, error = %e, "task service unreachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ExecutionStatus;

    fn execution() -> Execution {
        Execution {
            id: 4,
            test_case_id: 2,
            project_id: None,
            suite: "smoke".into(),
            batch_id: None,
            status: ExecutionStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result: None,
            error_message: None,
            evidence: vec![],
            result_artifact: None,
            environment: "default".into(),
            executor: "system".into(),
            parameters: Map::new(),
        }
    }

    #[test]
    fn test_descriptor_fields() {
        let v = serde_json::to_value(TaskDescriptor::from(&execution())).unwrap();
        assert_eq!(v["execution_id"], 4);
        assert_eq!(v["suite"], "smoke");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_not_an_error() {
        let n = TaskNotifier::new("http://127.0.0.1:1/tasks", Duration::from_millis(500)).unwrap();
        assert!(!n.notify(&execution()).await);
    }
}
