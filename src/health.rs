//! Store health report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::objects::ObjectStore;
use crate::storage::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `ok` when every component answered, else `degraded`.
    pub status: &'static str,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.components.iter().all(|c| c.healthy)
    }
}

fn component(name: &'static str, result: Result<()>) -> ComponentHealth {
    match result {
        Ok(()) => ComponentHealth {
            name,
            healthy: true,
            error: None,
        },
        Err(e) => {
            warn!(component = name, error = %e, "health check failed");
            ComponentHealth {
                name,
                healthy: false,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Ping each store. One failing store never hides the others.
pub fn check(store: &SqliteStore, kv: &dyn KeyValueStore, objects: &dyn ObjectStore) -> HealthReport {
    let components = vec![
        component("database", store.ping()),
        component("cache", kv.ping()),
        component("objects", objects.ping()),
    ];
    let status = if components.iter().all(|c| c.healthy) {
        "ok"
    } else {
        "degraded"
    };
    HealthReport {
        status,
        components,
        checked_at: Utc::now(),
    }
}
