use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::require;
use crate::cache::{CacheAsideCollection, CachePolicy};
use crate::error::{CoreError, Result};
use crate::kv::KeyValueStore;
use crate::storage::{self, SqliteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseStatus {
    #[default]
    Draft,
    Active,
    Deprecated,
}

/// Both enums are stored as their serde names.
fn enum_str<T: Serialize>(v: &T) -> Result<String> {
    match serde_json::to_value(v) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(CoreError::validation("enum did not serialize to a string")),
    }
}

fn enum_parse<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub suite: String,
    pub priority: Priority,
    pub status: TestCaseStatus,
    pub steps: Vec<String>,
    pub expected_result: String,
    pub tags: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_author() -> String {
    "system".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTestCase {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub suite: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TestCaseStatus,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_author")]
    pub created_by: String,
}

impl NewTestCase {
    pub fn new(title: impl Into<String>, suite: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            suite: suite.into(),
            priority: Priority::default(),
            status: TestCaseStatus::default(),
            steps: Vec::new(),
            expected_result: String::new(),
            tags: Vec::new(),
            created_by: default_author(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestCaseUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub suite: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<TestCaseStatus>,
    pub steps: Option<Vec<String>>,
    pub expected_result: Option<String>,
    pub tags: Option<Vec<String>>,
}

const COLUMNS: &str = "id, title, description, suite, priority, status, steps_json, \
     expected_result, tags_json, created_by, created_at, updated_at";

fn row_to_test_case(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestCase> {
    let priority: String = row.get(4)?;
    let status: String = row.get(5)?;
    let steps: String = row.get(6)?;
    let tags: String = row.get(8)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(TestCase {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        suite: row.get(3)?,
        priority: enum_parse(4, &priority)?,
        status: enum_parse(5, &status)?,
        steps: storage::parse_json(6, &steps)?,
        expected_result: row.get(7)?,
        tags: storage::parse_json(8, &tags)?,
        created_by: row.get(9)?,
        created_at: storage::parse_ts(10, &created)?,
        updated_at: storage::parse_ts(11, &updated)?,
    })
}

fn fetch(conn: &Connection, id: i64) -> Result<Option<TestCase>> {
    let sql = format!("SELECT {COLUMNS} FROM test_cases WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_test_case).optional()?)
}

fn page(conn: &Connection, suite: Option<&str>, limit: usize) -> Result<Vec<TestCase>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM test_cases WHERE (?1 IS NULL OR suite = ?1)
         ORDER BY created_at DESC, id DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![suite, limit as i64], row_to_test_case)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub struct TestCaseCatalog {
    store: SqliteStore,
    cache: Arc<CacheAsideCollection<TestCase>>,
    page_size: usize,
}

impl TestCaseCatalog {
    pub fn new(store: SqliteStore, kv: Arc<dyn KeyValueStore>, policy: CachePolicy) -> Self {
        let page_size = policy.page_size;
        let loader_store = store.clone();
        let cache = CacheAsideCollection::new("test_cases", kv, policy, move || {
            loader_store.with_conn(|c| page(c, None, page_size))
        });
        Self {
            store,
            cache: Arc::new(cache),
            page_size,
        }
    }

    pub fn create(&self, req: &NewTestCase) -> Result<TestCase> {
        require("title", &req.title)?;
        require("suite", &req.suite)?;
        let now = storage::ts(storage::now_ms());
        let id = self.store.with_conn(|c| {
            c.execute(
                "INSERT INTO test_cases
                    (title, description, suite, priority, status, steps_json, expected_result,
                     tags_json, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    req.title.trim(),
                    req.description,
                    req.suite.trim(),
                    enum_str(&req.priority)?,
                    enum_str(&req.status)?,
                    storage::to_json(&req.steps)?,
                    req.expected_result,
                    storage::to_json(&req.tags)?,
                    req.created_by,
                    now,
                ],
            )?;
            Ok(c.last_insert_rowid())
        })?;
        self.cache.invalidate_member(&id.to_string())?;
        info!(test_case_id = id, suite = %req.suite, "test case created");
        self.get(id)
    }

    /// Most recent page, cached.
    pub fn list(&self) -> Result<Vec<TestCase>> {
        self.cache.get()
    }

    pub fn list_suite(&self, suite: &str) -> Result<Vec<TestCase>> {
        self.store.with_conn(|c| page(c, Some(suite), self.page_size))
    }

    pub fn get(&self, id: i64) -> Result<TestCase> {
        self.cache
            .get_member(&id.to_string(), || self.store.with_conn(|c| fetch(c, id)))?
            .ok_or_else(|| CoreError::not_found("test case", id))
    }

    pub fn update(&self, id: i64, update: &TestCaseUpdate) -> Result<TestCase> {
        if let Some(title) = &update.title {
            require("title", title)?;
        }
        if let Some(suite) = &update.suite {
            require("suite", suite)?;
        }
        let tc = self.store.with_transaction(|tx| {
            let mut tc = fetch(tx, id)?.ok_or_else(|| CoreError::not_found("test case", id))?;
            if let Some(v) = &update.title {
                tc.title = v.trim().to_string();
            }
            if let Some(v) = &update.description {
                tc.description = v.clone();
            }
            if let Some(v) = &update.suite {
                tc.suite = v.trim().to_string();
            }
            if let Some(v) = update.priority {
                tc.priority = v;
            }
            if let Some(v) = update.status {
                tc.status = v;
            }
            if let Some(v) = &update.steps {
                tc.steps = v.clone();
            }
            if let Some(v) = &update.expected_result {
                tc.expected_result = v.clone();
            }
            if let Some(v) = &update.tags {
                tc.tags = v.clone();
            }
            tc.updated_at = storage::now_ms();
            tx.execute(
                "UPDATE test_cases SET title = ?1, description = ?2, suite = ?3, priority = ?4,
                    status = ?5, steps_json = ?6, expected_result = ?7, tags_json = ?8, updated_at = ?9
                 WHERE id = ?10",
                params![
                    tc.title,
                    tc.description,
                    tc.suite,
                    enum_str(&tc.priority)?,
                    enum_str(&tc.status)?,
                    storage::to_json(&tc.steps)?,
                    tc.expected_result,
                    storage::to_json(&tc.tags)?,
                    storage::ts(tc.updated_at),
                    id,
                ],
            )?;
            Ok(tc)
        })?;
        self.cache.invalidate_member(&id.to_string())?;
        Ok(tc)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let removed = self
            .store
            .with_conn(|c| Ok(c.execute("DELETE FROM test_cases WHERE id = ?1", params![id])?))?;
        if removed == 0 {
            return Err(CoreError::not_found("test case", id));
        }
        self.cache.invalidate_member(&id.to_string())?;
        info!(test_case_id = id, "test case deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::storage::temp_store;

    fn catalog() -> (tempfile::TempDir, TestCaseCatalog) {
        let (dir, store) = temp_store();
        (
            dir,
            TestCaseCatalog::new(store, Arc::new(MemoryKv::new()), CachePolicy::default()),
        )
    }

    #[test]
    fn test_create_and_read_back() {
        let (_dir, catalog) = catalog();
        let mut req = NewTestCase::new("Login works", "auth");
        req.priority = Priority::High;
        req.steps = vec!["open /login".into(), "submit".into()];
        req.tags = vec!["smoke".into()];

        let tc = catalog.create(&req).unwrap();
        assert_eq!(tc.priority, Priority::High);
        assert_eq!(tc.status, TestCaseStatus::Draft);
        assert_eq!(tc.steps.len(), 2);
        assert_eq!(catalog.get(tc.id).unwrap(), tc);
    }

    #[test]
    fn test_list_sees_create_and_update() {
        let (_dir, catalog) = catalog();
        assert!(catalog.list().unwrap().is_empty());
        let tc = catalog.create(&NewTestCase::new("Checkout", "cart")).unwrap();
        assert_eq!(catalog.list().unwrap().len(), 1);

        catalog
            .update(
                tc.id,
                &TestCaseUpdate {
                    status: Some(TestCaseStatus::Active),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(catalog.list().unwrap()[0].status, TestCaseStatus::Active);
        assert_eq!(catalog.get(tc.id).unwrap().status, TestCaseStatus::Active);
    }

    #[test]
    fn test_list_suite_and_delete() {
        let (_dir, catalog) = catalog();
        let a = catalog.create(&NewTestCase::new("A", "auth")).unwrap();
        catalog.create(&NewTestCase::new("B", "cart")).unwrap();
        assert_eq!(catalog.list_suite("auth").unwrap().len(), 1);

        catalog.delete(a.id).unwrap();
        assert!(catalog.list_suite("auth").unwrap().is_empty());
        assert!(matches!(catalog.get(a.id).unwrap_err(), CoreError::NotFound { .. }));
    }

    #[test]
    fn test_requires_title_and_suite() {
        let (_dir, catalog) = catalog();
        assert!(catalog.create(&NewTestCase::new("", "auth")).is_err());
        assert!(catalog.create(&NewTestCase::new("x", " ")).is_err());
    }
}
