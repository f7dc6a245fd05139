use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::require;
use crate::cache::{CacheAsideCollection, CachePolicy};
use crate::error::{CoreError, Result};
use crate::kv::KeyValueStore;
use crate::storage::{self, SqliteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Archived,
}

impl ProjectStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Archived => "archived",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProjectStatus::Active),
            "archived" => Some(ProjectStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repository: Option<String>,
    pub description: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub repository: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get(4)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        repository: row.get(2)?,
        description: row.get(3)?,
        status: ProjectStatus::parse(&status).unwrap_or(ProjectStatus::Active),
        created_at: storage::parse_ts(5, &created)?,
        updated_at: storage::parse_ts(6, &updated)?,
    })
}

const COLUMNS: &str = "id, name, repository, description, status, created_at, updated_at";

fn fetch(conn: &Connection, id: &str) -> Result<Option<Project>> {
    let sql = format!("SELECT {COLUMNS} FROM projects WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_project).optional()?)
}

fn page(conn: &Connection, limit: usize) -> Result<Vec<Project>> {
    let sql = format!("SELECT {COLUMNS} FROM projects ORDER BY created_at DESC, id LIMIT ?1");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![limit as i64], row_to_project)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub struct ProjectCatalog {
    store: SqliteStore,
    cache: CacheAsideCollection<Project>,
}

impl ProjectCatalog {
    pub fn new(store: SqliteStore, kv: Arc<dyn KeyValueStore>, policy: CachePolicy) -> Self {
        let limit = policy.page_size;
        let loader_store = store.clone();
        let cache = CacheAsideCollection::new("projects", kv, policy, move || {
            loader_store.with_conn(|c| page(c, limit))
        });
        Self { store, cache }
    }

    pub fn create(&self, req: &NewProject) -> Result<Project> {
        require("name", &req.name)?;
        let now = storage::now_ms();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: req.name.trim().to_string(),
            repository: req.repository.clone(),
            description: req.description.clone(),
            status: ProjectStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.with_conn(|c| {
            c.execute(
                "INSERT INTO projects (id, name, repository, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project.id,
                    project.name,
                    project.repository,
                    project.description,
                    project.status.as_str(),
                    storage::ts(now),
                    storage::ts(now),
                ],
            )?;
            Ok(())
        })?;
        self.cache.invalidate_member(&project.id)?;
        info!(project_id = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    pub fn list(&self) -> Result<Vec<Project>> {
        self.cache.get()
    }

    pub fn get(&self, id: &str) -> Result<Project> {
        self.cache
            .get_member(id, || self.store.with_conn(|c| fetch(c, id)))?
            .ok_or_else(|| CoreError::not_found("project", id))
    }

    pub fn update(&self, id: &str, update: &ProjectUpdate) -> Result<Project> {
        if let Some(name) = &update.name {
            require("name", name)?;
        }
        let project = self.store.with_transaction(|tx| {
            let mut project = fetch(tx, id)?.ok_or_else(|| CoreError::not_found("project", id))?;
            if let Some(name) = &update.name {
                project.name = name.trim().to_string();
            }
            if let Some(repository) = &update.repository {
                project.repository = Some(repository.clone());
            }
            if let Some(description) = &update.description {
                project.description = description.clone();
            }
            if let Some(status) = update.status {
                project.status = status;
            }
            project.updated_at = storage::now_ms();
            tx.execute(
                "UPDATE projects SET name = ?1, repository = ?2, description = ?3, status = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    project.name,
                    project.repository,
                    project.description,
                    project.status.as_str(),
                    storage::ts(project.updated_at),
                    id,
                ],
            )?;
            Ok(project)
        })?;
        self.cache.invalidate_member(id)?;
        Ok(project)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = self
            .store
            .with_conn(|c| Ok(c.execute("DELETE FROM projects WHERE id = ?1", params![id])?))?;
        if removed == 0 {
            return Err(CoreError::not_found("project", id));
        }
        self.cache.invalidate_member(id)?;
        info!(project_id = %id, "project deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::storage::temp_store;

    fn catalog() -> (tempfile::TempDir, ProjectCatalog, Arc<MemoryKv>) {
        let (dir, store) = temp_store();
        let kv = Arc::new(MemoryKv::new());
        (dir, ProjectCatalog::new(store, kv.clone(), CachePolicy::default()), kv)
    }

    fn new_project(name: &str) -> NewProject {
        NewProject {
            name: name.into(),
            repository: Some("https://git.example.com/web".into()),
            description: String::new(),
        }
    }

    #[test]
    fn test_create_is_visible_after_cached_list() {
        let (_dir, catalog, kv) = catalog();
        assert!(catalog.list().unwrap().is_empty());
        assert!(kv.get("projects:all").unwrap().is_some());

        let p = catalog.create(&new_project("web")).unwrap();
        let listed = catalog.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, p.id);
    }

    #[test]
    fn test_get_update_delete() {
        let (_dir, catalog, kv) = catalog();
        let p = catalog.create(&new_project("web")).unwrap();
        assert_eq!(catalog.get(&p.id).unwrap().name, "web");
        assert!(kv.get(&format!("projects:{}", p.id)).unwrap().is_some());

        let updated = catalog
            .update(
                &p.id,
                &ProjectUpdate {
                    status: Some(ProjectStatus::Archived),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.status, ProjectStatus::Archived);
        assert_eq!(catalog.get(&p.id).unwrap().status, ProjectStatus::Archived);

        catalog.delete(&p.id).unwrap();
        assert!(matches!(catalog.get(&p.id).unwrap_err(), CoreError::NotFound { .. }));
        assert!(matches!(catalog.delete(&p.id).unwrap_err(), CoreError::NotFound { .. }));
    }

    #[test]
    fn test_name_required() {
        let (_dir, catalog, _kv) = catalog();
        assert!(matches!(
            catalog.create(&new_project(" ")).unwrap_err(),
            CoreError::Validation(_)
        ));
    }
}
