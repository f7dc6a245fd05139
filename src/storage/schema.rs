//! Database schema.

use anyhow::Result;
use rusqlite::Connection;

/// Create all tables and indexes. Idempotent.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS configuration (
            config_key TEXT PRIMARY KEY,
            config_value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            repository TEXT,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS test_cases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            suite TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'medium',
            status TEXT NOT NULL DEFAULT 'draft',
            steps_json TEXT NOT NULL DEFAULT '[]',
            expected_result TEXT NOT NULL DEFAULT '',
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_by TEXT NOT NULL DEFAULT 'system',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            test_case_id INTEGER NOT NULL,
            project_id TEXT,
            suite TEXT NOT NULL,
            batch_id TEXT,
            status TEXT NOT NULL DEFAULT 'queued',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER,
            result_json TEXT,
            error_message TEXT,
            evidence_json TEXT NOT NULL DEFAULT '[]',
            result_artifact TEXT,
            environment TEXT NOT NULL DEFAULT 'default',
            executor TEXT NOT NULL DEFAULT 'system',
            parameters_json TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            execution_id INTEGER,
            bucket TEXT NOT NULL,
            object_path TEXT NOT NULL,
            size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            content_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (bucket, object_path)
        );

        CREATE INDEX IF NOT EXISTS idx_projects_created ON projects(created_at);
        CREATE INDEX IF NOT EXISTS idx_test_cases_created ON test_cases(created_at);
        CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_batch ON executions(batch_id);
        CREATE INDEX IF NOT EXISTS idx_artifacts_category ON artifacts(category, created_at);
        CREATE INDEX IF NOT EXISTS idx_artifacts_execution ON artifacts(execution_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["configuration", "projects", "test_cases", "executions", "artifacts"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_execution_ids_are_never_reused() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let insert = "INSERT INTO executions (test_case_id, suite, created_at) VALUES (1, 's', '2024-01-01T00:00:00.000Z')";
        conn.execute(insert, []).unwrap();
        conn.execute(insert, []).unwrap();
        conn.execute("DELETE FROM executions WHERE id = 2", []).unwrap();
        conn.execute(insert, []).unwrap();
        let max: i64 = conn
            .query_row("SELECT MAX(id) FROM executions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(max, 3);
    }
}
