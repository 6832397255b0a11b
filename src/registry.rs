//! SQLite-backed project registry
//!
//! Single source of truth for Project records. The supervisor mutates only
//! status; structural fields change through explicit create/update calls.

use crate::project::{Project, ProjectStatus, ProjectType};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Registry connection wrapper with thread-safe access
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
}

impl Registry {
    /// Open or create a registry database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open registry database")?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;

        info!("Registry opened at {}", path.display());
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory registry")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().expect("registry mutex poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running registry migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: projects table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying registry migration v1: projects table");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                project_type TEXT NOT NULL,
                root_dir TEXT NOT NULL,
                exec_path TEXT,
                start_command TEXT,
                port INTEGER NOT NULL,
                auto_start INTEGER NOT NULL DEFAULT 0,
                domains TEXT NOT NULL DEFAULT '',
                ssl_enabled INTEGER NOT NULL DEFAULT 0,
                ssl_email TEXT,
                reverse_proxy_path TEXT NOT NULL DEFAULT '/',
                extra_headers TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                use_ipv4 INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_projects_port ON projects(port);
            CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Insert a new project, returning its id. Status is forced to stopped.
    pub fn insert_project(&self, project: &Project) -> Result<i64> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute(
            r#"INSERT INTO projects
                (name, project_type, root_dir, exec_path, start_command, port, auto_start,
                 domains, ssl_enabled, ssl_email, reverse_proxy_path, extra_headers,
                 description, use_ipv4, status)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'stopped')"#,
            params![
                project.name,
                project.project_type.as_str(),
                project.root_dir,
                project.exec_path,
                project.start_command,
                project.port,
                project.auto_start,
                project.domains.join("\n"),
                project.ssl_enabled,
                project.ssl_email,
                project.reverse_proxy_path,
                project.extra_headers.join("\n"),
                project.description,
                project.use_ipv4,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update a project's structural fields (status is untouched)
    pub fn update_project(&self, project: &Project) -> Result<bool> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let changed = conn.execute(
            r#"UPDATE projects SET
                name=?1, project_type=?2, root_dir=?3, exec_path=?4, start_command=?5,
                port=?6, auto_start=?7, domains=?8, ssl_enabled=?9, ssl_email=?10,
                reverse_proxy_path=?11, extra_headers=?12, description=?13, use_ipv4=?14,
                updated_at=datetime('now')
               WHERE id=?15"#,
            params![
                project.name,
                project.project_type.as_str(),
                project.root_dir,
                project.exec_path,
                project.start_command,
                project.port,
                project.auto_start,
                project.domains.join("\n"),
                project.ssl_enabled,
                project.ssl_email,
                project.reverse_proxy_path,
                project.extra_headers.join("\n"),
                project.description,
                project.use_ipv4,
                project.id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let changed = conn.execute("DELETE FROM projects WHERE id=?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id=?1"),
            params![id],
            row_to_project,
        )
        .optional()
        .context("Failed to load project")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at DESC"
        ))?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    /// Projects whose persisted status is running
    pub fn running_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE status='running' ORDER BY id"
        ))?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    pub fn set_status(&self, id: i64, status: ProjectStatus) -> Result<()> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute(
            "UPDATE projects SET status=?1, updated_at=datetime('now') WHERE id=?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Which other non-stopped project, if any, claims this port. Used by
    /// the port allocator to name conflict holders.
    pub fn project_on_port(&self, port: u16, excluding_id: Option<i64>) -> Result<Option<Project>> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.query_row(
            &format!(
                "SELECT {PROJECT_COLUMNS} FROM projects
                 WHERE port=?1 AND status != 'stopped' AND id != ?2"
            ),
            params![port, excluding_id.unwrap_or(-1)],
            row_to_project,
        )
        .optional()
        .context("Failed to query port holder")
    }

    /// Any project (regardless of status) other than `excluding_id` that has
    /// this port configured. Used at create/edit time to reject early.
    pub fn project_with_port(&self, port: u16, excluding_id: Option<i64>) -> Result<Option<Project>> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE port=?1 AND id != ?2"),
            params![port, excluding_id.unwrap_or(-1)],
            row_to_project,
        )
        .optional()
        .context("Failed to query configured port")
    }
}

const PROJECT_COLUMNS: &str = "id, name, project_type, root_dir, exec_path, start_command, port, \
     auto_start, domains, ssl_enabled, ssl_email, reverse_proxy_path, extra_headers, description, \
     use_ipv4, status";

fn split_lines(raw: String) -> Vec<String> {
    raw.lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let project_type: String = row.get(2)?;
    let domains: String = row.get(8)?;
    let extra_headers: String = row.get(12)?;
    let status: String = row.get(15)?;

    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        project_type: ProjectType::from_str(&project_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        root_dir: row.get(3)?,
        exec_path: row.get(4)?,
        start_command: row.get(5)?,
        port: row.get(6)?,
        auto_start: row.get(7)?,
        domains: split_lines(domains),
        ssl_enabled: row.get(9)?,
        ssl_email: row.get(10)?,
        reverse_proxy_path: row.get(11)?,
        extra_headers: split_lines(extra_headers),
        description: row.get(13)?,
        use_ipv4: row.get(14)?,
        status: ProjectStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(15, rusqlite::types::Type::Text, e.into())
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, port: u16) -> Project {
        Project {
            id: 0,
            name: name.to_string(),
            project_type: ProjectType::Go,
            root_dir: "/tmp".to_string(),
            exec_path: None,
            start_command: Some("sleep 60".to_string()),
            port,
            auto_start: false,
            domains: vec![format!("{name}.example.com")],
            ssl_enabled: false,
            ssl_email: None,
            reverse_proxy_path: "/".to_string(),
            extra_headers: vec!["X-Forwarded-Proto https".to_string()],
            description: String::new(),
            use_ipv4: true,
            status: ProjectStatus::Stopped,
        }
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let registry = Registry::open_in_memory().unwrap();
        let id = registry.insert_project(&sample("api", 8080)).unwrap();

        let loaded = registry.get_project(id).unwrap().unwrap();
        assert_eq!(loaded.name, "api");
        assert_eq!(loaded.port, 8080);
        assert_eq!(loaded.domains, vec!["api.example.com"]);
        assert_eq!(loaded.extra_headers, vec!["X-Forwarded-Proto https"]);
        assert_eq!(loaded.status, ProjectStatus::Stopped);
    }

    #[test]
    fn test_update_does_not_touch_status() {
        let registry = Registry::open_in_memory().unwrap();
        let id = registry.insert_project(&sample("api", 8080)).unwrap();
        registry.set_status(id, ProjectStatus::Running).unwrap();

        let mut project = registry.get_project(id).unwrap().unwrap();
        project.port = 8081;
        assert!(registry.update_project(&project).unwrap());

        let reloaded = registry.get_project(id).unwrap().unwrap();
        assert_eq!(reloaded.port, 8081);
        assert_eq!(reloaded.status, ProjectStatus::Running);
    }

    #[test]
    fn test_delete() {
        let registry = Registry::open_in_memory().unwrap();
        let id = registry.insert_project(&sample("api", 8080)).unwrap();
        assert!(registry.delete_project(id).unwrap());
        assert!(registry.get_project(id).unwrap().is_none());
        assert!(!registry.delete_project(id).unwrap());
    }

    #[test]
    fn test_project_on_port_only_sees_non_stopped() {
        let registry = Registry::open_in_memory().unwrap();
        let a = registry.insert_project(&sample("a", 9000)).unwrap();
        registry.insert_project(&sample("b", 9001)).unwrap();

        // Stopped projects do not hold ports
        assert!(registry.project_on_port(9000, None).unwrap().is_none());

        registry.set_status(a, ProjectStatus::Running).unwrap();
        let holder = registry.project_on_port(9000, None).unwrap().unwrap();
        assert_eq!(holder.name, "a");

        // The holder itself is excluded
        assert!(registry.project_on_port(9000, Some(a)).unwrap().is_none());
    }

    #[test]
    fn test_project_with_port_sees_stopped_projects() {
        let registry = Registry::open_in_memory().unwrap();
        let a = registry.insert_project(&sample("a", 9000)).unwrap();

        let holder = registry.project_with_port(9000, None).unwrap().unwrap();
        assert_eq!(holder.name, "a");
        assert!(registry.project_with_port(9000, Some(a)).unwrap().is_none());
        assert!(registry.project_with_port(9100, None).unwrap().is_none());
    }

    #[test]
    fn test_running_projects() {
        let registry = Registry::open_in_memory().unwrap();
        let a = registry.insert_project(&sample("a", 9000)).unwrap();
        registry.insert_project(&sample("b", 9001)).unwrap();

        assert!(registry.running_projects().unwrap().is_empty());
        registry.set_status(a, ProjectStatus::Running).unwrap();

        let running = registry.running_projects().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "a");
    }
}
