use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::task::{parse_assigned_gpus, serialize_assigned_gpus, Task, TaskCreate, TaskStatus};
use crate::error::{AppError, AppResult};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    gpu_type TEXT NOT NULL,
    gpu_count INTEGER NOT NULL,
    command TEXT NOT NULL,
    conda_env TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    session_name TEXT,
    assigned_gpus TEXT,
    log_path TEXT,
    exit_code INTEGER,
    error TEXT
);
"#;

/// Single-writer relational store. Every mutating method commits before
/// returning; the single `Mutex<Connection>` is the "one logical lock"
/// — reads and writes alike serialize through it.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_task(&self, fields: &TaskCreate, created_at: DateTime<Utc>) -> AppResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (name, gpu_type, gpu_count, command, conda_env, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fields.name,
                fields.gpu_type,
                fields.gpu_count,
                fields.command,
                fields.conda_env,
                TaskStatus::Queued.as_str(),
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_status(&self, id: i64, status: TaskStatus, error: Option<&str>) -> AppResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?1, error = ?2 WHERE id = ?3",
            params![status.as_str(), error, id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_launched(
        &self,
        id: i64,
        started_at: DateTime<Utc>,
        session_name: &str,
        assigned_gpus: &[i64],
        log_path: &str,
    ) -> AppResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks
             SET status = ?1, started_at = ?2, session_name = ?3, assigned_gpus = ?4, log_path = ?5
             WHERE id = ?6",
            params![
                TaskStatus::Running.as_str(),
                started_at.to_rfc3339(),
                session_name,
                serialize_assigned_gpus(assigned_gpus),
                log_path,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn update_completion(
        &self,
        id: i64,
        status: TaskStatus,
        completed_at: DateTime<Utc>,
        exit_code: Option<i64>,
        error: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks
             SET status = ?1, completed_at = ?2, exit_code = ?3, error = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                completed_at.to_rfc3339(),
                exit_code,
                error,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> AppResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let task = conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()?;
        Ok(task)
    }

    pub fn list_all_ordered_by_created_desc(&self) -> AppResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at DESC, id DESC")?;
        let rows = stmt.query_map([], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn list_by_status(&self, statuses: &HashSet<TaskStatus>) -> AppResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map([], row_to_task)?;
        let tasks = rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|t| statuses.contains(&t.status))
            .collect();
        Ok(tasks)
    }
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let status_str: String = row.get("status")?;
    let status = status_str
        .parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(0, "status".into(), rusqlite::types::Type::Text))?;
    let assigned_gpus_raw: Option<String> = row.get("assigned_gpus")?;
    let assigned = parse_assigned_gpus(assigned_gpus_raw.as_deref());

    Ok(Task {
        id: row.get("id")?,
        name: row.get("name")?,
        gpu_type: row.get("gpu_type")?,
        gpu_count: row.get("gpu_count")?,
        command: row.get("command")?,
        conda_env: row.get("conda_env")?,
        status,
        created_at: parse_rfc3339(row.get::<_, String>("created_at")?),
        started_at: row
            .get::<_, Option<String>>("started_at")?
            .map(parse_rfc3339),
        completed_at: row
            .get::<_, Option<String>>("completed_at")?
            .map(parse_rfc3339),
        session_name: row.get("session_name")?,
        assigned_gpus: if assigned_gpus_raw.is_some() {
            Some(assigned)
        } else {
            None
        },
        log_path: row.get("log_path")?,
        exit_code: row.get("exit_code")?,
        error: row.get("error")?,
    })
}

fn parse_rfc3339(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
