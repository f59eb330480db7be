use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A task's position on the `queued -> {running, cancelled, failed}`,
/// `running -> {completed, failed, cancelled}` transition DAG. Terminal
/// states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full persistent record, mirroring the `tasks` table.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub gpu_type: String,
    pub gpu_count: i64,
    pub command: String,
    pub conda_env: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub session_name: Option<String>,
    pub assigned_gpus: Option<Vec<i64>>,
    pub log_path: Option<String>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

/// Fields required to create a task; validated by the Manager Facade.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskCreate {
    pub name: String,
    pub gpu_type: String,
    pub gpu_count: i64,
    pub command: String,
    #[serde(default)]
    pub conda_env: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: i64,
    pub name: String,
    pub status: TaskStatus,
    pub gpu_type: String,
    pub gpu_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub id: i64,
    pub name: String,
    pub status: TaskStatus,
    pub gpu_type: String,
    pub gpu_count: i64,
    pub command: String,
    pub conda_env: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub session_name: Option<String>,
    pub assigned_gpus: Vec<i64>,
    pub log_path: Option<String>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        TaskSummary {
            id: task.id,
            name: task.name.clone(),
            status: task.status,
            gpu_type: task.gpu_type.clone(),
            gpu_count: task.gpu_count,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

impl From<&Task> for TaskDetail {
    fn from(task: &Task) -> Self {
        TaskDetail {
            id: task.id,
            name: task.name.clone(),
            status: task.status,
            gpu_type: task.gpu_type.clone(),
            gpu_count: task.gpu_count,
            command: task.command.clone(),
            conda_env: task.conda_env.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            session_name: task.session_name.clone(),
            assigned_gpus: task.assigned_gpus.clone().unwrap_or_default(),
            log_path: task.log_path.clone(),
            exit_code: task.exit_code,
            error: task.error.clone(),
        }
    }
}

/// Parses the compact JSON-array form `assigned_gpus` is stored as.
pub fn parse_assigned_gpus(raw: Option<&str>) -> Vec<i64> {
    match raw {
        Some(s) if !s.is_empty() => serde_json::from_str(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub fn serialize_assigned_gpus(gpus: &[i64]) -> String {
    serde_json::to_string(gpus).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigned_gpus_round_trip() {
        let gpus = vec![0, 1, 3];
        let raw = serialize_assigned_gpus(&gpus);
        assert_eq!(parse_assigned_gpus(Some(&raw)), gpus);
    }

    #[test]
    fn assigned_gpus_empty() {
        assert_eq!(parse_assigned_gpus(None), Vec::<i64>::new());
        assert_eq!(parse_assigned_gpus(Some("")), Vec::<i64>::new());
        assert_eq!(parse_assigned_gpus(Some("[]")), Vec::<i64>::new());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let s = status.as_str();
            let parsed: TaskStatus = s.parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
