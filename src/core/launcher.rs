use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use shell_escape::escape;

use crate::core::session::SessionHost;
use crate::core::task::Task;
use crate::error::AppResult;

const SCRIPT_MODE: u32 = 0o750;

/// A launched task's runtime handle, tracked by the scheduler while running.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub task_id: i64,
    pub session_name: String,
    pub assigned_gpus: Vec<i64>,
    pub log_path: PathBuf,
    pub script_path: PathBuf,
    pub exit_code_path: PathBuf,
    pub started_at: chrono::DateTime<Utc>,
}

pub struct TaskLauncher {
    runtime_dir: PathBuf,
    workdir: PathBuf,
    conda_init_script: Option<PathBuf>,
}

impl TaskLauncher {
    pub fn new(runtime_dir: PathBuf, workdir: PathBuf, conda_init_script: Option<PathBuf>) -> Self {
        Self {
            runtime_dir,
            workdir,
            conda_init_script,
        }
    }

    pub fn task_dir(&self, task_id: i64) -> PathBuf {
        self.runtime_dir.join("tasks").join(format!("task_{task_id}"))
    }

    /// Rebuilds the runtime paths for a task without touching the filesystem
    /// — used during startup recovery when the session is already live.
    pub fn paths_for(&self, task_id: i64) -> (PathBuf, PathBuf, PathBuf) {
        let dir = self.task_dir(task_id);
        (dir.join("run.sh"), dir.join("tmux.log"), dir.join("exit_code"))
    }

    /// Materializes the per-task directory, wrapper script, and log file for
    /// `task`, but does not start it — the caller invokes the session host
    /// and persists the `RUNNING` transition.
    pub fn prepare(&self, task: &Task, assigned_gpus: &[i64]) -> AppResult<(PathBuf, PathBuf, PathBuf)> {
        let task_dir = self.task_dir(task.id);
        fs::create_dir_all(&task_dir)?;

        let script_path = task_dir.join("run.sh");
        let log_path = task_dir.join("tmux.log");
        let exit_code_path = task_dir.join("exit_code");

        let script = self.render_script(task, assigned_gpus, &exit_code_path);
        fs::write(&script_path, script)?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(SCRIPT_MODE))?;

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok((script_path, log_path, exit_code_path))
    }

    fn render_script(&self, task: &Task, assigned_gpus: &[i64], exit_code_path: &Path) -> String {
        let mut lines = vec![
            "#!/usr/bin/env bash".to_string(),
            "set -u -o pipefail".to_string(),
        ];

        if !assigned_gpus.is_empty() {
            let joined = assigned_gpus
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join(",");
            lines.push(format!("export CUDA_VISIBLE_DEVICES={joined}"));
        }

        lines.push(format!("cd {}", escape(self.workdir.to_string_lossy())));

        if let (Some(env), Some(init_script)) = (&task.conda_env, &self.conda_init_script) {
            lines.push(format!("source {}", escape(init_script.to_string_lossy())));
            lines.push(format!("conda activate {}", escape(std::borrow::Cow::Borrowed(env.as_str()))));
        }

        lines.push(task.command.clone());
        lines.push("exit_code=$?".to_string());
        lines.push(format!(
            "echo \"$exit_code\" > {}",
            escape(exit_code_path.to_string_lossy())
        ));
        lines.push("exit \"$exit_code\"".to_string());

        lines.join("\n") + "\n"
    }

    /// Reads the exit-code sentinel; `None` if missing, empty, or
    /// unparseable — the scheduler maps that to a failed reap.
    pub fn read_exit_code(&self, exit_code_path: &Path) -> Option<i64> {
        let contents = fs::read_to_string(exit_code_path).ok()?;
        contents.trim().parse::<i64>().ok()
    }

    /// Runs the full launch sequence: materializes the
    /// script and log file, verifies the session host, starts the session,
    /// and attaches its output. Does not touch the store — the caller
    /// persists the `RUNNING` transition after this returns.
    pub fn launch(
        &self,
        task: &Task,
        assigned_gpus: &[i64],
        session_host: &impl SessionHost,
    ) -> AppResult<RunningTask> {
        let (script_path, log_path, exit_code_path) = self.prepare(task, assigned_gpus)?;
        session_host.ensure_available()?;

        let session_name = format!("task_{}", task.id);
        session_host.start_session(&session_name, &script_path)?;
        if let Err(err) = session_host.attach_output(&session_name, &log_path) {
            tracing::warn!("failed to attach output for {session_name}: {err}");
        }

        Ok(RunningTask {
            task_id: task.id,
            session_name,
            assigned_gpus: assigned_gpus.to_vec(),
            log_path,
            script_path,
            exit_code_path,
            started_at: Utc::now(),
        })
    }
}
