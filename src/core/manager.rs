use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::core::gpu::{GpuProbe, GpuState};
use crate::core::launcher::TaskLauncher;
use crate::core::scheduler::{self, SchedulerState};
use crate::core::session::SessionHost;
use crate::core::store::Store;
use crate::core::task::{Task, TaskCreate, TaskDetail, TaskStatus, TaskSummary};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuInfo {
    pub index: i64,
    pub uuid: Option<String>,
    pub name: String,
    pub memory_total: Option<i64>,
    pub memory_used: Option<i64>,
    pub utilization_gpu: Option<i64>,
    pub utilization_mem: Option<i64>,
    pub assigned_task_id: Option<i64>,
    pub processes: Vec<crate::core::gpu::GpuProcess>,
    pub is_free: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskLogResponse {
    pub task_id: i64,
    pub lines: Vec<String>,
    pub truncated: bool,
}

/// The public, thread-safe facade. Owns the store, the state lock,
/// and the background scheduler loop's handle. Never a process-wide
/// singleton — callers instantiate one per runtime root.
pub struct Manager<G: GpuProbe, S: SessionHost> {
    store: Store,
    probe: G,
    session_host: S,
    launcher: TaskLauncher,
    state: Mutex<SchedulerState>,
    poll_interval: Duration,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    stop_notify: std::sync::Arc<Notify>,
}

impl<G: GpuProbe + 'static, S: SessionHost + 'static> Manager<G, S> {
    pub fn new(
        store: Store,
        probe: G,
        session_host: S,
        runtime_dir: PathBuf,
        workdir: PathBuf,
        conda_init_script: Option<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            probe,
            session_host,
            launcher: TaskLauncher::new(runtime_dir, workdir, conda_init_script),
            state: Mutex::new(SchedulerState::default()),
            poll_interval,
            loop_handle: Mutex::new(None),
            stop_notify: std::sync::Arc::new(Notify::new()),
        }
    }

    pub async fn create_task(&self, payload: TaskCreate) -> AppResult<TaskDetail> {
        if payload.command.trim().is_empty() {
            return Err(AppError::Invalid("command must not be empty".to_string()));
        }
        if !(1..=8).contains(&payload.gpu_count) {
            return Err(AppError::Invalid("gpu_count must be between 1 and 8".to_string()));
        }
        if !(1..=200).contains(&payload.name.chars().count()) {
            return Err(AppError::Invalid("name must be 1..200 characters".to_string()));
        }

        let detected = self.probe.snapshot().await?;
        if detected.is_empty() {
            return Err(AppError::Invalid("no GPUs detected".to_string()));
        }
        if !detected.iter().any(|g| g.name == payload.gpu_type) {
            return Err(AppError::Invalid(format!("'{}' not detected", payload.gpu_type)));
        }

        let mut state = self.state.lock().unwrap();
        let id = self.store.insert_task(&payload, Utc::now())?;
        state.queue.push_back(id);
        drop(state);

        let task = self
            .store
            .get(id)?
            .ok_or_else(|| AppError::Internal("task vanished immediately after insert".to_string()))?;
        Ok((&task).into())
    }

    pub fn list_tasks(&self) -> AppResult<Vec<TaskSummary>> {
        Ok(self
            .store
            .list_all_ordered_by_created_desc()?
            .iter()
            .map(TaskSummary::from)
            .collect())
    }

    pub fn get_task(&self, id: i64) -> AppResult<TaskDetail> {
        let task = self.get_task_row(id)?;
        Ok((&task).into())
    }

    fn get_task_row(&self, id: i64) -> AppResult<Task> {
        self.store
            .get(id)?
            .ok_or_else(|| AppError::NotFound(format!("no task with id {id}")))
    }

    pub async fn get_gpu_status(&self) -> AppResult<Vec<GpuInfo>> {
        let states = self.probe.snapshot().await?;
        let state = self.state.lock().unwrap();
        let mut assigned_lookup: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
        for (task_id, running) in state.running.iter() {
            for gpu_index in &running.assigned_gpus {
                assigned_lookup.insert(*gpu_index, *task_id);
            }
        }
        drop(state);

        Ok(states
            .into_iter()
            .map(|gpu| {
                let assigned_task_id = assigned_lookup.get(&gpu.index).copied();
                GpuInfo {
                    index: gpu.index,
                    uuid: gpu.uuid,
                    name: gpu.name,
                    memory_total: gpu.memory_total,
                    memory_used: gpu.memory_used,
                    utilization_gpu: gpu.utilization_gpu,
                    utilization_mem: gpu.utilization_mem,
                    assigned_task_id,
                    processes: gpu.processes,
                    is_free: assigned_task_id.is_none(),
                }
            })
            .collect())
    }

    /// Computes `truncated` from the file's total line count, not from the
    /// returned window's length — comparing against the window's length
    /// alone would false-positive when the file has exactly `tail` lines.
    pub fn get_task_logs(&self, id: i64, tail: usize) -> AppResult<TaskLogResponse> {
        let task = self.get_task_row(id)?;
        let Some(log_path) = task.log_path.as_ref() else {
            return Ok(TaskLogResponse {
                task_id: id,
                lines: Vec::new(),
                truncated: false,
            });
        };

        // tmux pipe-pane captures whatever the task writes, which is not
        // guaranteed to be valid UTF-8 — decode lossily rather than erroring.
        let bytes = match std::fs::read(log_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TaskLogResponse {
                    task_id: id,
                    lines: Vec::new(),
                    truncated: false,
                })
            }
            Err(err) => return Err(AppError::Internal(err.to_string())),
        };
        let contents = String::from_utf8_lossy(&bytes);

        let all_lines: Vec<&str> = contents.lines().collect();
        let total = all_lines.len();
        let truncated = total > tail;
        let window_start = total.saturating_sub(tail);
        let lines = all_lines[window_start..].iter().map(|s| s.to_string()).collect();

        Ok(TaskLogResponse {
            task_id: id,
            lines,
            truncated,
        })
    }

    pub fn cancel_task(&self, id: i64) -> AppResult<TaskDetail> {
        let mut state = self.state.lock().unwrap();

        if let Some(pos) = state.queue.iter().position(|&queued_id| queued_id == id) {
            let task = self.get_task_row(id)?;
            if task.status.is_terminal() {
                return Err(AppError::Invalid(format!("task {id} is already terminal")));
            }
            state.queue.remove(pos);
            drop(state);
            self.store.update_status(id, TaskStatus::Cancelled, None)?;
            let task = self.get_task_row(id)?;
            return Ok((&task).into());
        }

        if let Some(running) = state.running.remove(&id) {
            drop(state);
            if let Err(err) = self.session_host.kill_session(&running.session_name) {
                tracing::warn!("failed to kill session for cancelled task {id}: {err}");
            }
            self.store
                .update_completion(id, TaskStatus::Cancelled, Utc::now(), None, None)?;
            let task = self.get_task_row(id)?;
            return Ok((&task).into());
        }

        drop(state);
        let task = self.get_task_row(id)?;
        if task.status.is_terminal() {
            Err(AppError::Invalid(format!("task {id} is already terminal")))
        } else {
            Err(AppError::Internal(format!(
                "task {id} is neither queued nor running nor terminal; inconsistent state"
            )))
        }
    }

    /// Startup recovery, then spawns the background scheduler loop.
    pub async fn start(self: &std::sync::Arc<Self>) -> AppResult<()>
    where
        G: Send + Sync,
        S: Send + Sync,
    {
        {
            let mut state = self.state.lock().unwrap();
            scheduler::recover(&mut state, &self.store, &self.session_host, &self.launcher)?;
        }

        let manager = std::sync::Arc::clone(self);
        let stop_notify = std::sync::Arc::clone(&self.stop_notify);
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {
                        manager.run_tick().await;
                    }
                    _ = stop_notify.notified() => break,
                }
            }
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn run_tick(&self) {
        // `tick` takes the `Mutex` itself and only ever locks it briefly, for
        // in-memory snapshot/commit — never across the probe `.await` or a
        // launcher/session-host subprocess call, so this future stays `Send`
        // for `tokio::spawn` in `start()`.
        scheduler::tick(&self.state, &self.store, &self.probe, &self.session_host, &self.launcher).await;
    }

    /// Signals the loop to exit and joins with a bounded wait (≤ 2 × poll
    /// interval). Does not terminate running sessions.
    pub async fn stop(&self) {
        self.stop_notify.notify_one();
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(self.poll_interval * 2, handle).await;
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gpu::FakeGpuProbe;
    use crate::core::session::FakeSessionHost;
    use std::sync::Arc;

    fn make_manager(dir: &tempfile::TempDir, gpus: Vec<GpuState>) -> Arc<Manager<FakeGpuProbe, FakeSessionHost>> {
        let store = Store::open_in_memory().unwrap();
        let probe = FakeGpuProbe::new(gpus);
        let session_host = FakeSessionHost::new();
        Arc::new(Manager::new(
            store,
            probe,
            session_host,
            dir.path().to_path_buf(),
            PathBuf::from("/work"),
            None,
            Duration::from_millis(50),
        ))
    }

    fn gpu(index: i64, name: &str) -> GpuState {
        GpuState {
            index,
            uuid: Some(format!("GPU-{index}")),
            name: name.to_string(),
            memory_total: None,
            memory_used: None,
            utilization_gpu: None,
            utilization_mem: None,
            processes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_task_rejects_unknown_gpu_type() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, vec![gpu(0, "A100")]);
        let err = manager
            .create_task(TaskCreate {
                name: "t".to_string(),
                gpu_type: "H100".to_string(),
                gpu_count: 1,
                command: "echo hi".to_string(),
                conda_env: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Invalid(msg) if msg.contains("H100")));
    }

    #[tokio::test]
    async fn create_task_rejects_no_gpus_detected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, vec![]);
        let err = manager
            .create_task(TaskCreate {
                name: "t".to_string(),
                gpu_type: "A100".to_string(),
                gpu_count: 1,
                command: "echo hi".to_string(),
                conda_env: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[tokio::test]
    async fn create_then_cancel_queued_task() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, vec![gpu(0, "A100"), gpu(1, "A100")]);
        let detail = manager
            .create_task(TaskCreate {
                name: "t".to_string(),
                gpu_type: "A100".to_string(),
                gpu_count: 2,
                command: "echo hi".to_string(),
                conda_env: None,
            })
            .await
            .unwrap();
        assert_eq!(detail.status, TaskStatus::Queued);

        let cancelled = manager.cancel_task(detail.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let err = manager.cancel_task(detail.id).unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[tokio::test]
    async fn get_task_logs_truncation_uses_total_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, vec![]);
        let log_path = dir.path().join("tmux.log");
        std::fs::write(&log_path, "a\nb\nc\n").unwrap();

        let store = &manager.store;
        let id = store
            .insert_task(
                &TaskCreate {
                    name: "t".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count: 1,
                    command: "true".to_string(),
                    conda_env: None,
                },
                Utc::now(),
            )
            .unwrap();
        store
            .update_launched(id, Utc::now(), "task_x", &[0], &log_path.to_string_lossy())
            .unwrap();

        let exact = manager.get_task_logs(id, 3).unwrap();
        assert_eq!(exact.lines, vec!["a", "b", "c"]);
        assert!(!exact.truncated);

        let fewer = manager.get_task_logs(id, 2).unwrap();
        assert_eq!(fewer.lines, vec!["b", "c"]);
        assert!(fewer.truncated);

        let more = manager.get_task_logs(id, 5).unwrap();
        assert_eq!(more.lines, vec!["a", "b", "c"]);
        assert!(!more.truncated);
    }

    #[tokio::test]
    async fn create_task_accepts_gpu_count_boundaries_and_rejects_outside_them() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, (0..8).map(|i| gpu(i, "A100")).collect());

        for gpu_count in [1, 8] {
            let detail = manager
                .create_task(TaskCreate {
                    name: "t".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count,
                    command: "echo hi".to_string(),
                    conda_env: None,
                })
                .await
                .unwrap();
            assert_eq!(detail.gpu_count, gpu_count);
        }

        for gpu_count in [0, 9] {
            let err = manager
                .create_task(TaskCreate {
                    name: "t".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count,
                    command: "echo hi".to_string(),
                    conda_env: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Invalid(_)));
        }
    }

    #[tokio::test]
    async fn create_task_accepts_name_length_boundaries_and_rejects_outside_them() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, vec![gpu(0, "A100")]);

        for name in ["a".repeat(1), "a".repeat(200)] {
            let detail = manager
                .create_task(TaskCreate {
                    name,
                    gpu_type: "A100".to_string(),
                    gpu_count: 1,
                    command: "echo hi".to_string(),
                    conda_env: None,
                })
                .await
                .unwrap();
            assert!(!detail.name.is_empty());
        }

        let err = manager
            .create_task(TaskCreate {
                name: "a".repeat(201),
                gpu_type: "A100".to_string(),
                gpu_count: 1,
                command: "echo hi".to_string(),
                conda_env: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[tokio::test]
    async fn get_task_logs_missing_file_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, vec![]);
        let store = &manager.store;
        let id = store
            .insert_task(
                &TaskCreate {
                    name: "t".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count: 1,
                    command: "true".to_string(),
                    conda_env: None,
                },
                Utc::now(),
            )
            .unwrap();
        let response = manager.get_task_logs(id, 10).unwrap();
        assert!(response.lines.is_empty());
        assert!(!response.truncated);
    }
}
