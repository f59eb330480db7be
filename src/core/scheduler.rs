use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::Utc;

use crate::core::gpu::GpuProbe;
use crate::core::launcher::{RunningTask, TaskLauncher};
use crate::core::session::SessionHost;
use crate::core::store::Store;
use crate::core::task::TaskStatus;
use crate::error::AppResult;

/// The queue and running map, guarded by the state lock. Owned by the
/// Manager Facade behind a `Mutex`; the scheduler only ever holds that lock
/// long enough to read or mutate these two fields in memory — never across
/// an `.await` or a session-host/launcher subprocess call.
#[derive(Default)]
pub struct SchedulerState {
    pub queue: VecDeque<i64>,
    pub running: HashMap<i64, RunningTask>,
}

impl SchedulerState {
    pub fn assigned_indices(&self) -> Vec<i64> {
        self.running.values().flat_map(|r| r.assigned_gpus.iter().copied()).collect()
    }
}

/// One scheduler tick: launch phase then reap phase. Takes the state
/// `Mutex` itself rather than a held guard — each phase locks only for the
/// snapshot and the final commit, so the probe `.await` and every
/// launcher/session-host subprocess call run with the lock released. Never
/// propagates an external-tool failure up — logs and degrades instead.
pub async fn tick(
    state: &Mutex<SchedulerState>,
    store: &Store,
    probe: &impl GpuProbe,
    session_host: &impl SessionHost,
    launcher: &TaskLauncher,
) {
    let gpu_states = match probe.snapshot().await {
        Ok(states) => states,
        Err(err) => {
            tracing::warn!("GPU probe failed this tick, treating as zero GPUs: {err}");
            Vec::new()
        }
    };

    launch_phase(state, store, &gpu_states, session_host, launcher);
    reap_phase(state, store, session_host, launcher);
}

fn launch_phase(
    state: &Mutex<SchedulerState>,
    store: &Store,
    gpu_states: &[crate::core::gpu::GpuState],
    session_host: &impl SessionHost,
    launcher: &TaskLauncher,
) {
    let (queue_snapshot, assigned): (Vec<i64>, HashSet<i64>) = {
        let guard = state.lock().unwrap();
        if guard.queue.is_empty() {
            return;
        }
        (guard.queue.iter().copied().collect(), guard.assigned_indices().into_iter().collect())
    };

    let mut available_by_type: HashMap<String, Vec<i64>> = HashMap::new();
    for gpu in gpu_states {
        if !assigned.contains(&gpu.index) {
            available_by_type.entry(gpu.name.clone()).or_default().push(gpu.index);
        }
    }
    for gpus in available_by_type.values_mut() {
        gpus.sort_unstable();
    }

    // Resolve the FIFO queue against the store, dropping ids whose task no
    // longer exists. A load error truncates `pending` at that point, leaving
    // everything from there on still queued for the next tick.
    let mut pending = Vec::new();
    let mut drop_from_queue = HashSet::new();
    for task_id in queue_snapshot {
        match store.get(task_id) {
            Ok(Some(task)) => pending.push((task_id, task.gpu_type.clone(), task.gpu_count as usize)),
            Ok(None) => {
                drop_from_queue.insert(task_id);
            }
            Err(err) => {
                tracing::error!("failed to load queued task {task_id}: {err}");
                break;
            }
        }
    }

    let plan = plan_launches(&pending, &available_by_type);

    // Launcher/session-host calls are blocking subprocess work (tmux
    // new-session, a fixed settle sleep, send-keys) and run here with no
    // state lock held at all.
    let mut launched = Vec::new();
    for (task_id, assigned_gpus) in &plan {
        let task = match store.get(*task_id) {
            Ok(Some(task)) if task.status == TaskStatus::Queued => task,
            Ok(Some(_)) => {
                // Status changed out from under us (e.g. cancelled) between
                // the snapshot above and now; drop it from the queue without
                // launching.
                drop_from_queue.insert(*task_id);
                continue;
            }
            _ => continue,
        };
        match launcher.launch(&task, assigned_gpus, session_host) {
            Ok(running) => {
                if let Err(err) = store.update_launched(
                    task.id,
                    running.started_at,
                    &running.session_name,
                    assigned_gpus,
                    &running.log_path.to_string_lossy(),
                ) {
                    tracing::error!("failed to persist launch of task {task_id}: {err}");
                }
                launched.push((*task_id, running));
            }
            Err(err) => {
                tracing::warn!("failed to launch task {task_id}: {err}");
                if let Err(store_err) =
                    store.update_status(*task_id, TaskStatus::Failed, Some(&err.to_string()))
                {
                    tracing::error!("failed to mark task {task_id} failed: {store_err}");
                }
                drop_from_queue.insert(*task_id);
            }
        }
    }

    drop_from_queue.extend(plan.iter().map(|(id, _)| *id));

    // Re-acquire the lock only to commit the queue/running-map mutation.
    let mut guard = state.lock().unwrap();
    guard.queue.retain(|id| !drop_from_queue.contains(id));
    for (task_id, running) in launched {
        guard.running.insert(task_id, running);
    }
}

/// Pure FIFO allocation decision (GPU-assignment disjointness, strict
/// FIFO ordering). Walks `pending` in order, draining `available_by_type`'s
/// pools as it goes, and stops at the first task that doesn't fit — that
/// task and everything behind it in the queue wait for the next tick.
fn plan_launches(
    pending: &[(i64, String, usize)],
    available_by_type: &HashMap<String, Vec<i64>>,
) -> Vec<(i64, Vec<i64>)> {
    let mut pools = available_by_type.clone();
    let mut plan = Vec::new();
    for (task_id, gpu_type, need) in pending {
        let candidates = pools.entry(gpu_type.clone()).or_default();
        if candidates.len() < *need {
            break;
        }
        let assigned_gpus: Vec<i64> = candidates.drain(0..*need).collect();
        plan.push((*task_id, assigned_gpus));
    }
    plan
}

fn reap_phase(state: &Mutex<SchedulerState>, store: &Store, session_host: &impl SessionHost, launcher: &TaskLauncher) {
    let running_snapshot: Vec<(i64, RunningTask)> = {
        let guard = state.lock().unwrap();
        guard.running.iter().map(|(id, r)| (*id, r.clone())).collect()
    };

    // `has_session` shells out to tmux per task; none of this runs with the
    // state lock held.
    let mut finished = Vec::new();
    for (task_id, running) in running_snapshot {
        if session_host.has_session(&running.session_name) {
            continue;
        }
        let exit_code = launcher.read_exit_code(&running.exit_code_path);
        let (status, error) = match exit_code {
            None => (
                TaskStatus::Failed,
                Some("Task terminated without reporting an exit code".to_string()),
            ),
            Some(0) => (TaskStatus::Completed, None),
            Some(code) => (TaskStatus::Failed, Some(format!("Process exited with status {code}"))),
        };
        if let Err(err) = store.update_completion(task_id, status, Utc::now(), exit_code, error.as_deref()) {
            tracing::error!("failed to persist completion of task {task_id}: {err}");
        }
        finished.push(task_id);
    }

    if !finished.is_empty() {
        let mut guard = state.lock().unwrap();
        for task_id in finished {
            guard.running.remove(&task_id);
        }
    }
}

/// Startup recovery: reload non-terminal tasks ordered by
/// `created_at` ascending, rebuilding the queue and running map.
pub fn recover(
    state: &mut SchedulerState,
    store: &Store,
    session_host: &impl SessionHost,
    launcher: &TaskLauncher,
) -> AppResult<()> {
    let mut wanted = std::collections::HashSet::new();
    wanted.insert(TaskStatus::Queued);
    wanted.insert(TaskStatus::Running);
    let tasks = store.list_by_status(&wanted)?;

    for task in tasks {
        match task.status {
            TaskStatus::Queued => state.queue.push_back(task.id),
            TaskStatus::Running => {
                let session_name = task.session_name.clone().unwrap_or_else(|| format!("task_{}", task.id));
                if session_host.has_session(&session_name) {
                    let (script_path, log_path, exit_code_path) = launcher.paths_for(task.id);
                    state.running.insert(
                        task.id,
                        RunningTask {
                            task_id: task.id,
                            session_name,
                            assigned_gpus: task.assigned_gpus.clone().unwrap_or_default(),
                            log_path,
                            script_path,
                            exit_code_path,
                            started_at: task.started_at.unwrap_or_else(Utc::now),
                        },
                    );
                } else {
                    store.update_completion(
                        task.id,
                        TaskStatus::Failed,
                        Utc::now(),
                        None,
                        Some("tmux session missing after restart"),
                    )?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gpu::{FakeGpuProbe, GpuState};
    use crate::core::session::FakeSessionHost;
    use crate::core::task::TaskCreate;
    use std::path::PathBuf;

    fn make_launcher(dir: &tempfile::TempDir) -> TaskLauncher {
        TaskLauncher::new(dir.path().to_path_buf(), PathBuf::from("/work"), None)
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
    async fn launches_when_enough_gpus_free() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let launcher = make_launcher(&dir);
        let session_host = FakeSessionHost::new();
        let probe = FakeGpuProbe::new(vec![gpu(0, "A100"), gpu(1, "A100")]);

        let id = store
            .insert_task(
                &TaskCreate {
                    name: "t".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count: 2,
                    command: "true".to_string(),
                    conda_env: None,
                },
                Utc::now(),
            )
            .unwrap();

        let state = Mutex::new(SchedulerState::default());
        state.lock().unwrap().queue.push_back(id);

        tick(&state, &store, &probe, &session_host, &launcher).await;

        let guard = state.lock().unwrap();
        assert!(guard.queue.is_empty());
        assert!(guard.running.contains_key(&id));
        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_gpus, Some(vec![0, 1]));
    }

    #[tokio::test]
    async fn head_of_line_blocking_stops_launch_phase() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let launcher = make_launcher(&dir);
        let session_host = FakeSessionHost::new();
        let probe = FakeGpuProbe::new(vec![gpu(0, "A100")]);

        let blocked = store
            .insert_task(
                &TaskCreate {
                    name: "blocked".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count: 2,
                    command: "true".to_string(),
                    conda_env: None,
                },
                Utc::now(),
            )
            .unwrap();
        let behind = store
            .insert_task(
                &TaskCreate {
                    name: "behind".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count: 1,
                    command: "true".to_string(),
                    conda_env: None,
                },
                Utc::now(),
            )
            .unwrap();

        let state = Mutex::new(SchedulerState::default());
        {
            let mut guard = state.lock().unwrap();
            guard.queue.push_back(blocked);
            guard.queue.push_back(behind);
        }

        tick(&state, &store, &probe, &session_host, &launcher).await;

        let guard = state.lock().unwrap();
        assert_eq!(guard.queue.len(), 2);
        assert!(guard.running.is_empty());
        let behind_task = store.get(behind).unwrap().unwrap();
        assert_eq!(behind_task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn reap_phase_marks_completed_on_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let launcher = make_launcher(&dir);
        let session_host = FakeSessionHost::new();
        let probe = FakeGpuProbe::new(vec![]);

        let id = store
            .insert_task(
                &TaskCreate {
                    name: "t".to_string(),
                    gpu_type: "A100".to_string(),
                    gpu_count: 0,
                    command: "true".to_string(),
                    conda_env: None,
                },
                Utc::now(),
            )
            .unwrap();
        store.update_launched(id, Utc::now(), "task_x", &[], "/tmp/x").unwrap();

        let (_, _, exit_code_path) = launcher.paths_for(id);
        std::fs::create_dir_all(exit_code_path.parent().unwrap()).unwrap();
        std::fs::write(&exit_code_path, "0\n").unwrap();

        let state = Mutex::new(SchedulerState::default());
        state.lock().unwrap().running.insert(
            id,
            RunningTask {
                task_id: id,
                session_name: "task_x".to_string(),
                assigned_gpus: vec![],
                log_path: dir.path().join("log"),
                script_path: dir.path().join("run.sh"),
                exit_code_path,
                started_at: Utc::now(),
            },
        );

        tick(&state, &store, &probe, &session_host, &launcher).await;

        assert!(state.lock().unwrap().running.is_empty());
        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.exit_code, Some(0));
    }
}

#[cfg(test)]
mod plan_launches_proptests {
    use super::plan_launches;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    fn gpu_type_strategy() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["A100", "H100", "V100"]).prop_map(|s| s.to_string())
    }

    fn pending_strategy() -> impl Strategy<Value = Vec<(i64, String, usize)>> {
        proptest::collection::vec((gpu_type_strategy(), 0usize..4), 0..8).prop_map(|items| {
            items
                .into_iter()
                .enumerate()
                .map(|(i, (gpu_type, need))| (i as i64, gpu_type, need))
                .collect()
        })
    }

    fn available_strategy() -> impl Strategy<Value = HashMap<String, Vec<i64>>> {
        (0i64..6, 0i64..6, 0i64..6).prop_map(|(a100, h100, v100)| {
            let mut map = HashMap::new();
            map.insert("A100".to_string(), (0..a100).collect());
            map.insert("H100".to_string(), (0..h100).collect());
            map.insert("V100".to_string(), (0..v100).collect());
            map
        })
    }

    proptest! {
        /// No GPU index is ever handed to more than one planned task, and
        /// every assigned index actually belongs to its task's type pool.
        #[test]
        fn assignments_are_disjoint_and_sourced_from_the_right_pool(
            pending in pending_strategy(),
            available in available_strategy(),
        ) {
            let plan = plan_launches(&pending, &available);

            let mut seen = HashSet::new();
            for (i, (task_id, gpus)) in plan.iter().enumerate() {
                let (expected_id, gpu_type, need) = &pending[i];
                prop_assert_eq!(task_id, expected_id);
                prop_assert_eq!(gpus.len(), *need);

                let pool = available.get(gpu_type).cloned().unwrap_or_default();
                for g in gpus {
                    prop_assert!(pool.contains(g), "assigned gpu {g} not in {gpu_type}'s pool");
                    prop_assert!(seen.insert(*g), "gpu {g} assigned to more than one task");
                }
            }
        }

        /// The plan is a FIFO prefix of `pending`: it never skips ahead, and
        /// if it stops short, the first unplanned task genuinely didn't fit
        /// in what remained of its type's pool (head-of-line blocking).
        #[test]
        fn plan_is_a_fifo_prefix_that_stops_at_the_first_shortfall(
            pending in pending_strategy(),
            available in available_strategy(),
        ) {
            let plan = plan_launches(&pending, &available);

            prop_assert!(plan.len() <= pending.len());
            for (i, (task_id, _)) in plan.iter().enumerate() {
                prop_assert_eq!(*task_id, pending[i].0);
            }

            if plan.len() < pending.len() {
                let mut consumed: HashMap<String, usize> = HashMap::new();
                for (_, gpu_type, need) in &pending[..plan.len()] {
                    *consumed.entry(gpu_type.clone()).or_insert(0) += need;
                }
                let (_, gpu_type, need) = &pending[plan.len()];
                let total = available.get(gpu_type).map(|p| p.len()).unwrap_or(0);
                let used = *consumed.get(gpu_type).unwrap_or(&0);
                prop_assert!(total.saturating_sub(used) < *need);
            }
        }
    }
}
