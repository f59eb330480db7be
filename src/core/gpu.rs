use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{AppError, AppResult};

const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const USERNAME_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// A single GPU process observed by the probe.
#[derive(Debug, Clone, Serialize)]
pub struct GpuProcess {
    pub pid: i64,
    pub name: String,
    pub used_memory: Option<i64>,
    pub username: Option<String>,
}

/// A GPU device snapshot, as reported by a single probe tick.
#[derive(Debug, Clone, Serialize)]
pub struct GpuState {
    pub index: i64,
    pub uuid: Option<String>,
    pub name: String,
    pub memory_total: Option<i64>,
    pub memory_used: Option<i64>,
    pub utilization_gpu: Option<i64>,
    pub utilization_mem: Option<i64>,
    pub processes: Vec<GpuProcess>,
}

/// The GPU inventory probe. Abstracted behind a trait so the
/// scheduler and HTTP layer can run against a `FakeGpuProbe` in tests without
/// a real GPU or `nvidia-smi` on PATH. Scheduler/manager types are generic
/// over this trait rather than boxing it, so no `dyn`-compatibility shim is
/// needed for an async method.
pub trait GpuProbe: Send + Sync {
    /// Returns the current GPU inventory. An empty `Vec` means "no GPUs
    /// detected" (including "the tool is missing") — that is not an error.
    /// `Err` means the tool *is* present but refused to answer.
    fn snapshot(&self) -> impl std::future::Future<Output = AppResult<Vec<GpuState>>> + Send;
}

/// Queries `nvidia-smi` as a subprocess. Never links against the NVIDIA
/// driver directly.
pub struct NvidiaSmiProbe;

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for NvidiaSmiProbe {
    async fn snapshot(&self) -> AppResult<Vec<GpuState>> {
        let mut states = match query_gpu_states().await? {
            Some(states) => states,
            None => return Ok(Vec::new()),
        };

        let processes = query_gpu_processes().await;
        if !processes.is_empty() {
            for (gpu_uuid, process) in processes {
                if let Some(state) = states.iter_mut().find(|s| s.uuid.as_deref() == Some(gpu_uuid.as_str())) {
                    state.processes.push(process);
                }
            }
        }
        Ok(states)
    }
}

/// Runs the inventory query. `Ok(None)` means "tool not found" (not an
/// error); `Err` means the tool ran but reported failure.
async fn query_gpu_states() -> AppResult<Option<Vec<GpuState>>> {
    let output = match timeout(
        GPU_QUERY_TIMEOUT,
        Command::new("nvidia-smi")
            .arg("--query-gpu=index,uuid,name,memory.total,memory.used,utilization.gpu,utilization.memory")
            .arg("--format=csv,noheader,nounits")
            .stdin(Stdio::null())
            .output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("nvidia-smi not found on PATH");
            return Ok(None);
        }
        Ok(Err(err)) => {
            return Err(AppError::ProbeError(format!("failed to invoke nvidia-smi: {err}")));
        }
        Err(_) => {
            return Err(AppError::ProbeError("nvidia-smi timed out".to_string()));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            return Err(AppError::ProbeError(format!(
                "nvidia-smi returned non-zero exit status: {stderr}"
            )));
        }
        return Ok(Some(Vec::new()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut states = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            tracing::debug!("unexpected nvidia-smi line format: {line}");
            continue;
        }
        let Some(index) = parse_int(parts[0]) else {
            tracing::debug!("missing GPU index in line={line}");
            continue;
        };
        states.push(GpuState {
            index,
            uuid: Some(parts[1].to_string()),
            name: parts[2].to_string(),
            memory_total: parts.get(3).and_then(|p| parse_int(p)),
            memory_used: parts.get(4).and_then(|p| parse_int(p)),
            utilization_gpu: parts.get(5).and_then(|p| parse_int(p)),
            utilization_mem: parts.get(6).and_then(|p| parse_int(p)),
            processes: Vec::new(),
        });
    }
    states.sort_by_key(|s| s.index);
    Ok(Some(states))
}

/// Compute-process query is best-effort: any failure degrades to "no
/// processes" rather than failing the whole snapshot.
async fn query_gpu_processes() -> Vec<(String, GpuProcess)> {
    let output = match timeout(
        GPU_QUERY_TIMEOUT,
        Command::new("nvidia-smi")
            .arg("--query-compute-apps=gpu_uuid,pid,process_name,used_memory")
            .arg("--format=csv,noheader,nounits")
            .stdin(Stdio::null())
            .output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        _ => return Vec::new(),
    };

    if !output.status.success() {
        return Vec::new();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut processes = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 2 {
            continue;
        }
        let gpu_uuid = parts[0];
        let Some(pid) = parse_int(parts[1]) else {
            continue;
        };
        if gpu_uuid.is_empty() {
            continue;
        }
        let name = parts.get(2).map(|s| s.to_string()).unwrap_or_default();
        let used_memory = parts.get(3).and_then(|p| parse_int(p));
        let username = lookup_username(pid).await;
        processes.push((
            gpu_uuid.to_string(),
            GpuProcess {
                pid,
                name,
                used_memory,
                username,
            },
        ));
    }
    processes
}

async fn lookup_username(pid: i64) -> Option<String> {
    let output = timeout(
        USERNAME_QUERY_TIMEOUT,
        Command::new("ps")
            .args(["-o", "user=", "-p"])
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    let username = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if username.is_empty() {
        None
    } else {
        Some(username)
    }
}

fn parse_int(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() || value == "N/A" {
        return None;
    }
    value
        .parse::<f64>()
        .ok()
        .map(|f| f as i64)
        .or_else(|| value.parse::<i64>().ok())
}

/// Test double that returns a fixed inventory, used by the scheduler and
/// manager test suites instead of shelling out to `nvidia-smi`.
#[cfg(test)]
pub struct FakeGpuProbe {
    pub states: std::sync::Mutex<Vec<GpuState>>,
}

#[cfg(test)]
impl FakeGpuProbe {
    pub fn new(states: Vec<GpuState>) -> Self {
        Self {
            states: std::sync::Mutex::new(states),
        }
    }
}

#[cfg(test)]
impl GpuProbe for FakeGpuProbe {
    async fn snapshot(&self) -> AppResult<Vec<GpuState>> {
        Ok(self.states.lock().unwrap().clone())
    }
}
