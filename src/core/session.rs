use std::path::Path;
use std::time::Duration;

use tmux_interface::{HasSession, KillSession, NewSession, PipePane, SendKeys, Tmux};

use crate::error::{AppError, AppResult};

/// The Session Host Adapter: a terminal multiplexer used to run a
/// task's wrapper script detached from the daemon's own process tree, so the
/// task survives a daemon restart.
pub trait SessionHost: Send + Sync {
    /// Fails with `SessionUnavailable` if the underlying tool cannot be
    /// invoked at all (e.g. not on PATH).
    fn ensure_available(&self) -> AppResult<()>;

    /// Launches `script_path` detached under `session_name`. Fails with
    /// `SessionLaunchError` on non-zero tool exit.
    fn start_session(&self, session_name: &str, script_path: &Path) -> AppResult<()>;

    /// Configures the session to append subsequent pane output to
    /// `log_path`. Best-effort: a failure here is logged, not fatal, since
    /// the task's own script already redirects nothing of consequence.
    fn attach_output(&self, session_name: &str, log_path: &Path) -> AppResult<()>;

    fn has_session(&self, session_name: &str) -> bool;

    /// Idempotent: killing an already-gone session is not an error.
    fn kill_session(&self, session_name: &str) -> AppResult<()>;
}

pub struct TmuxSessionHost;

impl TmuxSessionHost {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TmuxSessionHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHost for TmuxSessionHost {
    fn ensure_available(&self) -> AppResult<()> {
        std::process::Command::new("tmux")
            .arg("-V")
            .output()
            .map_err(|err| AppError::SessionUnavailable(format!("tmux not on PATH: {err}")))
            .and_then(|output| {
                if output.status.success() {
                    Ok(())
                } else {
                    Err(AppError::SessionUnavailable(
                        "tmux -V exited with a non-zero status".to_string(),
                    ))
                }
            })
    }

    fn start_session(&self, session_name: &str, script_path: &Path) -> AppResult<()> {
        let script = script_path
            .to_str()
            .ok_or_else(|| AppError::SessionLaunchError("script path is not valid UTF-8".to_string()))?;

        let output = Tmux::new()
            .add_command(NewSession::new().detached().session_name(session_name))
            .output()
            .map_err(|err| AppError::SessionLaunchError(format!("failed to start tmux session: {err}")))?;
        if !output.success() {
            return Err(AppError::SessionLaunchError(format!(
                "tmux new-session exited non-zero: {}",
                String::from_utf8_lossy(&output.stderr())
            )));
        }

        // Allow the session's shell to finish initializing before feeding it
        // a command.
        std::thread::sleep(Duration::from_secs(1));

        let command = format!("bash {script}");
        Tmux::new()
            .add_command(SendKeys::new().target_pane(session_name).key(&command))
            .add_command(SendKeys::new().target_pane(session_name).key("Enter"))
            .output()
            .map_err(|err| AppError::SessionLaunchError(format!("failed to feed wrapper script to session: {err}")))?;
        Ok(())
    }

    fn attach_output(&self, session_name: &str, log_path: &Path) -> AppResult<()> {
        let log_path_str = log_path
            .to_str()
            .ok_or_else(|| AppError::SessionLaunchError("log path is not valid UTF-8".to_string()))?;

        Tmux::with_command(
            PipePane::new()
                .target_pane(session_name)
                .open()
                .shell_command(format!("cat >> {log_path_str}")),
        )
        .output()
        .map(|_| ())
        .map_err(|err| AppError::SessionLaunchError(format!("failed to enable pipe-pane: {err}")))
    }

    fn has_session(&self, session_name: &str) -> bool {
        Tmux::with_command(HasSession::new().target_session(session_name))
            .output()
            .map(|output| output.success())
            .unwrap_or(false)
    }

    fn kill_session(&self, session_name: &str) -> AppResult<()> {
        if !self.has_session(session_name) {
            return Ok(());
        }
        Tmux::with_command(PipePane::new().target_pane(session_name))
            .output()
            .ok();
        Tmux::with_command(KillSession::new().target_session(session_name))
            .output()
            .map(|_| ())
            .map_err(|err| AppError::Internal(format!("failed to kill tmux session {session_name}: {err}")))
    }
}

/// Test double recording sessions in memory instead of shelling out to tmux.
#[cfg(test)]
pub struct FakeSessionHost {
    pub sessions: std::sync::Mutex<std::collections::HashSet<String>>,
    pub available: bool,
    pub fail_launch: bool,
}

#[cfg(test)]
impl FakeSessionHost {
    pub fn new() -> Self {
        Self {
            sessions: std::sync::Mutex::new(std::collections::HashSet::new()),
            available: true,
            fail_launch: false,
        }
    }
}

#[cfg(test)]
impl Default for FakeSessionHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl SessionHost for FakeSessionHost {
    fn ensure_available(&self) -> AppResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(AppError::SessionUnavailable("fake session host disabled".to_string()))
        }
    }

    fn start_session(&self, session_name: &str, _script_path: &Path) -> AppResult<()> {
        if self.fail_launch {
            return Err(AppError::SessionLaunchError("fake launch failure".to_string()));
        }
        self.sessions.lock().unwrap().insert(session_name.to_string());
        Ok(())
    }

    fn attach_output(&self, _session_name: &str, _log_path: &Path) -> AppResult<()> {
        Ok(())
    }

    fn has_session(&self, session_name: &str) -> bool {
        self.sessions.lock().unwrap().contains(session_name)
    }

    fn kill_session(&self, session_name: &str) -> AppResult<()> {
        self.sessions.lock().unwrap().remove(session_name);
        Ok(())
    }
}
