pub mod gpu;
pub mod launcher;
pub mod manager;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod task;

use std::path::PathBuf;

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("gputask"))
}
