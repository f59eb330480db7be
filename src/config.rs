use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::get_config_dir;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Directory holding `tasks.db` and `tasks/task_{id}/`.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Scheduler tick period, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Absolute path to a shell script sourced before `conda activate <env>`
    /// when a task sets `conda_env`. Falls back to the bare `CONDA_INIT_SCRIPT`
    /// environment variable if unset (see `conda_init_script`).
    #[serde(default)]
    pub conda_init_script: Option<PathBuf>,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `CONDA_INIT_SCRIPT` is an external contract (documented in the
    /// HTTP/operator-facing surface), so it is read directly rather than
    /// through the `GPUTASK_`-prefixed environment layer.
    pub fn resolved_conda_init_script(&self) -> Option<PathBuf> {
        self.conda_init_script
            .clone()
            .or_else(|| std::env::var_os("CONDA_INIT_SCRIPT").map(PathBuf::from))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            runtime_dir: default_runtime_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            conda_init_script: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Frontend origins allowed by CORS.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:1895".to_string(),
        "http://127.0.0.1:1895".to_string(),
    ]
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_runtime_dir() -> PathBuf {
    get_config_dir()
        .map(|d| d.join("runtime"))
        .unwrap_or_else(|_| PathBuf::from("runtime"))
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("config file {config_path:?} not found");
        }
    }

    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("gputask.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(config::Environment::with_prefix("GPUTASK").separator("_"))
        .build()?
        .try_deserialize()
}
