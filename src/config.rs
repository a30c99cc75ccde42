//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen endpoint, `ip:port`.
    pub listen_addr: String,
    /// Upper bound on concurrent client connections.
    pub max_connections: usize,
    /// Threads committing finished replies.
    pub output_threads: usize,
    /// Shut the server down after this many seconds of worker idleness.
    /// Zero never times out.
    pub idle_timeout_secs: u64,
    /// Force a worker teardown after this many seconds of holding the
    /// resource. Zero tears down whenever the queue drains.
    pub release_interval_secs: u64,
    /// Rotate off the current user after this long even if work remains.
    /// Zero switches at every dispatch.
    pub period_per_user_ms: u64,
    /// How long the dispatcher waits for an in-flight reinit upload when the
    /// queue is otherwise empty.
    pub reinit_grace_ms: u64,
    /// Idle sessions older than this are evicted.
    pub session_timeout_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:15732".to_string(),
            max_connections: 1 << 16,
            output_threads: 4,
            idle_timeout_secs: 0,
            release_interval_secs: 0,
            period_per_user_ms: 500,
            reinit_grace_ms: 20,
            session_timeout_secs: 300,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn release_interval(&self) -> Duration {
        Duration::from_secs(self.release_interval_secs)
    }

    pub fn period_per_user(&self) -> Duration {
        Duration::from_millis(self.period_per_user_ms)
    }

    pub fn reinit_grace(&self) -> Duration {
        Duration::from_millis(self.reinit_grace_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError {
        reason: format!("failed to parse {}: {e}", path.display()),
    })
}

/// Load the file if present, otherwise fall back to defaults (warning on a
/// broken file rather than refusing to start).
pub fn load_or_default(path: Option<&Path>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };
    match load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            Config::default()
        }
    }
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| ConfigError {
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;
    }
    let contents = toml::to_string_pretty(cfg).map_err(|e| ConfigError {
        reason: format!("failed to render config: {e}"),
    })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError {
        reason: "config path missing parent directory".to_string(),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError {
        reason: format!("failed to create temp file in {}: {e}", dir.display()),
    })?;
    fs::write(temp.path(), data).map_err(|e| ConfigError {
        reason: format!("failed to write config temp file: {e}"),
    })?;
    temp.persist(path).map_err(|e| ConfigError {
        reason: format!("failed to persist config to {}: {e}", path.display()),
    })?;
    Ok(())
}
