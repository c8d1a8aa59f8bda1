use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ProcessError, Result};

/// Top-level configuration loaded from `stepgraph.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Knobs of the process runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on step activations per `start`/`resume` call.
    #[serde(default = "default_max_activations")]
    pub max_activations: usize,
    /// Upper bound on element activations of one map running at once.
    #[serde(default = "default_max_map_concurrency")]
    pub max_map_concurrency: usize,
    /// Write step state and join buffers to the storage connector.
    #[serde(default = "default_persist")]
    pub persist: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_activations: default_max_activations(),
            max_map_concurrency: default_max_map_concurrency(),
            persist: default_persist(),
        }
    }
}

fn default_max_activations() -> usize {
    10_000
}
fn default_max_map_concurrency() -> usize {
    8
}
fn default_persist() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file, used by the sqlite backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String {
    "~/.stepgraph/state.db".to_string()
}

/// JSONL run log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary, 2 = + joins, maps and errors, 3 = + every step.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_dir() -> String {
    "~/.stepgraph/logs".to_string()
}
fn default_log_level() -> u8 {
    2
}

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ProcessError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| ProcessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_activations == 0 {
            return Err(ProcessError::Config(
                "engine.max_activations must be at least 1".into(),
            ));
        }
        if self.engine.max_map_concurrency == 0 {
            return Err(ProcessError::Config(
                "engine.max_map_concurrency must be at least 1".into(),
            ));
        }
        if !(1..=3).contains(&self.log.level) {
            return Err(ProcessError::Config(format!(
                "log.level must be 1, 2 or 3 (got {})",
                self.log.level
            )));
        }
        Ok(())
    }

    /// Resolved path of the SQLite database (expands `~`).
    pub fn storage_path(&self) -> PathBuf {
        expand_home(&self.storage.path)
    }

    /// Resolved run log directory (expands `~`).
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log.log_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => {
                    warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
