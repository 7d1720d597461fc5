use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from `~/.relay/config.toml`.
///
/// Every section defaults independently, so a file only needs the keys it
/// wants to override.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Load config from `~/.relay/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.execution.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
            .join("config.toml")
    }

    /// `<project>/<auto_dir>/<specs_dir>`
    pub fn specs_root(&self, project_path: &Path) -> PathBuf {
        project_path
            .join(&self.agent.auto_dir)
            .join(&self.paths.specs_dir)
    }

    /// `<project>/<auto_dir>/<env_file>`
    pub fn project_env_path(&self, project_path: &Path) -> PathBuf {
        project_path
            .join(&self.agent.auto_dir)
            .join(&self.paths.env_file)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be 'pretty' or 'json', got '{other}'"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

/// How the external agent runner is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Directory the runner scripts live in and are launched from. Defaults
    /// to the project directory.
    #[serde(default)]
    pub runner_dir: Option<String>,
    /// Script driving planning, coding and QA for an existing spec.
    #[serde(default = "default_runner_script")]
    pub runner_script: String,
    /// Script authoring a spec from a task description.
    #[serde(default = "default_spec_runner_script")]
    pub spec_runner_script: String,
    /// Per-project directory holding specs and the env file.
    #[serde(default = "default_auto_dir")]
    pub auto_dir: String,
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            runner_dir: None,
            runner_script: default_runner_script(),
            spec_runner_script: default_spec_runner_script(),
            auto_dir: default_auto_dir(),
            dev_mode: false,
        }
    }
}

fn default_interpreter() -> String {
    "python3".into()
}
fn default_runner_script() -> String {
    "run.py".into()
}
fn default_spec_runner_script() -> String {
    "spec_runner.py".into()
}
fn default_auto_dir() -> String {
    ".auto-claude".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub parallel_enabled: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Seconds between the graceful and the forced termination signal.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_true")]
    pub auto_continue: bool,
    /// Pass the forced-approval flag; a start from the board already is
    /// the user's approval.
    #[serde(default = "default_true")]
    pub force_approval: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallel_enabled: false,
            max_workers: default_max_workers(),
            kill_grace_secs: default_kill_grace_secs(),
            auto_continue: true,
            force_approval: true,
        }
    }
}

impl ExecutionConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Validation(
                "execution.max_workers must be at least 1".into(),
            ));
        }
        if self.kill_grace_secs == 0 {
            return Err(ConfigError::Validation(
                "execution.kill_grace_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_workers() -> u32 {
    2
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Relative to `agent.auto_dir`.
    #[serde(default = "default_specs_dir")]
    pub specs_dir: String,
    /// Relative to `agent.auto_dir`.
    #[serde(default = "default_env_file")]
    pub env_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            specs_dir: default_specs_dir(),
            env_file: default_env_file(),
        }
    }
}

fn default_specs_dir() -> String {
    "specs".into()
}
fn default_env_file() -> String {
    ".env".into()
}
