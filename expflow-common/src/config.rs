//! Configuration loading and config file resolution
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. User config directory (`~/.config/expflow/expflow.toml` on Linux)
//! 4. Compiled defaults (no file)
//!
//! A missing file is never fatal: a warning is logged and defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "EXPFLOW_CONFIG";

/// Config file name inside the user config directory
pub const CONFIG_FILE_NAME: &str = "expflow.toml";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter level when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Parameters used when the runner begins a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_study_name")]
    pub study_name: String,
    #[serde(default = "default_session_number")]
    pub session_number: u32,
    #[serde(default)]
    pub participant_details: Map<String, Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            study_name: default_study_name(),
            session_number: default_session_number(),
            participant_details: Map::new(),
            settings: Map::new(),
        }
    }
}

/// Where block configuration comes from
///
/// Selected once at startup; the kind cannot change while a controller runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Preloaded JSON list of block configs
    Local {
        participant_index: i64,
        config_file: PathBuf,
    },
    /// Remote experiment server
    Remote {
        server_url: String,
        #[serde(default = "default_retry_delay_ms")]
        retry_delay_ms: u64,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
        /// Force the server to this block index at session start
        #[serde(default)]
        start_from_block: Option<u32>,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Remote {
            server_url: default_server_url(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            start_from_block: None,
        }
    }
}

/// In-memory runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Trials created for a block whose config has no `trial_count`
    #[serde(default = "default_trials_per_block")]
    pub default_trials_per_block: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_trials_per_block: default_trials_per_block(),
        }
    }
}

/// Operator HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_study_name() -> String {
    "study".to_string()
}

fn default_session_number() -> u32 {
    1
}

fn default_server_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

pub fn default_retry_delay_ms() -> u64 {
    5000
}

pub fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_trials_per_block() -> u32 {
    1
}

fn default_bind_addr() -> String {
    "127.0.0.1:5730".to_string()
}

fn default_event_capacity() -> usize {
    100
}

/// Resolve which config file to read, if any
///
/// Returns `None` when no candidate exists; the caller then runs on defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    dirs::config_dir()
        .map(|d| d.join("expflow").join(CONFIG_FILE_NAME))
        .filter(|p| p.exists())
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

impl TomlConfig {
    /// Load configuration following the resolution priority
    ///
    /// A missing file degrades to defaults with a warning. A file that exists
    /// but does not parse is an error.
    pub fn load(cli_arg: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_arg, CONFIG_ENV_VAR) {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                load_toml_config(&path)
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                warn!("No config file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }
}
