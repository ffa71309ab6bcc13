use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::adb::locator::resolve_adb_program;
use crate::app::error::AppError;
use crate::app::storage::write_json_atomic;

pub const CONFIG_PATH_ENV: &str = "LAZY_BLACKTEA_SCRIPTS_CONFIG";
pub const DATA_DIR_ENV: &str = "LAZY_BLACKTEA_SCRIPTS_HOME";
const DEFAULT_DIR_NAME: &str = ".lazy_blacktea_scripts";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    /// Overrides the per-user data directory when non-empty.
    #[serde(default)]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySettings {
    pub max_age_days: i64,
    pub max_count: usize,
    pub cleanup_on_start: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_count: 100,
            cleanup_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LauncherSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSettings {
    pub posix_shell: String,
    /// Launcher used for batch scripts on hosts without `cmd.exe`.
    #[serde(default)]
    pub windows_shim: Option<LauncherSettings>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            posix_shell: "bash".to_string(),
            windows_shim: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    pub adb_command_path: String,
    pub remote_dir: String,
    pub remote_interpreter: String,
    pub step_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            adb_command_path: String::new(),
            remote_dir: "/sdcard/lazy_blacktea_scripts".to_string(),
            remote_interpreter: "sh".to_string(),
            step_timeout_secs: 30,
            command_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSettings {
    pub max_concurrent: usize,
    pub cancel_grace_ms: u64,
    pub output_drain_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            cancel_grace_ms: 3000,
            output_drain_ms: 2000,
        }
    }
}

impl ExecutionSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Config rooted at `data_dir`, everything else default. Handy for embedding and tests.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.as_ref().to_string_lossy().to_string();
        config
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        if !self.storage.data_dir.trim().is_empty() {
            return PathBuf::from(self.storage.data_dir.trim());
        }
        default_root_dir()
    }

    pub fn scripts_file(&self) -> PathBuf {
        self.data_dir().join("scripts.json")
    }

    pub fn executions_file(&self) -> PathBuf {
        self.data_dir().join("script_executions.json")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir().join("scripts")
    }

    pub fn adb_program(&self) -> String {
        resolve_adb_program(&self.device.adb_command_path)
    }
}

fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_root_dir().join("config.json")
}

pub fn load_config(trace_id: &str) -> Result<EngineConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<EngineConfig, AppError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: EngineConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &EngineConfig,
    path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    write_json_atomic(path, config, trace_id)
}

pub fn validate_config(mut config: EngineConfig) -> EngineConfig {
    let defaults = EngineConfig::default();
    if config.history.max_age_days < 1 {
        config.history.max_age_days = defaults.history.max_age_days;
    }
    if config.history.max_count == 0 {
        config.history.max_count = defaults.history.max_count;
    }
    if config.host.posix_shell.trim().is_empty() {
        config.host.posix_shell = defaults.host.posix_shell;
    }
    if config
        .host
        .windows_shim
        .as_ref()
        .is_some_and(|shim| shim.program.trim().is_empty())
    {
        config.host.windows_shim = None;
    }
    if !config.device.remote_dir.starts_with('/') || config.device.remote_dir.trim() == "/" {
        config.device.remote_dir = defaults.device.remote_dir;
    }
    if config.device.remote_interpreter.trim().is_empty() {
        config.device.remote_interpreter = defaults.device.remote_interpreter;
    }
    if config.device.step_timeout_secs == 0 {
        config.device.step_timeout_secs = defaults.device.step_timeout_secs;
    }
    if config.device.command_timeout_secs == 0 {
        config.device.command_timeout_secs = defaults.device.command_timeout_secs;
    }
    config.execution.max_concurrent = config.execution.max_concurrent.clamp(1, 64);
    if config.execution.cancel_grace_ms < 100 {
        config.execution.cancel_grace_ms = defaults.execution.cancel_grace_ms;
    }
    if config.execution.output_drain_ms < 50 {
        config.execution.output_drain_ms = defaults.execution.output_drain_ms;
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = defaults.logging.log_level;
    }
    config
}
