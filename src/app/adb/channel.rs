use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::paths::validate_device_path;
use crate::app::adb::runner::{run_adb, CommandOutput};
use crate::app::channel::{shell_quote, RemoteChannel};
use crate::app::config::EngineConfig;
use crate::app::error::AppError;

/// `RemoteChannel` backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbChannel {
    program: String,
    step_timeout: Duration,
    command_timeout: Duration,
}

impl AdbChannel {
    pub fn new(program: impl Into<String>, step_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            step_timeout,
            command_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.adb_program(),
            Duration::from_secs(config.device.step_timeout_secs),
            Duration::from_secs(config.device.command_timeout_secs),
        )
    }

    fn shell(
        &self,
        device_id: &str,
        command: String,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        debug!(trace_id = %trace_id, serial = %device_id, command = %command, "adb shell");
        run_adb(
            &self.program,
            device_id,
            &["shell".to_string(), command],
            timeout,
            trace_id,
        )
    }

    fn checked_shell(
        &self,
        device_id: &str,
        command: String,
        action: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let output = self.shell(device_id, command, self.step_timeout, trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("{action} failed: {}", output.failure_reason()),
                trace_id,
            ));
        }
        Ok(())
    }
}

fn checked_path(remote_path: &str, trace_id: &str) -> Result<(), AppError> {
    validate_device_path(remote_path).map_err(|message| AppError::validation(message, trace_id))
}

impl RemoteChannel for AdbChannel {
    fn ensure_directory(
        &self,
        device_id: &str,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        checked_path(remote_path, trace_id)?;
        self.checked_shell(
            device_id,
            format!("mkdir -p {}", shell_quote(remote_path)),
            "mkdir",
            trace_id,
        )
    }

    fn push_file(
        &self,
        device_id: &str,
        local_path: &Path,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        checked_path(remote_path, trace_id)?;
        let args = vec![
            "push".to_string(),
            local_path.to_string_lossy().to_string(),
            remote_path.to_string(),
        ];
        let output = run_adb(&self.program, device_id, &args, self.command_timeout, trace_id)
            .map_err(|err| AppError::transfer(err.error, trace_id))?;
        if !output.success() {
            return Err(AppError::transfer(
                format!("Push failed: {}", output.failure_reason()),
                trace_id,
            ));
        }
        Ok(())
    }

    fn set_executable(
        &self,
        device_id: &str,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        checked_path(remote_path, trace_id)?;
        self.checked_shell(
            device_id,
            format!("chmod +x {}", shell_quote(remote_path)),
            "chmod",
            trace_id,
        )
    }

    fn run_shell(
        &self,
        device_id: &str,
        command: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        self.shell(device_id, command.to_string(), self.command_timeout, trace_id)
    }

    fn remove_file(&self, device_id: &str, remote_path: &str, trace_id: &str) -> Result<(), AppError> {
        checked_path(remote_path, trace_id)?;
        self.checked_shell(
            device_id,
            format!("rm -f {}", shell_quote(remote_path)),
            "rm",
            trace_id,
        )
    }
}
