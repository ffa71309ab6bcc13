use std::path::Path;

use crate::app::adb::runner::CommandOutput;
use crate::app::error::AppError;

/// Device operations the deploy protocol relies on.
///
/// Implementations must be callable from many worker threads at once.
pub trait RemoteChannel: Send + Sync {
    fn ensure_directory(&self, device_id: &str, remote_path: &str, trace_id: &str)
        -> Result<(), AppError>;

    fn push_file(
        &self,
        device_id: &str,
        local_path: &Path,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<(), AppError>;

    fn set_executable(&self, device_id: &str, remote_path: &str, trace_id: &str)
        -> Result<(), AppError>;

    /// Runs `command` in the device shell and returns once it has finished.
    ///
    /// There is no incremental streaming: callers receive the whole stdout/stderr at the end.
    fn run_shell(&self, device_id: &str, command: &str, trace_id: &str)
        -> Result<CommandOutput, AppError>;

    fn remove_file(&self, device_id: &str, remote_path: &str, trace_id: &str)
        -> Result<(), AppError>;
}

/// Single-quotes `value` for the device shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
