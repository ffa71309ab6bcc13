//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::app::adb::runner::CommandOutput;
use crate::app::channel::RemoteChannel;
use crate::app::config::{EngineConfig, LauncherSettings};
use crate::app::error::AppError;
use crate::app::models::ExecutionEvent;
use crate::app::worker::EventSink;

pub const ENSURE_DIRECTORY: &str = "ensure_directory";
pub const PUSH_FILE: &str = "push_file";
pub const SET_EXECUTABLE: &str = "set_executable";
pub const RUN_SHELL: &str = "run_shell";
pub const REMOVE_FILE: &str = "remove_file";

/// Records every call; operations listed in `failing` return an error.
pub struct FakeChannel {
    calls: Mutex<Vec<(String, String)>>,
    failing: HashSet<&'static str>,
    shell_output: CommandOutput,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::failing(&[])
    }

    pub fn failing(ops: &[&'static str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: ops.iter().copied().collect(),
            shell_output: CommandOutput {
                stdout: "device says hi\n".to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            },
        }
    }

    pub fn with_shell_output(mut self, output: CommandOutput) -> Self {
        self.shell_output = output;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(op, _)| op.clone())
            .collect()
    }

    pub fn argument(&self, op: &str) -> Option<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .find(|(name, _)| name == op)
            .map(|(_, arg)| arg.clone())
    }

    fn record(&self, op: &'static str, arg: String, trace_id: &str) -> Result<(), AppError> {
        self.calls.lock().expect("calls").push((op.to_string(), arg));
        if self.failing.contains(op) {
            let err = if op == PUSH_FILE {
                AppError::transfer(format!("{op} refused"), trace_id)
            } else {
                AppError::dependency(format!("{op} refused"), trace_id)
            };
            return Err(err);
        }
        Ok(())
    }
}

impl RemoteChannel for FakeChannel {
    fn ensure_directory(&self, device_id: &str, remote_path: &str, trace_id: &str) -> Result<(), AppError> {
        self.record(ENSURE_DIRECTORY, format!("{device_id}:{remote_path}"), trace_id)
    }

    fn push_file(
        &self,
        device_id: &str,
        local_path: &Path,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        self.record(
            PUSH_FILE,
            format!("{device_id}:{}->{remote_path}", local_path.display()),
            trace_id,
        )
    }

    fn set_executable(&self, device_id: &str, remote_path: &str, trace_id: &str) -> Result<(), AppError> {
        self.record(SET_EXECUTABLE, format!("{device_id}:{remote_path}"), trace_id)
    }

    fn run_shell(&self, device_id: &str, command: &str, trace_id: &str) -> Result<CommandOutput, AppError> {
        self.record(RUN_SHELL, format!("{device_id}:{command}"), trace_id)?;
        Ok(self.shell_output.clone())
    }

    fn remove_file(&self, device_id: &str, remote_path: &str, trace_id: &str) -> Result<(), AppError> {
        self.record(REMOVE_FILE, format!("{device_id}:{remote_path}"), trace_id)
    }
}

/// Config rooted in `dir` that runs host scripts with `sh`, including batch scripts on Unix.
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_data_dir(dir);
    config.host.posix_shell = "sh".to_string();
    if !cfg!(windows) {
        config.host.windows_shim = Some(LauncherSettings {
            program: "sh".to_string(),
            args: Vec::new(),
        });
    }
    config.execution.cancel_grace_ms = 1000;
    config.execution.output_drain_ms = 500;
    config
}

pub fn collecting_sink() -> (EventSink, mpsc::Receiver<ExecutionEvent>) {
    let (tx, rx) = mpsc::channel::<ExecutionEvent>();
    let tx = Arc::new(Mutex::new(tx));
    let sink: EventSink = Arc::new(move |event| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(event);
        }
    });
    (sink, rx)
}

/// Collects events for `execution_id` until its finished event or the timeout.
pub fn collect_until_finished(
    rx: &mpsc::Receiver<ExecutionEvent>,
    execution_id: &str,
    timeout: Duration,
) -> Vec<ExecutionEvent> {
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < timeout {
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
            if event.execution_id() != execution_id {
                continue;
            }
            let finished = event.is_finished();
            events.push(event);
            if finished {
                break;
            }
        }
    }
    events
}
