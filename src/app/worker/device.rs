use std::path::PathBuf;
use std::sync::PoisonError;

use tracing::{info, warn};

use crate::app::adb::paths::{device_parent_dir, remote_script_path};
use crate::app::channel::shell_quote;
use crate::app::models::FAILURE_EXIT_CODE;
use crate::app::worker::{Emitter, WorkerContext};

/// Deploy protocol: ensure dir, push, chmod, run, remove.
///
/// Only the push is fatal. Directory creation, chmod and cleanup failures become `Warning:` lines
/// in the output stream. The remote command runs to completion before its output is emitted.
pub fn run(ctx: &WorkerContext, emitter: &Emitter) -> i32 {
    let trace_id = ctx.trace_id.as_str();
    let Some(device_id) = ctx
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        emitter.error("Device ID required for device script execution\n");
        return FAILURE_EXIT_CODE;
    };

    let local_path = PathBuf::from(&ctx.script.path);
    if !local_path.is_file() {
        emitter.error(format!("Script file not found: {}\n", local_path.display()));
        return FAILURE_EXIT_CODE;
    }

    let device_lock = ctx.scheduler.device_lock(device_id);
    let _device_guard = device_lock.lock().unwrap_or_else(PoisonError::into_inner);
    if ctx.control.is_cancelled() {
        return FAILURE_EXIT_CODE;
    }

    let remote_path = remote_script_path(ctx.config.device.remote_dir.trim_end_matches('/'), &local_path);
    let remote_dir = device_parent_dir(&remote_path);
    let channel = ctx.channel.as_ref();

    if let Err(err) = channel.ensure_directory(device_id, &remote_dir, trace_id) {
        warn!(trace_id = %trace_id, serial = %device_id, error = %err.error, "mkdir failed");
        emitter.output(format!("Warning: Could not create directory {remote_dir}: {}\n", err.error));
    }

    if let Err(err) = channel.push_file(device_id, &local_path, &remote_path, trace_id) {
        warn!(trace_id = %trace_id, serial = %device_id, error = %err.error, "push failed");
        emitter.error(format!("Failed to push script to device: {}\n", err.error));
        return FAILURE_EXIT_CODE;
    }
    emitter.output(format!("Script pushed to device: {remote_path}\n"));

    let exit_code = if ctx.control.is_cancelled() {
        FAILURE_EXIT_CODE
    } else {
        if let Err(err) = channel.set_executable(device_id, &remote_path, trace_id) {
            emitter.output(format!("Warning: Could not make script executable: {}\n", err.error));
        }

        let command = format!(
            "{} {}",
            ctx.config.device.remote_interpreter.trim(),
            shell_quote(&remote_path)
        );
        match channel.run_shell(device_id, &command, trace_id) {
            Ok(output) => {
                emitter.output(output.stdout);
                emitter.error(output.stderr);
                output.exit_code.unwrap_or(FAILURE_EXIT_CODE)
            }
            Err(err) => {
                warn!(trace_id = %trace_id, serial = %device_id, error = %err.error, "remote run failed");
                emitter.error(format!("Failed to run script on device: {}\n", err.error));
                FAILURE_EXIT_CODE
            }
        }
    };

    if let Err(err) = channel.remove_file(device_id, &remote_path, trace_id) {
        emitter.output(format!("Warning: Could not cleanup script: {}\n", err.error));
    }

    info!(
        trace_id = %trace_id,
        serial = %device_id,
        execution_id = %ctx.execution_id,
        exit_code,
        "device script finished"
    );
    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tempfile::TempDir;

    use crate::app::adb::runner::CommandOutput;
    use crate::app::models::{ExecutionEvent, Script, ScriptKind};
    use crate::app::scheduler::TaskScheduler;
    use crate::app::testing::{
        collect_until_finished, collecting_sink, test_config, FakeChannel, ENSURE_DIRECTORY,
        PUSH_FILE, REMOVE_FILE, RUN_SHELL, SET_EXECUTABLE,
    };
    use crate::app::worker::{ExecutionWorker, WorkerControl};

    fn run_getprop(channel: Arc<FakeChannel>, device_id: Option<&str>) -> (TempDir, Vec<ExecutionEvent>) {
        let tmp = TempDir::new().expect("tmp");
        let body = tmp.path().join("getprop.sh");
        std::fs::write(&body, "getprop ro.product.model\n").expect("write");

        let script = Script {
            id: "script-1".to_string(),
            name: "Model".to_string(),
            kind: ScriptKind::Device,
            path: body.to_string_lossy().to_string(),
            description: String::new(),
            created_at: Utc::now(),
            last_run: None,
            run_count: 0,
            is_template: false,
            is_visible: true,
        };
        let (sink, rx) = collecting_sink();
        let ctx = WorkerContext {
            script,
            execution_id: "exec-1".to_string(),
            device_id: device_id.map(str::to_string),
            trace_id: "trace-dev".to_string(),
            config: Arc::new(test_config(tmp.path())),
            channel,
            scheduler: Arc::new(TaskScheduler::new(2)),
            control: WorkerControl::new(),
        };
        ExecutionWorker::new(ctx, sink).run();
        let events = collect_until_finished(&rx, "exec-1", Duration::from_secs(2));
        (tmp, events)
    }

    fn finished_code(events: &[ExecutionEvent]) -> Option<i32> {
        events.iter().find_map(|event| match event {
            ExecutionEvent::Finished { exit_code, .. } => Some(*exit_code),
            _ => None,
        })
    }

    fn text(events: &[ExecutionEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                ExecutionEvent::Output { chunk, .. } | ExecutionEvent::Error { chunk, .. } => {
                    Some(chunk.as_str())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn runs_full_protocol_in_order() {
        let channel = Arc::new(FakeChannel::new());
        let (_tmp, events) = run_getprop(Arc::clone(&channel), Some("dev1"));

        assert_eq!(
            channel.calls(),
            vec![ENSURE_DIRECTORY, PUSH_FILE, SET_EXECUTABLE, RUN_SHELL, REMOVE_FILE]
        );
        assert_eq!(
            channel.argument(RUN_SHELL).as_deref(),
            Some("dev1:sh '/sdcard/lazy_blacktea_scripts/getprop.sh'")
        );
        assert_eq!(finished_code(&events), Some(0));
        assert!(text(&events).contains("device says hi"));
        assert!(matches!(events.first(), Some(ExecutionEvent::Started { .. })));
    }

    #[test]
    fn push_failure_short_circuits_remaining_steps() {
        let channel = Arc::new(FakeChannel::failing(&[PUSH_FILE]));
        let (_tmp, events) = run_getprop(Arc::clone(&channel), Some("dev1"));

        assert_eq!(channel.calls(), vec![ENSURE_DIRECTORY, PUSH_FILE]);
        assert_eq!(finished_code(&events), Some(FAILURE_EXIT_CODE));
        assert!(text(&events).contains("Failed to push script to device"));
    }

    #[test]
    fn best_effort_failures_only_warn() {
        let channel = Arc::new(FakeChannel::failing(&[ENSURE_DIRECTORY, SET_EXECUTABLE, REMOVE_FILE]));
        let (_tmp, events) = run_getprop(Arc::clone(&channel), Some("dev1"));

        assert_eq!(channel.calls().len(), 5);
        assert_eq!(finished_code(&events), Some(0));
        let text = text(&events);
        assert!(text.contains("Warning: Could not create directory"));
        assert!(text.contains("Warning: Could not make script executable"));
        assert!(text.contains("Warning: Could not cleanup script"));
    }

    #[test]
    fn remote_exit_code_decides_result() {
        let channel = Arc::new(FakeChannel::new().with_shell_output(CommandOutput {
            stdout: String::new(),
            stderr: "getprop: not found\n".to_string(),
            exit_code: Some(127),
        }));
        let (_tmp, events) = run_getprop(Arc::clone(&channel), Some("dev1"));

        assert_eq!(finished_code(&events), Some(127));
        assert!(events.iter().any(|event| matches!(
            event,
            ExecutionEvent::Error { chunk, .. } if chunk.contains("not found")
        )));
        assert!(channel.calls().contains(&REMOVE_FILE.to_string()));
    }

    #[test]
    fn missing_device_never_touches_channel() {
        let channel = Arc::new(FakeChannel::new());
        let (_tmp, events) = run_getprop(Arc::clone(&channel), Some("  "));

        assert!(channel.calls().is_empty());
        assert_eq!(finished_code(&events), Some(FAILURE_EXIT_CODE));
    }
}
