use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::config::HostSettings;
use crate::app::error::AppError;
use crate::app::models::{ScriptKind, FAILURE_EXIT_CODE};
use crate::app::worker::{Emitter, WorkerContext};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pub program: String,
    pub args: Vec<String>,
}

/// Picks the interpreter for a host script on the current OS.
pub fn resolve_launcher(
    kind: ScriptKind,
    script_path: &Path,
    host: &HostSettings,
    trace_id: &str,
) -> Result<Launcher, AppError> {
    let path = script_path.to_string_lossy().to_string();
    match kind {
        ScriptKind::HostWindows if cfg!(windows) => Ok(Launcher {
            program: "cmd.exe".to_string(),
            args: vec!["/C".to_string(), path],
        }),
        ScriptKind::HostWindows => match &host.windows_shim {
            Some(shim) => {
                let mut args = shim.args.clone();
                args.push(path);
                Ok(Launcher {
                    program: shim.program.clone(),
                    args,
                })
            }
            None => Err(AppError::unsupported_platform(
                "Cannot execute a Windows batch script on this host: no Windows shim is configured",
                trace_id,
            )),
        },
        ScriptKind::HostPosix => Ok(Launcher {
            program: host.posix_shell.clone(),
            args: vec![path],
        }),
        ScriptKind::Device => Err(AppError::validation(
            "Device scripts cannot be launched on the host",
            trace_id,
        )),
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Length of the prefix of `bytes` that can be decoded now; an incomplete trailing UTF-8
/// sequence is held back for the next read.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

fn stream_chunks<R: Read + Send + 'static>(
    mut reader: R,
    stream: Stream,
    emitter: Emitter,
    done: mpsc::Sender<()>,
    trace_id: String,
) {
    std::thread::spawn(move || {
        let mut temp = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let read_count = match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => count,
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "failed to read script output");
                    break;
                }
            };
            pending.extend_from_slice(&temp[..read_count]);
            let ready = complete_utf8_prefix(&pending);
            if ready == 0 {
                continue;
            }
            let chunk = String::from_utf8_lossy(&pending[..ready]).to_string();
            pending.drain(..ready);
            match stream {
                Stream::Stdout => emitter.output(chunk),
                Stream::Stderr => emitter.error(chunk),
            }
        }
        if !pending.is_empty() {
            let chunk = String::from_utf8_lossy(&pending).to_string();
            match stream {
                Stream::Stdout => emitter.output(chunk),
                Stream::Stderr => emitter.error(chunk),
            }
        }
        let _ = done.send(());
    });
}

/// Relative script paths are resolved against the engine's working directory, since the child
/// runs from the script's own directory.
fn absolute_script_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Runs a host script and returns its exit code, or [`FAILURE_EXIT_CODE`] when there is none.
pub fn run(ctx: &WorkerContext, emitter: &Emitter) -> i32 {
    let script_path = absolute_script_path(Path::new(&ctx.script.path));
    if !script_path.is_file() {
        emitter.error(format!("Script file not found: {}\n", script_path.display()));
        return FAILURE_EXIT_CODE;
    }

    let launcher = match resolve_launcher(ctx.script.kind, &script_path, &ctx.config.host, &ctx.trace_id)
    {
        Ok(launcher) => launcher,
        Err(err) => {
            warn!(trace_id = %ctx.trace_id, code = %err.code, error = %err.error, "no launcher");
            emitter.error(format!("{}\n", err.error));
            return FAILURE_EXIT_CODE;
        }
    };

    let working_dir = script_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut command = Command::new(&launcher.program);
    command
        .args(&launcher.args)
        .current_dir(&working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let err = AppError::spawn(
                format!("Failed to start {}: {err}", launcher.program),
                &ctx.trace_id,
            );
            warn!(trace_id = %ctx.trace_id, error = %err.error, "script spawn failed");
            emitter.error(format!("{}: {}\n", err.code, err.error));
            return FAILURE_EXIT_CODE;
        }
    };
    debug!(
        trace_id = %ctx.trace_id,
        execution_id = %ctx.execution_id,
        program = %launcher.program,
        "script process started"
    );

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let mut readers = 0usize;
    if let Some(stdout) = child.stdout.take() {
        stream_chunks(stdout, Stream::Stdout, emitter.clone(), done_tx.clone(), ctx.trace_id.clone());
        readers += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        stream_chunks(stderr, Stream::Stderr, emitter.clone(), done_tx.clone(), ctx.trace_id.clone());
        readers += 1;
    }
    drop(done_tx);

    let holder = ctx.control.child_holder();
    {
        let mut guard = holder.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(child);
    }
    // A cancel that landed before the child was registered had nothing to kill.
    if ctx.control.is_cancelled() {
        ctx.control.request_cancel();
    }

    let grace = ctx.config.execution.cancel_grace();
    let mut cancelled_at: Option<Instant> = None;
    let exit_code = loop {
        let status = {
            let mut guard = holder.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(child) => child.try_wait(),
                None => break None,
            }
        };
        match status {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if ctx.control.is_cancelled() {
                    let since = *cancelled_at.get_or_insert_with(Instant::now);
                    if since.elapsed() >= grace {
                        warn!(
                            trace_id = %ctx.trace_id,
                            execution_id = %ctx.execution_id,
                            "script did not exit within the cancel grace period"
                        );
                        break None;
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                warn!(trace_id = %ctx.trace_id, error = %err, "failed to poll script process");
                break None;
            }
        }
    };
    {
        let mut guard = holder.lock().unwrap_or_else(PoisonError::into_inner);
        guard.take();
    }

    // Grandchildren may keep the pipes open after the script exits; don't wait on them forever.
    let deadline = Instant::now() + ctx.config.execution.output_drain();
    for _ in 0..readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done_rx.recv_timeout(remaining).is_err() {
            debug!(trace_id = %ctx.trace_id, "output readers still open after drain timeout");
            break;
        }
    }

    exit_code.unwrap_or(FAILURE_EXIT_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::LauncherSettings;

    #[test]
    fn posix_scripts_use_configured_shell() {
        let host = HostSettings {
            posix_shell: "sh".to_string(),
            windows_shim: None,
        };
        let launcher =
            resolve_launcher(ScriptKind::HostPosix, Path::new("/s/run.sh"), &host, "t").expect("launcher");
        assert_eq!(launcher.program, "sh");
        assert_eq!(launcher.args, vec!["/s/run.sh".to_string()]);
    }

    #[test]
    fn windows_scripts_need_cmd_or_shim() {
        let mut host = HostSettings::default();
        let result = resolve_launcher(ScriptKind::HostWindows, Path::new("/s/run.bat"), &host, "t-w");
        if cfg!(windows) {
            assert_eq!(result.expect("launcher").program, "cmd.exe");
        } else {
            let err = result.expect_err("unsupported");
            assert_eq!(err.code, "ERR_UNSUPPORTED_PLATFORM");
            assert_eq!(err.trace_id, "t-w");

            host.windows_shim = Some(LauncherSettings {
                program: "wine".to_string(),
                args: vec!["cmd".to_string(), "/c".to_string()],
            });
            let launcher = resolve_launcher(ScriptKind::HostWindows, Path::new("/s/run.bat"), &host, "t")
                .expect("shim");
            assert_eq!(launcher.program, "wine");
            assert_eq!(launcher.args, vec!["cmd", "/c", "/s/run.bat"]);
        }
    }

    #[test]
    fn device_kind_is_not_a_host_launcher() {
        let err = resolve_launcher(ScriptKind::Device, Path::new("/s/x.sh"), &HostSettings::default(), "t")
            .expect_err("err");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn utf8_prefix_holds_back_split_sequences() {
        let text = "é".as_bytes();
        assert_eq!(complete_utf8_prefix(b"abc"), 3);
        assert_eq!(complete_utf8_prefix(&[b'a', text[0]]), 1);
        assert_eq!(complete_utf8_prefix(&[b'a', 0xff, b'b']), 3);
    }
}
