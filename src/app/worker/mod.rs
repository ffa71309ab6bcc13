//! One worker per execution. A worker owns its child process and cancellation flag and talks to
//! the coordinator only through its [`Emitter`].

pub mod device;
pub mod host;

use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::app::channel::RemoteChannel;
use crate::app::config::EngineConfig;
use crate::app::models::{ExecutionEvent, ExecutionStatus, Script, FAILURE_EXIT_CODE};
use crate::app::scheduler::TaskScheduler;

pub type EventSink = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;
pub type ChildHolder = Arc<Mutex<Option<Child>>>;

/// Cancellation handle shared between a worker and the coordinator.
#[derive(Clone, Default)]
pub struct WorkerControl {
    cancel_flag: Arc<AtomicBool>,
    child: ChildHolder,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel_flag
    }

    /// Raises the flag and asks the running child, if any, to terminate.
    pub fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = guard.as_mut() {
            let _ = child.kill();
        }
    }

    pub(crate) fn child_holder(&self) -> &ChildHolder {
        &self.child
    }
}

/// Event emission for one execution. After `finished` no further events leave the worker.
///
/// Emission is serialized so a reader thread cannot slip an event in behind `finished`.
#[derive(Clone)]
pub struct Emitter {
    execution_id: String,
    sink: EventSink,
    sealed: Arc<Mutex<bool>>,
}

impl Emitter {
    pub fn new(execution_id: impl Into<String>, sink: EventSink) -> Self {
        Self {
            execution_id: execution_id.into(),
            sink,
            sealed: Arc::new(Mutex::new(false)),
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        let sealed = self.sealed.lock().unwrap_or_else(PoisonError::into_inner);
        if *sealed {
            return;
        }
        (self.sink)(event);
    }

    pub fn started(&self, script_id: &str) {
        self.emit(ExecutionEvent::Started {
            execution_id: self.execution_id.clone(),
            script_id: script_id.to_string(),
        });
    }

    pub fn output(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.emit(ExecutionEvent::Output {
            execution_id: self.execution_id.clone(),
            chunk,
        });
    }

    pub fn error(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.emit(ExecutionEvent::Error {
            execution_id: self.execution_id.clone(),
            chunk,
        });
    }

    pub fn finished(&self, exit_code: i32) {
        let mut sealed = self.sealed.lock().unwrap_or_else(PoisonError::into_inner);
        if *sealed {
            return;
        }
        *sealed = true;
        (self.sink)(ExecutionEvent::Finished {
            execution_id: self.execution_id.clone(),
            exit_code,
            status: ExecutionStatus::from_exit_code(exit_code),
        });
    }
}

pub struct WorkerContext {
    pub script: Script,
    pub execution_id: String,
    pub device_id: Option<String>,
    pub trace_id: String,
    pub config: Arc<EngineConfig>,
    pub channel: Arc<dyn RemoteChannel>,
    pub scheduler: Arc<TaskScheduler>,
    pub control: WorkerControl,
}

pub struct ExecutionWorker {
    ctx: WorkerContext,
    emitter: Emitter,
}

impl ExecutionWorker {
    pub fn new(ctx: WorkerContext, sink: EventSink) -> Self {
        let emitter = Emitter::new(ctx.execution_id.clone(), sink);
        Self { ctx, emitter }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let short_id: String = self.ctx.execution_id.chars().take(8).collect();
        std::thread::Builder::new()
            .name(format!("script-{short_id}"))
            .spawn(move || self.run())
    }

    /// Runs to completion on the calling thread.
    pub fn run(self) {
        let ctx = &self.ctx;
        self.emitter.started(&ctx.script.id);

        let exit_code = match ctx.scheduler.acquire_global(ctx.control.cancel_flag()) {
            Some(_permit) if ctx.script.kind.is_host() => host::run(ctx, &self.emitter),
            Some(_permit) => device::run(ctx, &self.emitter),
            None => {
                debug!(trace_id = %ctx.trace_id, execution_id = %ctx.execution_id, "cancelled while queued");
                FAILURE_EXIT_CODE
            }
        };

        info!(
            trace_id = %ctx.trace_id,
            execution_id = %ctx.execution_id,
            exit_code,
            "worker finished"
        );
        self.emitter.finished(exit_code);
    }
}
