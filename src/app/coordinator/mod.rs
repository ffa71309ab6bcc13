use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::channel::AdbChannel;
use crate::app::channel::RemoteChannel;
use crate::app::config::EngineConfig;
use crate::app::error::AppError;
use crate::app::exchange;
use crate::app::history::ExecutionHistory;
use crate::app::models::{
    ExecutionEvent, ExecutionStatus, ImportSummary, Script, ScriptExecution, ScriptFilter,
    ScriptKind, ScriptUpdate, FAILURE_EXIT_CODE,
};
use crate::app::registry::ScriptRegistry;
use crate::app::scheduler::TaskScheduler;
use crate::app::worker::{EventSink, ExecutionWorker, WorkerContext, WorkerControl};


const WAIT_POLL: Duration = Duration::from_millis(20);

struct WorkerHandle {
    control: WorkerControl,
    script_id: String,
}

struct Shared {
    config: Arc<EngineConfig>,
    channel: Arc<dyn RemoteChannel>,
    scheduler: Arc<TaskScheduler>,
    registry: Mutex<ScriptRegistry>,
    history: Mutex<ExecutionHistory>,
    active: Mutex<HashMap<String, WorkerHandle>>,
    subscribers: Mutex<Vec<mpsc::Sender<ExecutionEvent>>>,
}

fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str, trace_id: &str) -> Result<MutexGuard<'a, T>, AppError> {
    mutex
        .lock()
        .map_err(|_| AppError::system(format!("{what} locked"), trace_id))
}

fn lock_quiet<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn publish(&self, event: ExecutionEvent) {
        let mut subscribers = lock_quiet(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Worker events land here, on the worker's own threads.
    fn handle_event(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Started { .. } => self.publish(event),
            ExecutionEvent::Output {
                ref execution_id,
                ref chunk,
            } => {
                {
                    let mut history = lock_quiet(&self.history);
                    if let Some(execution) = history.get_mut(execution_id) {
                        if !execution.status.is_terminal() {
                            execution.stdout.push_str(chunk);
                        }
                    }
                }
                self.publish(event);
            }
            ExecutionEvent::Error {
                ref execution_id,
                ref chunk,
            } => {
                {
                    let mut history = lock_quiet(&self.history);
                    if let Some(execution) = history.get_mut(execution_id) {
                        if !execution.status.is_terminal() {
                            execution.stderr.push_str(chunk);
                        }
                    }
                }
                self.publish(event);
            }
            ExecutionEvent::Finished {
                execution_id,
                exit_code,
                status,
            } => {
                let trace_id = new_trace_id();
                let final_status = {
                    let mut history = lock_quiet(&self.history);
                    let final_status = match history.get_mut(&execution_id) {
                        Some(execution) => {
                            execution.finalize(status, exit_code, Utc::now());
                            execution.status
                        }
                        None => status,
                    };
                    if let Err(err) = history.persist(&trace_id) {
                        warn!(
                            trace_id = %trace_id,
                            execution_id = %execution_id,
                            error = %err,
                            "failed to persist execution history"
                        );
                    }
                    final_status
                };
                lock_quiet(&self.active).remove(&execution_id);
                info!(
                    execution_id = %execution_id,
                    exit_code,
                    status = ?final_status,
                    "script execution finished"
                );
                self.publish(ExecutionEvent::Finished {
                    execution_id,
                    exit_code,
                    status: final_status,
                });
            }
        }
    }
}

/// Entry point for front ends. Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    shared: Arc<Shared>,
}

impl ExecutionCoordinator {
    /// Opens (or creates) the persisted state under the configured data directory.
    pub fn open(config: EngineConfig, channel: Arc<dyn RemoteChannel>) -> Result<Self, AppError> {
        let trace_id = new_trace_id();
        let data_dir = config.data_dir();
        fs::create_dir_all(&data_dir).map_err(|err| {
            AppError::persistence(
                format!("Failed to create data dir {}: {err}", data_dir.display()),
                &trace_id,
            )
        })?;

        let registry = ScriptRegistry::open(config.scripts_file(), config.scripts_dir());
        let mut history = ExecutionHistory::open(config.executions_file());
        let now = Utc::now();
        let mut dirty = history.fail_interrupted(now) > 0;
        if config.history.cleanup_on_start {
            dirty |= history.cleanup(now, config.history.max_age_days, config.history.max_count) > 0;
        }
        if dirty {
            history.persist(&trace_id)?;
        }

        info!(
            trace_id = %trace_id,
            data_dir = %data_dir.display(),
            scripts = registry.len(),
            executions = history.len(),
            "execution coordinator ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                scheduler: Arc::new(TaskScheduler::new(config.execution.max_concurrent)),
                config: Arc::new(config),
                channel,
                registry: Mutex::new(registry),
                history: Mutex::new(history),
                active: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Opens the engine with the adb-backed device channel.
    pub fn with_adb(config: EngineConfig) -> Result<Self, AppError> {
        let channel = Arc::new(AdbChannel::from_config(&config));
        Self::open(config, channel)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ExecutionEvent> {
        let (tx, rx) = mpsc::channel();
        lock_quiet(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn add_script(
        &self,
        name: &str,
        kind: ScriptKind,
        path: &str,
        description: &str,
    ) -> Result<String, AppError> {
        let trace_id = new_trace_id();
        let mut registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
        registry.add(name, kind, path, description, &trace_id)
    }

    /// Writes `body` into the engine's scripts directory and registers it.
    pub fn create_script(
        &self,
        name: &str,
        kind: ScriptKind,
        description: &str,
        body: &str,
    ) -> Result<String, AppError> {
        let trace_id = new_trace_id();
        let mut registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
        registry.create_script(name, kind, description, body, &trace_id)
    }

    pub fn duplicate_script(&self, script_id: &str) -> Result<Option<String>, AppError> {
        let trace_id = new_trace_id();
        let mut registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
        registry.duplicate(script_id, &trace_id)
    }

    pub fn remove_script(&self, script_id: &str) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let mut registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
        registry.remove(script_id, &trace_id)
    }

    pub fn update_script(&self, script_id: &str, update: &ScriptUpdate) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let mut registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
        registry.update(script_id, update, &trace_id)
    }

    pub fn get_script(&self, script_id: &str) -> Option<Script> {
        lock_quiet(&self.shared.registry).get(script_id)
    }

    pub fn list_scripts(&self, filter: Option<&ScriptFilter>) -> Vec<Script> {
        lock_quiet(&self.shared.registry).list(filter)
    }

    /// Starts a run and returns its execution id without waiting for it.
    pub fn execute(&self, script_id: &str, device_id: Option<&str>) -> Result<String, AppError> {
        let trace_id = new_trace_id();
        let device_id = device_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let script = {
            let registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
            registry
                .get(script_id)
                .ok_or_else(|| AppError::not_found(format!("Script not found: {script_id}"), &trace_id))?
        };
        if script.kind == ScriptKind::Device && device_id.is_none() {
            return Err(AppError::missing_device(
                "Device ID required for device script execution",
                &trace_id,
            ));
        }

        let started_at = Utc::now();
        let script = {
            let mut registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
            registry.record_run(script_id, started_at, &trace_id)?
        };

        let execution_id = Uuid::new_v4().to_string();
        let mut execution = ScriptExecution::running(script_id, &execution_id, device_id.clone());
        execution.start_time = started_at;
        {
            let mut history = lock(&self.shared.history, "Execution history", &trace_id)?;
            history.insert(execution);
            if let Err(err) = history.persist(&trace_id) {
                if let Some(execution) = history.get_mut(&execution_id) {
                    execution.finalize(ExecutionStatus::Failed, FAILURE_EXIT_CODE, Utc::now());
                    execution.stderr.push_str(&format!("{}\n", err.error));
                }
                return Err(err);
            }
        }

        let control = WorkerControl::new();
        lock(&self.shared.active, "Active workers", &trace_id)?.insert(
            execution_id.clone(),
            WorkerHandle {
                control: control.clone(),
                script_id: script.id.clone(),
            },
        );

        info!(
            trace_id = %trace_id,
            script_id = %script.id,
            execution_id = %execution_id,
            name = %script.name,
            device_id = ?device_id,
            "script execution started"
        );

        let ctx = WorkerContext {
            script,
            execution_id: execution_id.clone(),
            device_id,
            trace_id: trace_id.clone(),
            config: Arc::clone(&self.shared.config),
            channel: Arc::clone(&self.shared.channel),
            scheduler: Arc::clone(&self.shared.scheduler),
            control,
        };
        if let Err(err) = ExecutionWorker::new(ctx, self.event_sink()).spawn() {
            warn!(trace_id = %trace_id, error = %err, "failed to spawn worker thread");
            self.shared.handle_event(ExecutionEvent::Error {
                execution_id: execution_id.clone(),
                chunk: format!("Failed to start worker: {err}\n"),
            });
            self.shared.handle_event(ExecutionEvent::Finished {
                execution_id: execution_id.clone(),
                exit_code: FAILURE_EXIT_CODE,
                status: ExecutionStatus::Failed,
            });
        }

        Ok(execution_id)
    }

    fn event_sink(&self) -> EventSink {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |event| shared.handle_event(event))
    }

    /// Marks a running execution `Cancelled` and asks its worker to stop.
    ///
    /// Returns `false` when there is no active worker or the run already reached a terminal state.
    pub fn cancel(&self, execution_id: &str) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        let (control, script_id) = {
            let active = lock(&self.shared.active, "Active workers", &trace_id)?;
            match active.get(execution_id) {
                Some(handle) => (handle.control.clone(), handle.script_id.clone()),
                None => return Ok(false),
            }
        };

        let persisted = {
            let mut history = lock(&self.shared.history, "Execution history", &trace_id)?;
            let transitioned = history.get_mut(execution_id).is_some_and(|execution| {
                execution.finalize(ExecutionStatus::Cancelled, FAILURE_EXIT_CODE, Utc::now())
            });
            if !transitioned {
                return Ok(false);
            }
            history.persist(&trace_id)
        };

        control.request_cancel();
        info!(
            trace_id = %trace_id,
            script_id = %script_id,
            execution_id = %execution_id,
            "script execution cancelled"
        );
        persisted.map(|_| true)
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<ScriptExecution> {
        lock_quiet(&self.shared.history).get(execution_id).cloned()
    }

    /// Newest first.
    pub fn get_executions_for_script(&self, script_id: &str) -> Vec<ScriptExecution> {
        lock_quiet(&self.shared.history).for_script(script_id)
    }

    pub fn recent_executions(&self, limit: usize) -> Vec<ScriptExecution> {
        lock_quiet(&self.shared.history).recent(limit)
    }

    pub fn running_executions(&self) -> Vec<String> {
        lock_quiet(&self.shared.active).keys().cloned().collect()
    }

    pub fn is_running(&self, execution_id: &str) -> bool {
        lock_quiet(&self.shared.active).contains_key(execution_id)
    }

    /// Blocks until the worker for `execution_id` is gone. `None` on timeout or unknown id.
    pub fn wait_for(&self, execution_id: &str, timeout: Duration) -> Option<ScriptExecution> {
        let start = Instant::now();
        loop {
            if !self.is_running(execution_id) {
                return self
                    .get_execution(execution_id)
                    .filter(|execution| execution.status.is_terminal());
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    pub fn cleanup_history(&self, max_age_days: i64, max_count: usize) -> Result<usize, AppError> {
        let trace_id = new_trace_id();
        let mut history = lock(&self.shared.history, "Execution history", &trace_id)?;
        let removed = history.cleanup(Utc::now(), max_age_days, max_count);
        history.persist(&trace_id)?;
        Ok(removed)
    }

    /// Applies the retention configured in `history`.
    pub fn apply_retention(&self) -> Result<usize, AppError> {
        let settings = &self.shared.config.history;
        self.cleanup_history(settings.max_age_days, settings.max_count)
    }

    pub fn export_scripts(&self, path: &Path, ids: Option<&[String]>) -> Result<usize, AppError> {
        let trace_id = new_trace_id();
        let registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
        exchange::export_scripts(&registry, path, ids, &trace_id)
    }

    pub fn import_scripts(&self, path: &Path, overwrite_existing: bool) -> Result<ImportSummary, AppError> {
        let trace_id = new_trace_id();
        let mut registry = lock(&self.shared.registry, "Script registry", &trace_id)?;
        exchange::import_scripts(&mut registry, path, overwrite_existing, &trace_id)
    }
}
