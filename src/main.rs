use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use lazy_blacktea_scripts_lib::app::adb::locator::validate_program;
use lazy_blacktea_scripts_lib::app::config::{
    config_path, load_config, load_config_from_path, save_config_to_path, EngineConfig,
};
use lazy_blacktea_scripts_lib::app::coordinator::ExecutionCoordinator;
use lazy_blacktea_scripts_lib::app::error::AppError;
use lazy_blacktea_scripts_lib::app::logging::init_logging;
use lazy_blacktea_scripts_lib::app::models::{
    ExecutionEvent, ExecutionStatus, ScriptExecution, ScriptFilter, ScriptKind, ScriptUpdate,
};
use serde::Serialize;
use uuid::Uuid;

const USAGE: &str = "Usage: lazy_blacktea_scripts [--config PATH] [--data-dir DIR] [--json] <command>

Commands:
  list [--kind KIND] [--visible] [--query TEXT]
  add --name NAME --kind KIND --path PATH [--description TEXT]
  create --name NAME --kind KIND --body FILE [--description TEXT]
  update ID [--name NAME] [--path PATH] [--description TEXT] [--hide|--show]
  duplicate ID
  remove ID
  run ID [--device SERIAL] [--timeout SECS]
  history [--script ID] [--limit N]
  export PATH [--id ID]...
  import PATH [--overwrite]
  cleanup [--max-age-days N] [--max-count N]
  config [--write]

KIND is one of host_windows, host_linux, device.
";

#[derive(Debug, Clone)]
enum Command {
    List {
        filter: ScriptFilter,
    },
    Add {
        name: String,
        kind: ScriptKind,
        path: String,
        description: String,
    },
    Create {
        name: String,
        kind: ScriptKind,
        body: PathBuf,
        description: String,
    },
    Update {
        id: String,
        update: ScriptUpdate,
    },
    Duplicate {
        id: String,
    },
    Remove {
        id: String,
    },
    Run {
        id: String,
        device: Option<String>,
        timeout: Option<Duration>,
    },
    History {
        script: Option<String>,
        limit: usize,
    },
    Export {
        path: PathBuf,
        ids: Vec<String>,
    },
    Import {
        path: PathBuf,
        overwrite: bool,
    },
    Cleanup {
        max_age_days: Option<i64>,
        max_count: Option<usize>,
    },
    Config {
        write: bool,
    },
}

#[derive(Debug, Clone)]
struct Args {
    config_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    json: bool,
    command: Command,
}

fn value(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    it.next()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, String> {
    raw.parse::<T>()
        .map_err(|_| format!("{flag} expects a number, got {raw}"))
}

fn kind(raw: &str) -> Result<ScriptKind, String> {
    ScriptKind::parse(raw).ok_or_else(|| format!("Unknown script kind: {raw}"))
}

fn parse_args() -> Result<Args, String> {
    let mut config_path: Option<PathBuf> = None;
    let mut data_dir: Option<PathBuf> = None;
    let mut json = false;
    let mut rest: Vec<String> = Vec::new();

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => config_path = Some(PathBuf::from(value(&mut it, "--config")?)),
            "--data-dir" => data_dir = Some(PathBuf::from(value(&mut it, "--data-dir")?)),
            "--json" => json = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => rest.push(arg),
        }
    }

    let mut it = rest.into_iter();
    let name = it.next().ok_or_else(|| USAGE.to_string())?;
    let command = match name.as_str() {
        "list" => {
            let mut filter = ScriptFilter::default();
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--kind" => filter.kind = Some(kind(&value(&mut it, "--kind")?)?),
                    "--visible" => filter.visible_only = true,
                    "--query" => filter.query = Some(value(&mut it, "--query")?),
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::List { filter }
        }
        "add" | "create" => {
            let mut script_name = None;
            let mut script_kind = None;
            let mut path = None;
            let mut description = String::new();
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--name" => script_name = Some(value(&mut it, "--name")?),
                    "--kind" => script_kind = Some(kind(&value(&mut it, "--kind")?)?),
                    "--path" | "--body" => path = Some(value(&mut it, &arg)?),
                    "--description" => description = it.next().unwrap_or_default(),
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            let script_name = script_name.ok_or("--name is required")?;
            let script_kind = script_kind.ok_or("--kind is required")?;
            let path = path.ok_or("--path (add) or --body (create) is required")?;
            if name == "add" {
                Command::Add {
                    name: script_name,
                    kind: script_kind,
                    path,
                    description,
                }
            } else {
                Command::Create {
                    name: script_name,
                    kind: script_kind,
                    body: PathBuf::from(path),
                    description,
                }
            }
        }
        "update" => {
            let id = it.next().ok_or("update requires a script id")?;
            let mut update = ScriptUpdate::default();
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--name" => update.name = Some(value(&mut it, "--name")?),
                    "--path" => update.path = Some(value(&mut it, "--path")?),
                    "--description" => update.description = Some(it.next().unwrap_or_default()),
                    "--hide" => update.is_visible = Some(false),
                    "--show" => update.is_visible = Some(true),
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            if update.is_empty() {
                return Err("update needs at least one field".to_string());
            }
            Command::Update { id, update }
        }
        "duplicate" => Command::Duplicate {
            id: it.next().ok_or("duplicate requires a script id")?,
        },
        "remove" => Command::Remove {
            id: it.next().ok_or("remove requires a script id")?,
        },
        "run" => {
            let id = it.next().ok_or("run requires a script id")?;
            let mut device = std::env::var("ANDROID_SERIAL")
                .ok()
                .filter(|s| !s.trim().is_empty());
            let mut timeout = None;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--device" => device = Some(value(&mut it, "--device")?),
                    "--timeout" => {
                        let secs: u64 = number(&value(&mut it, "--timeout")?, "--timeout")?;
                        timeout = Some(Duration::from_secs(secs));
                    }
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::Run { id, device, timeout }
        }
        "history" => {
            let mut script = None;
            let mut limit = 20usize;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--script" => script = Some(value(&mut it, "--script")?),
                    "--limit" => limit = number(&value(&mut it, "--limit")?, "--limit")?,
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::History { script, limit }
        }
        "export" => {
            let path = PathBuf::from(it.next().ok_or("export requires a path")?);
            let mut ids = Vec::new();
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--id" => ids.push(value(&mut it, "--id")?),
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::Export { path, ids }
        }
        "import" => {
            let path = PathBuf::from(it.next().ok_or("import requires a path")?);
            let mut overwrite = false;
            for arg in it.by_ref() {
                match arg.as_str() {
                    "--overwrite" => overwrite = true,
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::Import { path, overwrite }
        }
        "cleanup" => {
            let mut max_age_days = None;
            let mut max_count = None;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--max-age-days" => {
                        max_age_days = Some(number(&value(&mut it, "--max-age-days")?, "--max-age-days")?)
                    }
                    "--max-count" => {
                        max_count = Some(number(&value(&mut it, "--max-count")?, "--max-count")?)
                    }
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::Cleanup {
                max_age_days,
                max_count,
            }
        }
        "config" => {
            let mut write = false;
            for arg in it.by_ref() {
                match arg.as_str() {
                    "--write" => write = true,
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::Config { write }
        }
        other => return Err(format!("Unknown command: {other}\n\n{USAGE}")),
    };

    Ok(Args {
        config_path,
        data_dir,
        json,
        command,
    })
}

fn load(args: &Args, trace_id: &str) -> Result<EngineConfig, AppError> {
    let mut config = match &args.config_path {
        Some(path) => load_config_from_path(path, trace_id)?,
        None => load_config(trace_id)?,
    };
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }
    Ok(config)
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn print_execution(execution: &ScriptExecution) {
    let ended = execution
        .end_time
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<9}  exit={:<4}  {}  {}  script={}{}",
        execution.execution_id,
        format!("{:?}", execution.status).to_lowercase(),
        execution.exit_code,
        execution.start_time.to_rfc3339(),
        ended,
        execution.script_id,
        execution
            .device_id
            .as_deref()
            .map(|device| format!(" device={device}"))
            .unwrap_or_default()
    );
}

/// Streams one execution to the terminal and returns its final status.
fn run_script(
    coordinator: &ExecutionCoordinator,
    script_id: &str,
    device: Option<&str>,
    timeout: Option<Duration>,
    json: bool,
) -> Result<ExecutionStatus, AppError> {
    if let Some(script) = coordinator.get_script(script_id) {
        if script.kind == ScriptKind::Device {
            let program = coordinator.config().adb_program();
            if let Err(message) = validate_program(&program) {
                eprintln!("Warning: adb {message}");
            }
        }
    }

    let events = coordinator.subscribe();
    let execution_id = coordinator.execute(script_id, device)?;
    let started = Instant::now();
    let mut cancel_sent = false;
    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) if event.execution_id() == execution_id => {
                if json {
                    println!("{}", serde_json::to_string(&event).unwrap_or_default());
                } else {
                    match &event {
                        ExecutionEvent::Output { chunk, .. } => {
                            print!("{chunk}");
                            let _ = std::io::stdout().flush();
                        }
                        ExecutionEvent::Error { chunk, .. } => eprint!("{chunk}"),
                        ExecutionEvent::Started { .. } | ExecutionEvent::Finished { .. } => {}
                    }
                }
                if let ExecutionEvent::Finished { status, .. } = event {
                    return Ok(status);
                }
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {
                if cancel_sent || timeout.map_or(true, |limit| started.elapsed() < limit) {
                    continue;
                }
                cancel_sent = true;
                eprintln!("Timed out, cancelling {execution_id}");
                coordinator.cancel(&execution_id)?;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Ok(coordinator
                    .get_execution(&execution_id)
                    .map(|execution| execution.status)
                    .unwrap_or(ExecutionStatus::Failed));
            }
        }
    }
}

fn dispatch(args: Args, coordinator: &ExecutionCoordinator) -> Result<i32, AppError> {
    let json = args.json;
    match args.command {
        Command::Config { write } => {
            print_json(coordinator.config());
            if write {
                let trace_id = Uuid::new_v4().to_string();
                let path = args.config_path.clone().unwrap_or_else(config_path);
                save_config_to_path(coordinator.config(), &path, &trace_id)?;
                eprintln!("Wrote {}", path.display());
            }
        }
        Command::List { filter } => {
            let scripts = coordinator.list_scripts(Some(&filter));
            if json {
                print_json(&scripts);
            } else {
                for script in scripts {
                    println!(
                        "{}  {:<12}  runs={:<4}  {}  {}",
                        script.id,
                        script.kind.as_str(),
                        script.run_count,
                        script.name,
                        script.path
                    );
                }
            }
        }
        Command::Add {
            name,
            kind,
            path,
            description,
        } => println!("{}", coordinator.add_script(&name, kind, &path, &description)?),
        Command::Create {
            name,
            kind,
            body,
            description,
        } => {
            let trace_id = Uuid::new_v4().to_string();
            let content = fs::read_to_string(&body).map_err(|err| {
                AppError::validation(format!("Failed to read {}: {err}", body.display()), &trace_id)
            })?;
            println!("{}", coordinator.create_script(&name, kind, &description, &content)?);
        }
        Command::Update { id, update } => {
            if !coordinator.update_script(&id, &update)? {
                eprintln!("Script not found: {id}");
                return Ok(1);
            }
        }
        Command::Duplicate { id } => match coordinator.duplicate_script(&id)? {
            Some(copy) => println!("{copy}"),
            None => {
                eprintln!("Script not found: {id}");
                return Ok(1);
            }
        },
        Command::Remove { id } => {
            if !coordinator.remove_script(&id)? {
                eprintln!("Script not found: {id}");
                return Ok(1);
            }
        }
        Command::Run {
            id,
            device,
            timeout,
        } => {
            let status = run_script(coordinator, &id, device.as_deref(), timeout, json)?;
            return Ok(if status == ExecutionStatus::Completed { 0 } else { 1 });
        }
        Command::History { script, limit } => {
            let executions = match script {
                Some(script_id) => {
                    let mut all = coordinator.get_executions_for_script(&script_id);
                    all.truncate(limit);
                    all
                }
                None => coordinator.recent_executions(limit),
            };
            if json {
                print_json(&executions);
            } else {
                executions.iter().for_each(print_execution);
            }
        }
        Command::Export { path, ids } => {
            let ids = (!ids.is_empty()).then_some(ids);
            let count = coordinator.export_scripts(&path, ids.as_deref())?;
            println!("Exported {count} script(s) to {}", path.display());
        }
        Command::Import { path, overwrite } => {
            let summary = coordinator.import_scripts(&path, overwrite)?;
            if json {
                print_json(&summary);
            } else {
                println!("Imported {}, skipped {}", summary.imported, summary.skipped);
            }
        }
        Command::Cleanup {
            max_age_days,
            max_count,
        } => {
            let removed = if max_age_days.is_none() && max_count.is_none() {
                coordinator.apply_retention()?
            } else {
                let defaults = &coordinator.config().history;
                coordinator.cleanup_history(
                    max_age_days.unwrap_or(defaults.max_age_days),
                    max_count.unwrap_or(defaults.max_count),
                )?
            };
            println!("Removed {removed} execution(s)");
        }
    }
    Ok(0)
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let config = match load(&args, &trace_id) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.log_level);

    let coordinator = match ExecutionCoordinator::with_adb(config) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let code = match dispatch(args, &coordinator) {
        Ok(code) => code,
        Err(err) => {
            if let Ok(payload) = serde_json::to_string(&err) {
                tracing::debug!(error = %payload, "command failed");
            }
            eprintln!("{err}");
            1
        }
    };
    std::process::exit(code);
}
