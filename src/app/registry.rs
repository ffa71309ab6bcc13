use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::paths::sanitize_filename_component;
use crate::app::error::AppError;
use crate::app::models::{Script, ScriptDraft, ScriptFilter, ScriptKind, ScriptUpdate};
use crate::app::storage::{load_json_or_default, write_json_atomic};

/// Script catalog persisted as a single `id -> script` JSON document.
///
/// Every mutating call rewrites the document before it returns. When the write fails the
/// in-memory change is kept and the error is returned to the caller.
pub struct ScriptRegistry {
    file: PathBuf,
    scripts_dir: PathBuf,
    scripts: HashMap<String, Script>,
}

fn validate_script_path(path: &str, trace_id: &str) -> Result<(), AppError> {
    if path.trim().is_empty() {
        return Err(AppError::validation("script_path is required", trace_id));
    }
    if path.contains('\0') {
        return Err(AppError::validation(
            "script_path contains invalid characters",
            trace_id,
        ));
    }
    Ok(())
}

impl ScriptRegistry {
    pub fn open(file: impl Into<PathBuf>, scripts_dir: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let scripts: HashMap<String, Script> = load_json_or_default(&file);
        info!(path = %file.display(), count = scripts.len(), "script registry loaded");
        Self {
            file,
            scripts_dir: scripts_dir.into(),
            scripts,
        }
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    fn persist(&self, trace_id: &str) -> Result<(), AppError> {
        write_json_atomic(&self.file, &self.scripts, trace_id)
    }

    pub fn add(
        &mut self,
        name: &str,
        kind: ScriptKind,
        path: &str,
        description: &str,
        trace_id: &str,
    ) -> Result<String, AppError> {
        self.add_with(ScriptDraft::new(name, kind, path, description), trace_id)
    }

    pub fn add_with(&mut self, draft: ScriptDraft, trace_id: &str) -> Result<String, AppError> {
        validate_script_path(&draft.path, trace_id)?;
        let id = Uuid::new_v4().to_string();
        let script = Script {
            id: id.clone(),
            name: draft.name,
            kind: draft.kind,
            path: draft.path,
            description: draft.description,
            created_at: draft.created_at.unwrap_or_else(Utc::now),
            last_run: None,
            run_count: 0,
            is_template: draft.is_template,
            is_visible: draft.is_visible,
        };
        info!(trace_id = %trace_id, script_id = %id, name = %script.name, "script added");
        self.scripts.insert(id.clone(), script);
        self.persist(trace_id)?;
        Ok(id)
    }

    /// Removes the entry. The body file is deleted only when it lives in `scripts_dir`.
    pub fn remove(&mut self, id: &str, trace_id: &str) -> Result<bool, AppError> {
        let Some(script) = self.scripts.remove(id) else {
            return Ok(false);
        };
        self.persist(trace_id)?;
        let body = PathBuf::from(&script.path);
        if self.owns_path(&body) {
            if let Err(err) = fs::remove_file(&body) {
                warn!(
                    trace_id = %trace_id,
                    path = %body.display(),
                    error = %err,
                    "failed to delete script body"
                );
            }
        }
        info!(trace_id = %trace_id, script_id = %id, "script removed");
        Ok(true)
    }

    pub fn update(&mut self, id: &str, update: &ScriptUpdate, trace_id: &str) -> Result<bool, AppError> {
        let Some(script) = self.scripts.get_mut(id) else {
            return Ok(false);
        };
        if let Some(path) = update.path.as_deref() {
            validate_script_path(path, trace_id)?;
        }
        if let Some(name) = &update.name {
            script.name = name.clone();
        }
        if let Some(kind) = update.kind {
            script.kind = kind;
        }
        if let Some(path) = &update.path {
            script.path = path.clone();
        }
        if let Some(description) = &update.description {
            script.description = description.clone();
        }
        if let Some(is_template) = update.is_template {
            script.is_template = is_template;
        }
        if let Some(is_visible) = update.is_visible {
            script.is_visible = is_visible;
        }
        self.persist(trace_id)?;
        info!(trace_id = %trace_id, script_id = %id, "script updated");
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<Script> {
        self.scripts.get(id).cloned()
    }

    pub fn list(&self, filter: Option<&ScriptFilter>) -> Vec<Script> {
        let mut scripts: Vec<Script> = self
            .scripts
            .values()
            .filter(|script| filter.map_or(true, |filter| filter.matches(script)))
            .cloned()
            .collect();
        scripts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        scripts
    }

    pub fn find_by_name_and_kind(&self, name: &str, kind: ScriptKind) -> Option<Script> {
        self.list(None)
            .into_iter()
            .find(|script| script.kind == kind && script.name == name)
    }

    /// Bumps run bookkeeping at execution start. Only the coordinator calls this.
    pub fn record_run(&mut self, id: &str, at: DateTime<Utc>, trace_id: &str) -> Result<Script, AppError> {
        let script = self
            .scripts
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(format!("Script not found: {id}"), trace_id))?;
        script.run_count += 1;
        script.last_run = Some(at);
        let snapshot = script.clone();
        self.persist(trace_id)?;
        Ok(snapshot)
    }

    pub fn owns_path(&self, path: &Path) -> bool {
        match (path.parent(), self.scripts_dir.canonicalize()) {
            (Some(parent), Ok(dir)) => parent.canonicalize().map_or(false, |parent| parent == dir),
            _ => false,
        }
    }

    /// Writes `body` to a new file in `scripts_dir` without clobbering an existing one.
    ///
    /// `preferred_name` may carry an extension; otherwise the kind's extension is used.
    pub fn write_body(
        &self,
        preferred_name: &str,
        kind: ScriptKind,
        body: &str,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        fs::create_dir_all(&self.scripts_dir).map_err(|err| {
            AppError::persistence(format!("Failed to create scripts dir: {err}"), trace_id)
        })?;

        let preferred = Path::new(preferred_name);
        let (stem, extension) = match preferred.extension() {
            Some(ext)
                if !ext.is_empty()
                    && ext.len() <= 4
                    && ext.to_string_lossy().chars().all(|c| c.is_ascii_alphanumeric()) =>
            (
                preferred
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
                format!(".{}", sanitize_filename_component(&ext.to_string_lossy())),
            ),
            _ => (preferred_name.to_string(), kind.file_extension().to_string()),
        };
        let stem = sanitize_filename_component(&stem);

        let mut counter = 0usize;
        loop {
            let file_name = if counter == 0 {
                format!("{stem}{extension}")
            } else {
                format!("{stem}_{counter}{extension}")
            };
            let candidate = self.scripts_dir.join(file_name);
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(mut file) => {
                    file.write_all(body.as_bytes()).map_err(|err| {
                        AppError::persistence(
                            format!("Failed to write {}: {err}", candidate.display()),
                            trace_id,
                        )
                    })?;
                    mark_executable(&candidate, kind);
                    return Ok(candidate);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter += 1;
                }
                Err(err) => {
                    return Err(AppError::persistence(
                        format!("Failed to create {}: {err}", candidate.display()),
                        trace_id,
                    ));
                }
            }
        }
    }

    /// Materializes `body` in `scripts_dir` and registers it.
    pub fn create_script(
        &mut self,
        name: &str,
        kind: ScriptKind,
        description: &str,
        body: &str,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let path = self.write_body(name, kind, body, trace_id)?;
        self.add(name, kind, &path.to_string_lossy(), description, trace_id)
    }

    pub fn duplicate(&mut self, id: &str, trace_id: &str) -> Result<Option<String>, AppError> {
        let Some(source) = self.get(id) else {
            return Ok(None);
        };
        let body = fs::read_to_string(&source.path).map_err(|err| {
            AppError::validation(format!("Failed to read script body: {err}"), trace_id)
        })?;
        let name = format!("{} - Copy", source.name);
        let description = if source.description.is_empty() {
            "Duplicated script".to_string()
        } else {
            format!("Copy of: {}", source.description)
        };
        let path = self.write_body(&name, source.kind, &body, trace_id)?;
        let mut draft = ScriptDraft::new(name, source.kind, path.to_string_lossy(), description);
        draft.is_template = source.is_template;
        draft.is_visible = source.is_visible;
        self.add_with(draft, trace_id).map(Some)
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path, kind: ScriptKind) {
    use std::os::unix::fs::PermissionsExt;
    if kind == ScriptKind::HostWindows {
        return;
    }
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
        warn!(path = %path.display(), error = %err, "failed to mark script executable");
    }
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path, _kind: ScriptKind) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> ScriptRegistry {
        ScriptRegistry::open(tmp.path().join("scripts.json"), tmp.path().join("scripts"))
    }

    #[test]
    fn add_then_get_returns_fresh_record() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        let id = registry
            .add("Ping", ScriptKind::HostPosix, "/tmp/ping.sh", "pings", "trace-r-1")
            .expect("add");

        let script = registry.get(&id).expect("script");
        assert_eq!(script.id, id);
        assert_eq!(script.name, "Ping");
        assert_eq!(script.kind, ScriptKind::HostPosix);
        assert_eq!(script.path, "/tmp/ping.sh");
        assert_eq!(script.description, "pings");
        assert_eq!(script.run_count, 0);
        assert!(script.last_run.is_none());
        assert!(script.is_visible);
    }

    #[test]
    fn mutations_are_written_through() {
        let tmp = TempDir::new().expect("tmp");
        let id = {
            let mut registry = open(&tmp);
            let id = registry
                .add("A", ScriptKind::Device, "/tmp/a.sh", "", "trace-r-2")
                .expect("add");
            registry
                .update(
                    &id,
                    &ScriptUpdate {
                        description: Some("changed".to_string()),
                        is_template: Some(true),
                        ..Default::default()
                    },
                    "trace-r-2",
                )
                .expect("update");
            id
        };

        let reopened = open(&tmp);
        let script = reopened.get(&id).expect("persisted");
        assert_eq!(script.description, "changed");
        assert!(script.is_template);
    }

    #[test]
    fn duplicate_names_get_distinct_ids() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        let a = registry
            .add("Same", ScriptKind::HostPosix, "/tmp/a.sh", "", "t")
            .expect("add");
        let b = registry
            .add("Same", ScriptKind::HostPosix, "/tmp/b.sh", "", "t")
            .expect("add");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn add_rejects_empty_path() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        let err = registry
            .add("X", ScriptKind::HostPosix, "  ", "", "trace-r-3")
            .expect_err("err");
        assert_eq!(err.code, "ERR_VALIDATION");
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_ids_are_no_ops() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        assert!(!registry.remove("missing", "t").expect("remove"));
        assert!(!registry
            .update("missing", &ScriptUpdate::default(), "t")
            .expect("update"));
        let bad_path = ScriptUpdate {
            path: Some("   ".to_string()),
            ..ScriptUpdate::default()
        };
        assert!(!registry.update("missing", &bad_path, "t").expect("update"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn remove_deletes_owned_body_but_not_foreign_files() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        let owned = registry
            .create_script("Owned", ScriptKind::HostPosix, "", "echo owned\n", "t")
            .expect("create");
        let owned_path = PathBuf::from(registry.get(&owned).expect("owned").path);

        let foreign_path = tmp.path().join("foreign.sh");
        fs::write(&foreign_path, "echo foreign").expect("write");
        let foreign = registry
            .add("Foreign", ScriptKind::HostPosix, &foreign_path.to_string_lossy(), "", "t")
            .expect("add");

        assert!(registry.remove(&owned, "t").expect("remove owned"));
        assert!(registry.remove(&foreign, "t").expect("remove foreign"));
        assert!(!owned_path.exists());
        assert!(foreign_path.exists());
    }

    #[test]
    fn write_body_avoids_collisions() {
        let tmp = TempDir::new().expect("tmp");
        let registry = open(&tmp);
        let first = registry
            .write_body("Grab Logs", ScriptKind::Device, "a", "t")
            .expect("first");
        let second = registry
            .write_body("Grab Logs", ScriptKind::Device, "b", "t")
            .expect("second");
        let third = registry
            .write_body("setup.bat", ScriptKind::HostWindows, "c", "t")
            .expect("third");

        assert_eq!(first.file_name().unwrap(), "Grab_Logs.sh");
        assert_eq!(second.file_name().unwrap(), "Grab_Logs_1.sh");
        assert_eq!(third.file_name().unwrap(), "setup.bat");
        assert_eq!(fs::read_to_string(&first).expect("read"), "a");
        assert_eq!(fs::read_to_string(&second).expect("read"), "b");
    }

    #[test]
    fn duplicate_copies_body_and_flags() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        let id = registry
            .create_script("Model", ScriptKind::Device, "checks props", "getprop\n", "t")
            .expect("create");
        let copy_id = registry.duplicate(&id, "t").expect("dup").expect("some");

        let copy = registry.get(&copy_id).expect("copy");
        assert_eq!(copy.name, "Model - Copy");
        assert_eq!(copy.description, "Copy of: checks props");
        assert_eq!(copy.kind, ScriptKind::Device);
        assert_eq!(fs::read_to_string(&copy.path).expect("read"), "getprop\n");
        assert_ne!(copy.path, registry.get(&id).expect("orig").path);
        assert!(registry.duplicate("missing", "t").expect("dup").is_none());
    }

    #[test]
    fn list_filters_and_orders_by_creation() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        let mut early = ScriptDraft::new("B", ScriptKind::HostPosix, "/tmp/b.sh", "");
        early.created_at = Some(Utc::now() - chrono::Duration::days(2));
        registry.add_with(early, "t").expect("add");
        registry
            .add("A", ScriptKind::Device, "/tmp/a.sh", "", "t")
            .expect("add");
        let mut hidden = ScriptDraft::new("C", ScriptKind::Device, "/tmp/c.sh", "");
        hidden.is_visible = false;
        registry.add_with(hidden, "t").expect("add");

        let names: Vec<String> = registry.list(None).into_iter().map(|s| s.name).collect();
        assert_eq!(names.first().map(String::as_str), Some("B"));

        let visible_devices = registry.list(Some(&ScriptFilter {
            kind: Some(ScriptKind::Device),
            visible_only: true,
            query: None,
        }));
        assert_eq!(visible_devices.len(), 1);
        assert_eq!(visible_devices[0].name, "A");

        assert!(registry.find_by_name_and_kind("A", ScriptKind::Device).is_some());
        assert!(registry.find_by_name_and_kind("A", ScriptKind::HostPosix).is_none());
    }

    #[test]
    fn record_run_bumps_counters() {
        let tmp = TempDir::new().expect("tmp");
        let mut registry = open(&tmp);
        let id = registry
            .add("A", ScriptKind::HostPosix, "/tmp/a.sh", "", "t")
            .expect("add");
        let at = Utc::now();
        let script = registry.record_run(&id, at, "t").expect("run");
        assert_eq!(script.run_count, 1);
        assert_eq!(script.last_run, Some(at));
        let err = registry.record_run("missing", at, "t").expect_err("err");
        assert_eq!(err.code, "ERR_NOT_FOUND");
    }

    #[test]
    fn write_failures_reach_the_caller_but_keep_memory_state() {
        let tmp = TempDir::new().expect("tmp");
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "not a directory").expect("write");
        let mut registry = ScriptRegistry::open(blocker.join("scripts.json"), tmp.path().join("scripts"));

        let err = registry
            .add("Ping", ScriptKind::HostPosix, "/tmp/ping.sh", "", "trace-w")
            .expect_err("persist");
        assert_eq!(err.code, "ERR_PERSISTENCE");
        assert_eq!(err.trace_id, "trace-w");
        assert_eq!(registry.len(), 1);

        let id = registry.list(None).pop().expect("kept").id;
        let rename = ScriptUpdate {
            name: Some("Pong".to_string()),
            ..ScriptUpdate::default()
        };
        let err = registry.update(&id, &rename, "trace-w").expect_err("persist");
        assert_eq!(err.code, "ERR_PERSISTENCE");
        assert_eq!(registry.get(&id).expect("script").name, "Pong");
    }
}
