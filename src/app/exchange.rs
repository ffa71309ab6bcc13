use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::{ImportSummary, Script, ScriptDraft, ScriptKind, ScriptUpdate};
use crate::app::registry::ScriptRegistry;
use crate::app::storage::write_json_atomic;

/// One element of the exported JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportRecord {
    pub name: String,
    pub script_path: String,
    #[serde(rename = "type")]
    pub kind: ScriptKind,
    #[serde(rename = "isTemplate")]
    pub is_template: bool,
    pub show: bool,
    pub description: String,
    pub created_at: String,
    pub last_run: String,
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ExportRecord {
    fn from_script(script: &Script) -> Self {
        Self {
            name: script.name.clone(),
            script_path: script.path.clone(),
            kind: script.kind,
            is_template: script.is_template,
            show: script.is_visible,
            description: script.description.clone(),
            created_at: script.created_at.to_rfc3339(),
            last_run: script
                .last_run
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
            run_count: script.run_count,
            content: fs::read_to_string(&script.path).ok(),
        }
    }
}

/// Fields an import honors. Anything else in the record is ignored.
struct ImportEntry {
    name: String,
    path: String,
    kind: ScriptKind,
    description: String,
    is_template: bool,
    show: bool,
    created_at: Option<DateTime<Utc>>,
    content: Option<String>,
}

fn string_field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

fn non_empty_field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    string_field(record, key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl ImportEntry {
    fn parse(record: &Value) -> Option<Self> {
        let name = non_empty_field(record, "name")?;
        let path = non_empty_field(record, "script_path")?;
        let kind = non_empty_field(record, "type").and_then(ScriptKind::parse)?;
        Some(Self {
            name: name.to_string(),
            path: path.to_string(),
            kind,
            description: string_field(record, "description").unwrap_or_default().to_string(),
            is_template: record
                .get("isTemplate")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            show: record.get("show").and_then(Value::as_bool).unwrap_or(true),
            created_at: string_field(record, "created_at").and_then(parse_timestamp),
            content: string_field(record, "content").map(str::to_string),
        })
    }

    /// File name for a materialized body, taken from the exported path when it has one.
    fn preferred_file_name(&self) -> &str {
        self.path
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.name)
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp read as UTC.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Writes the selected scripts (all when `ids` is `None`) and returns how many were exported.
/// Unknown ids are ignored.
pub fn export_scripts(
    registry: &ScriptRegistry,
    path: &Path,
    ids: Option<&[String]>,
    trace_id: &str,
) -> Result<usize, AppError> {
    let scripts: Vec<Script> = match ids {
        Some(ids) => ids.iter().filter_map(|id| registry.get(id)).collect(),
        None => registry.list(None),
    };
    let records: Vec<ExportRecord> = scripts.iter().map(ExportRecord::from_script).collect();
    write_json_atomic(path, &records, trace_id)?;
    info!(
        trace_id = %trace_id,
        path = %path.display(),
        count = records.len(),
        "scripts exported"
    );
    Ok(records.len())
}

/// Imports an exported document. A file that cannot be read or is not a JSON array imports
/// nothing and reports `(0, 0)`.
pub fn import_scripts(
    registry: &mut ScriptRegistry,
    path: &Path,
    overwrite_existing: bool,
    trace_id: &str,
) -> Result<ImportSummary, AppError> {
    let mut summary = ImportSummary::default();
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(trace_id = %trace_id, path = %path.display(), error = %err, "import file unreadable");
            return Ok(summary);
        }
    };
    let records = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(records)) => records,
        Ok(_) => {
            warn!(trace_id = %trace_id, path = %path.display(), "import document is not an array");
            return Ok(summary);
        }
        Err(err) => {
            warn!(trace_id = %trace_id, path = %path.display(), error = %err, "import document is malformed");
            return Ok(summary);
        }
    };

    for record in &records {
        let Some(entry) = ImportEntry::parse(record) else {
            summary.skipped += 1;
            continue;
        };
        match registry.find_by_name_and_kind(&entry.name, entry.kind) {
            Some(_) if !overwrite_existing => summary.skipped += 1,
            Some(existing) => {
                overwrite(registry, &existing, &entry, trace_id)?;
                summary.imported += 1;
            }
            None => {
                let body = entry
                    .content
                    .clone()
                    .unwrap_or_else(|| entry.kind.placeholder_body(&entry.name));
                let body_path =
                    registry.write_body(entry.preferred_file_name(), entry.kind, &body, trace_id)?;
                let mut draft = ScriptDraft::new(
                    entry.name.clone(),
                    entry.kind,
                    body_path.to_string_lossy(),
                    entry.description.clone(),
                );
                draft.is_template = entry.is_template;
                draft.is_visible = entry.show;
                draft.created_at = entry.created_at;
                registry.add_with(draft, trace_id)?;
                summary.imported += 1;
            }
        }
    }

    info!(
        trace_id = %trace_id,
        path = %path.display(),
        imported = summary.imported,
        skipped = summary.skipped,
        "scripts imported"
    );
    Ok(summary)
}

fn overwrite(
    registry: &mut ScriptRegistry,
    existing: &Script,
    entry: &ImportEntry,
    trace_id: &str,
) -> Result<(), AppError> {
    let new_path = match &entry.content {
        Some(body) => Some(
            registry
                .write_body(entry.preferred_file_name(), entry.kind, body, trace_id)?
                .to_string_lossy()
                .to_string(),
        ),
        None if Path::new(&entry.path).is_file() => Some(entry.path.clone()),
        None => None,
    };
    let replaced_body = new_path
        .as_deref()
        .filter(|path| *path != existing.path)
        .map(|_| existing.path.clone());

    let update = ScriptUpdate {
        path: new_path,
        description: Some(entry.description.clone()),
        is_template: Some(entry.is_template),
        is_visible: Some(entry.show),
        ..ScriptUpdate::default()
    };
    registry.update(&existing.id, &update, trace_id)?;

    if let Some(old) = replaced_body {
        let old = Path::new(&old);
        if registry.owns_path(old) {
            if let Err(err) = fs::remove_file(old) {
                warn!(trace_id = %trace_id, path = %old.display(), error = %err, "failed to delete replaced body");
            }
        }
    }
    Ok(())
}
