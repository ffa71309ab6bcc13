use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code reported when a run never produced a real one (spawn failure, transfer failure).
pub const FAILURE_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    #[serde(rename = "host_windows")]
    HostWindows,
    #[serde(rename = "host_linux")]
    HostPosix,
    #[serde(rename = "device")]
    Device,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::HostWindows => "host_windows",
            ScriptKind::HostPosix => "host_linux",
            ScriptKind::Device => "device",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "host_windows" | "windows" | "bat" => Some(ScriptKind::HostWindows),
            "host_linux" | "host_posix" | "linux" | "posix" | "sh" => Some(ScriptKind::HostPosix),
            "device" | "android" => Some(ScriptKind::Device),
            _ => None,
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            ScriptKind::HostWindows => ".bat",
            ScriptKind::HostPosix | ScriptKind::Device => ".sh",
        }
    }

    pub fn is_host(&self) -> bool {
        !matches!(self, ScriptKind::Device)
    }

    /// Body written when a script is materialized without content.
    pub fn placeholder_body(&self, name: &str) -> String {
        match self {
            ScriptKind::HostWindows => format!(
                "@echo off\r\nREM {name}\r\nREM Imported script: add your commands below.\r\necho {name}\r\n"
            ),
            ScriptKind::HostPosix => format!(
                "#!/bin/bash\n# {name}\n# Imported script: add your commands below.\necho \"{name}\"\n"
            ),
            ScriptKind::Device => format!(
                "#!/system/bin/sh\n# {name}\n# Imported device script: add your commands below.\necho \"{name}\"\n"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Script {
    pub id: String,
    pub name: String,
    #[serde(rename = "script_type")]
    pub kind: ScriptKind,
    #[serde(rename = "script_path")]
    pub path: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
}

fn default_visible() -> bool {
    true
}

/// Fields accepted by `ScriptRegistry::add_with`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDraft {
    pub name: String,
    pub kind: ScriptKind,
    pub path: String,
    pub description: String,
    pub is_template: bool,
    pub is_visible: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl ScriptDraft {
    pub fn new(
        name: impl Into<String>,
        kind: ScriptKind,
        path: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            path: path.into(),
            description: description.into(),
            is_template: false,
            is_visible: true,
            created_at: None,
        }
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptUpdate {
    pub name: Option<String>,
    pub kind: Option<ScriptKind>,
    pub path: Option<String>,
    pub description: Option<String>,
    pub is_template: Option<bool>,
    pub is_visible: Option<bool>,
}

impl ScriptUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.kind.is_none()
            && self.path.is_none()
            && self.description.is_none()
            && self.is_template.is_none()
            && self.is_visible.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptFilter {
    pub kind: Option<ScriptKind>,
    pub visible_only: bool,
    /// Case-insensitive match against name and description.
    pub query: Option<String>,
}

impl ScriptFilter {
    pub fn matches(&self, script: &Script) -> bool {
        if let Some(kind) = self.kind {
            if script.kind != kind {
                return false;
            }
        }
        if self.visible_only && !script.is_visible {
            return false;
        }
        match self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            Some(query) => {
                let query = query.to_lowercase();
                script.name.to_lowercase().contains(&query)
                    || script.description.to_lowercase().contains(&query)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptExecution {
    pub script_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl ScriptExecution {
    pub fn running(
        script_id: impl Into<String>,
        execution_id: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            script_id: script_id.into(),
            execution_id: execution_id.into(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            device_id,
        }
    }

    /// Moves a running execution to `status`. Terminal records are left as they are.
    pub fn finalize(&mut self, status: ExecutionStatus, exit_code: i32, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.end_time = Some(at);
        true
    }
}

/// Feed published to subscribers, keyed by execution id.
///
/// Host scripts stream output while running. Device scripts go through a run-to-completion
/// channel, so their `Output`/`Error` chunks typically arrive together once the remote command
/// has finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        execution_id: String,
        script_id: String,
    },
    Output {
        execution_id: String,
        chunk: String,
    },
    Error {
        execution_id: String,
        chunk: String,
    },
    Finished {
        execution_id: String,
        exit_code: i32,
        status: ExecutionStatus,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::Output { execution_id, .. }
            | ExecutionEvent::Error { execution_id, .. }
            | ExecutionEvent::Finished { execution_id, .. } => execution_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ExecutionEvent::Finished { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_as_legacy_strings() {
        let encoded = serde_json::to_string(&ScriptKind::HostPosix).expect("encode");
        assert_eq!(encoded, "\"host_linux\"");
        let decoded: ScriptKind = serde_json::from_str("\"host_windows\"").expect("decode");
        assert_eq!(decoded, ScriptKind::HostWindows);
        assert_eq!(ScriptKind::parse("Device"), Some(ScriptKind::Device));
        assert_eq!(ScriptKind::parse("vbs"), None);
    }

    #[test]
    fn status_is_stored_lowercase() {
        let encoded = serde_json::to_string(&ExecutionStatus::Cancelled).expect("encode");
        assert_eq!(encoded, "\"cancelled\"");
    }

    #[test]
    fn finalize_only_moves_running_records() {
        let mut execution = ScriptExecution::running("s", "e", None);
        assert!(execution.finalize(ExecutionStatus::Cancelled, FAILURE_EXIT_CODE, Utc::now()));
        assert!(!execution.finalize(ExecutionStatus::Completed, 0, Utc::now()));
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.exit_code, FAILURE_EXIT_CODE);
    }

    #[test]
    fn script_record_tolerates_missing_optional_fields() {
        let raw = r#"{
            "id": "abc",
            "name": "Reboot",
            "script_type": "device",
            "script_path": "/tmp/reboot.sh",
            "created_at": "2024-05-01T10:00:00Z",
            "future_field": 42
        }"#;
        let script: Script = serde_json::from_str(raw).expect("decode");
        assert_eq!(script.kind, ScriptKind::Device);
        assert_eq!(script.run_count, 0);
        assert!(script.last_run.is_none());
        assert!(script.is_visible);
        assert!(!script.is_template);
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let event = ExecutionEvent::Finished {
            execution_id: "e1".to_string(),
            exit_code: 0,
            status: ExecutionStatus::Completed,
        };
        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["event"], "finished");
        assert_eq!(value["status"], "completed");
        assert_eq!(event.execution_id(), "e1");
    }

    #[test]
    fn filter_matches_kind_visibility_and_query() {
        let script = Script {
            id: "1".to_string(),
            name: "Clear Cache".to_string(),
            kind: ScriptKind::Device,
            path: "/tmp/x.sh".to_string(),
            description: "wipes app caches".to_string(),
            created_at: Utc::now(),
            last_run: None,
            run_count: 0,
            is_template: false,
            is_visible: false,
        };
        assert!(ScriptFilter::default().matches(&script));
        assert!(!ScriptFilter {
            visible_only: true,
            ..Default::default()
        }
        .matches(&script));
        assert!(ScriptFilter {
            kind: Some(ScriptKind::Device),
            query: Some("CACHES".to_string()),
            ..Default::default()
        }
        .matches(&script));
        assert!(!ScriptFilter {
            kind: Some(ScriptKind::HostPosix),
            ..Default::default()
        }
        .matches(&script));
    }
}
