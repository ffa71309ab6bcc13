use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use crate::app::error::AppError;
use crate::app::models::{ExecutionStatus, ScriptExecution, FAILURE_EXIT_CODE};
use crate::app::storage::{load_json_or_default, write_json_atomic};

pub struct ExecutionHistory {
    file: PathBuf,
    entries: HashMap<String, ScriptExecution>,
}

impl ExecutionHistory {
    pub fn open(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let entries: HashMap<String, ScriptExecution> = load_json_or_default(&file);
        Self { file, entries }
    }

    pub fn persist(&self, trace_id: &str) -> Result<(), AppError> {
        write_json_atomic(&self.file, &self.entries, trace_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, execution: ScriptExecution) {
        self.entries.insert(execution.execution_id.clone(), execution);
    }

    pub fn get(&self, execution_id: &str) -> Option<&ScriptExecution> {
        self.entries.get(execution_id)
    }

    pub fn get_mut(&mut self, execution_id: &str) -> Option<&mut ScriptExecution> {
        self.entries.get_mut(execution_id)
    }

    /// Newest first.
    pub fn for_script(&self, script_id: &str) -> Vec<ScriptExecution> {
        let mut found: Vec<ScriptExecution> = self
            .entries
            .values()
            .filter(|execution| execution.script_id == script_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        found
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ScriptExecution> {
        let mut all: Vec<ScriptExecution> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all.truncate(limit);
        all
    }

    /// Finalizes records left `Running` by a process that is gone. Returns how many changed.
    pub fn fail_interrupted(&mut self, now: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for execution in self.entries.values_mut() {
            if execution.finalize(ExecutionStatus::Failed, FAILURE_EXIT_CODE, now) {
                if !execution.stderr.is_empty() && !execution.stderr.ends_with('\n') {
                    execution.stderr.push('\n');
                }
                execution.stderr.push_str("Execution interrupted: the engine stopped before it finished\n");
                changed += 1;
            }
        }
        changed
    }

    /// Drops terminal entries older than `max_age_days`, then the oldest terminal entries until
    /// at most `max_count` remain. Running entries are never removed.
    pub fn cleanup(&mut self, now: DateTime<Utc>, max_age_days: i64, max_count: usize) -> usize {
        let before = self.entries.len();
        let cutoff = now - Duration::days(max_age_days.max(0));
        self.entries.retain(|_, execution| {
            !execution.status.is_terminal() || execution.start_time >= cutoff
        });

        if self.entries.len() > max_count {
            let mut terminal: Vec<(DateTime<Utc>, String)> = self
                .entries
                .values()
                .filter(|execution| execution.status.is_terminal())
                .map(|execution| (execution.start_time, execution.execution_id.clone()))
                .collect();
            terminal.sort();
            let excess = self.entries.len() - max_count;
            for (_, execution_id) in terminal.into_iter().take(excess) {
                self.entries.remove(&execution_id);
            }
        }

        let removed = before - self.entries.len();
        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "execution history cleaned up");
        }
        removed
    }
}
