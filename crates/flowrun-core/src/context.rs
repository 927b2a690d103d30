// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Mutable per-execution workflow context.
//!
//! The context is the only first-class shared object during execution:
//! variables, environment, step outputs, logs, and the current-step
//! pointer live here behind small read/write locks so executors can share
//! it via `Arc`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Log severity for context log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single context log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub step_id: Option<String>,
    pub message: String,
}

/// Serializable deep copy of a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub workflow_id: String,
    pub start_time: DateTime<Utc>,
    pub variables: HashMap<String, Value>,
    pub environment: HashMap<String, String>,
    pub step_outputs: HashMap<String, Value>,
    pub current_step_id: Option<String>,
    pub logs: Vec<LogEntry>,
}

/// Execution context shared by the runner, scheduler, and executors.
#[derive(Debug)]
pub struct ExecutionContext {
    workflow_id: String,
    start_time: DateTime<Utc>,
    variables: RwLock<HashMap<String, Value>>,
    environment: RwLock<HashMap<String, String>>,
    step_outputs: RwLock<HashMap<String, Value>>,
    current_step_id: RwLock<Option<String>>,
    logs: RwLock<Vec<LogEntry>>,
}

impl ExecutionContext {
    /// Creates a fresh context.
    pub fn new(
        workflow_id: impl Into<String>,
        variables: HashMap<String, Value>,
        environment: HashMap<String, String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            start_time: Utc::now(),
            variables: RwLock::new(variables),
            environment: RwLock::new(environment),
            step_outputs: RwLock::new(HashMap::new()),
            current_step_id: RwLock::new(None),
            logs: RwLock::new(Vec::new()),
        }
    }

    /// The workflow execution id.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// When this execution started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Reads a variable.
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    /// Writes a variable.
    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.write().insert(name.into(), value);
    }

    /// Copies out the full variable map.
    pub fn variables(&self) -> HashMap<String, Value> {
        self.variables.read().clone()
    }

    /// Reads an environment variable.
    pub fn get_environment_variable(&self, name: &str) -> Option<String> {
        self.environment.read().get(name).cloned()
    }

    /// Writes an environment variable.
    pub fn set_environment_variable(&self, name: impl Into<String>, value: impl Into<String>) {
        self.environment.write().insert(name.into(), value.into());
    }

    /// Copies out the full environment map.
    pub fn environment(&self) -> HashMap<String, String> {
        self.environment.read().clone()
    }

    /// Reads a step output.
    pub fn get_step_output(&self, step_id: &str) -> Option<Value> {
        self.step_outputs.read().get(step_id).cloned()
    }

    /// Adopts a successful step's output. Each step owns exactly one key;
    /// a second write for the same step is ignored.
    pub fn set_step_output(&self, step_id: impl Into<String>, output: Value) {
        let step_id = step_id.into();
        let mut outputs = self.step_outputs.write();
        if outputs.contains_key(&step_id) {
            warn!(step_id = %step_id, "ignoring duplicate step output write");
            return;
        }
        outputs.insert(step_id, output);
    }

    /// Copies out all step outputs.
    pub fn step_outputs(&self) -> HashMap<String, Value> {
        self.step_outputs.read().clone()
    }

    /// The step currently being pointed at, if any.
    pub fn current_step_id(&self) -> Option<String> {
        self.current_step_id.read().clone()
    }

    /// Moves the current-step pointer.
    pub fn set_current_step_id(&self, step_id: Option<String>) {
        *self.current_step_id.write() = step_id;
    }

    /// Appends a log entry.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, step_id: Option<&str>) {
        self.logs.write().push(LogEntry {
            ts: Utc::now(),
            level,
            step_id: step_id.map(String::from),
            message: message.into(),
        });
    }

    /// All log entries.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.read().clone()
    }

    /// Log entries at or above `min_level`, optionally restricted to one
    /// step.
    pub fn logs_filtered(&self, min_level: LogLevel, step_id: Option<&str>) -> Vec<LogEntry> {
        self.logs
            .read()
            .iter()
            .filter(|entry| entry.level >= min_level)
            .filter(|entry| match step_id {
                Some(id) => entry.step_id.as_deref() == Some(id),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Produces a deep-copy snapshot of the full context state.
    pub fn create_snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            workflow_id: self.workflow_id.clone(),
            start_time: self.start_time,
            variables: self.variables.read().clone(),
            environment: self.environment.read().clone(),
            step_outputs: self.step_outputs.read().clone(),
            current_step_id: self.current_step_id.read().clone(),
            logs: self.logs.read().clone(),
        }
    }

    /// Restores state from a snapshot, replacing all current state.
    pub fn restore_from_snapshot(&self, snapshot: &ContextSnapshot) {
        *self.variables.write() = snapshot.variables.clone();
        *self.environment.write() = snapshot.environment.clone();
        *self.step_outputs.write() = snapshot.step_outputs.clone();
        *self.current_step_id.write() = snapshot.current_step_id.clone();
        *self.logs.write() = snapshot.logs.clone();
    }

    /// Rebuilds a context from a snapshot, keeping its original start
    /// time and id.
    pub fn from_snapshot(snapshot: &ContextSnapshot) -> Self {
        Self {
            workflow_id: snapshot.workflow_id.clone(),
            start_time: snapshot.start_time,
            variables: RwLock::new(snapshot.variables.clone()),
            environment: RwLock::new(snapshot.environment.clone()),
            step_outputs: RwLock::new(snapshot.step_outputs.clone()),
            current_step_id: RwLock::new(snapshot.current_step_id.clone()),
            logs: RwLock::new(snapshot.logs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::new("wf-1", HashMap::new(), HashMap::new())
    }

    #[test]
    fn test_variable_round_trip() {
        let ctx = context();
        ctx.set_variable("name", json!("John"));
        assert_eq!(ctx.get_variable("name"), Some(json!("John")));
        assert_eq!(ctx.get_variable("missing"), None);
    }

    #[test]
    fn test_step_output_written_once() {
        let ctx = context();
        ctx.set_step_output("fetch", json!({"status": "ok"}));
        ctx.set_step_output("fetch", json!({"status": "overwritten"}));
        assert_eq!(
            ctx.get_step_output("fetch"),
            Some(json!({"status": "ok"}))
        );
    }

    #[test]
    fn test_log_filtering() {
        let ctx = context();
        ctx.log(LogLevel::Debug, "noise", None);
        ctx.log(LogLevel::Info, "starting", Some("a"));
        ctx.log(LogLevel::Error, "broke", Some("b"));

        let errors = ctx.logs_filtered(LogLevel::Error, None);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "broke");

        let step_a = ctx.logs_filtered(LogLevel::Debug, Some("a"));
        assert_eq!(step_a.len(), 1);
        assert_eq!(step_a[0].message, "starting");
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let ctx = context();
        ctx.set_variable("count", json!(3));
        ctx.set_step_output("a", json!("done"));
        ctx.set_current_step_id(Some("a".to_string()));

        let snapshot = ctx.create_snapshot();

        // Mutate after the snapshot; restore must win.
        ctx.set_variable("count", json!(99));
        ctx.set_current_step_id(Some("b".to_string()));
        ctx.restore_from_snapshot(&snapshot);

        assert_eq!(ctx.get_variable("count"), Some(json!(3)));
        assert_eq!(ctx.current_step_id(), Some("a".to_string()));
        assert_eq!(ctx.get_step_output("a"), Some(json!("done")));
    }

    #[test]
    fn test_snapshot_is_deep_copy() {
        let ctx = context();
        ctx.set_variable("items", json!(["apple"]));
        let snapshot = ctx.create_snapshot();

        ctx.set_variable("items", json!(["apple", "banana"]));
        assert_eq!(snapshot.variables["items"], json!(["apple"]));
    }

    #[test]
    fn test_snapshot_serde_round_trip() {
        let ctx = context();
        ctx.set_variable("x", json!(1));
        ctx.log(LogLevel::Info, "hello", None);

        let snapshot = ctx.create_snapshot();
        let text = serde_json::to_string(&snapshot).unwrap();
        let parsed: ContextSnapshot = serde_json::from_str(&text).unwrap();
        let restored = ExecutionContext::from_snapshot(&parsed);

        assert_eq!(restored.get_variable("x"), Some(json!(1)));
        assert_eq!(restored.logs().len(), 1);
    }
}
