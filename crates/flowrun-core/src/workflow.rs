// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Workflow definition types and YAML loading.
//!
//! A [`Workflow`] is the immutable input to the engine: a named, versioned
//! set of typed steps with explicit dependencies. Definitions are usually
//! parsed from YAML but the engine only cares about the parsed form.

use crate::error::{ErrorKind, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Workflow name.
    pub name: String,

    /// Workflow version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Initial environment overlay applied to every step.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Ordered sequence of steps.
    pub steps: Vec<Step>,

    /// Parallel execution configuration.
    #[serde(default)]
    pub parallel: Option<ParallelConfig>,

    /// Whole-workflow deadline in milliseconds.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,

    /// Free-form metadata carried through to reports.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Workflow-level parallelism settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    /// Master switch for parallel execution.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default per-group concurrency cap.
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    /// Named resource quotas shared across the whole workflow.
    #[serde(default)]
    pub resources: HashMap<String, usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_concurrency: default_max_concurrency(),
            resources: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    4
}

/// A single workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique id within the workflow.
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// Executor kind for this step.
    #[serde(rename = "type")]
    pub kind: StepKind,

    /// Type-specific configuration, validated by the executor.
    #[serde(default)]
    pub config: StepConfig,

    /// Ids of steps that must complete before this one starts.
    #[serde(default, alias = "depends_on")]
    pub depends_on: Vec<String>,

    /// Skip the step when this expression evaluates falsy.
    #[serde(default)]
    pub condition: Option<String>,

    /// Record a failure but keep the workflow running.
    #[serde(default, alias = "continue_on_error")]
    pub continue_on_error: bool,

    /// Per-step parallelism settings.
    #[serde(default)]
    pub parallel: Option<StepParallel>,

    /// Retry policy.
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Per-step deadline in milliseconds.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    /// Display name for reports and logs.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Executor kind. Built-ins are `script` and `agent`; anything else is a
/// plugin-provided type resolved through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    Script,
    Agent,
    Custom(String),
}

impl StepKind {
    /// Canonical type string as it appears in definitions.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Script => "script",
            Self::Agent => "agent",
            Self::Custom(s) => s,
        }
    }
}

impl From<String> for StepKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "script" => Self::Script,
            "agent" => Self::Agent,
            _ => Self::Custom(s),
        }
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step configuration, one variant per built-in executor kind plus an
/// opaque mapping for plugin-defined types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepConfig {
    Script(ScriptConfig),
    Agent(AgentConfig),
    Extra(HashMap<String, Value>),
}

impl Default for StepConfig {
    fn default() -> Self {
        Self::Extra(HashMap::new())
    }
}

impl StepConfig {
    /// Typed view as a script configuration.
    pub fn as_script(&self) -> Option<&ScriptConfig> {
        match self {
            Self::Script(c) => Some(c),
            _ => None,
        }
    }

    /// Typed view as an agent configuration.
    pub fn as_agent(&self) -> Option<&AgentConfig> {
        match self {
            Self::Agent(c) => Some(c),
            _ => None,
        }
    }

    /// The raw mapping for plugin-defined types.
    pub fn as_extra(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Self::Extra(m) => Some(m),
            _ => None,
        }
    }

    /// Serializes any variant back to a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Configuration for the built-in `script` executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    /// Program to run.
    pub command: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Extra environment variables, merged over the context environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Deadline in milliseconds; overrides the step timeout.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

/// Configuration for the built-in `agent` executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Prompt, interpolated against the context before dispatch.
    pub prompt: String,

    /// Model hint passed through to the host.
    #[serde(default)]
    pub model: Option<String>,

    /// System prompt.
    #[serde(default)]
    pub system: Option<String>,

    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Output token cap.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Host-specific parameters.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Per-step parallelism settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepParallel {
    /// Whether this step may run concurrently with its group.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cap on the concurrency of the group containing this step.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Named resource this step holds while running.
    #[serde(default)]
    pub resource: Option<String>,

    /// Keep sibling failures from cancelling this step.
    #[serde(default)]
    pub isolate_errors: bool,
}

impl Default for StepParallel {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: None,
            resource: None,
            isolate_errors: false,
        }
    }
}

/// Retry policy for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempt budget; 1 means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Error kinds worth retrying; empty means executor failures and
    /// timeouts.
    #[serde(default)]
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            retryable_kinds: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

const KNOWN_WORKFLOW_KEYS: &[&str] = &[
    "name",
    "version",
    "description",
    "env",
    "steps",
    "parallel",
    "timeout",
    "metadata",
];

const KNOWN_STEP_KEYS: &[&str] = &[
    "id",
    "name",
    "type",
    "config",
    "dependsOn",
    "depends_on",
    "condition",
    "continueOnError",
    "continue_on_error",
    "parallel",
    "retry",
    "timeout",
];

impl Workflow {
    /// Parses a workflow from YAML, warning on unknown fields.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        warn_unknown_fields(&raw);
        serde_yaml::from_value(raw)
    }

    /// Reads and parses a workflow file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content).map_err(|e| {
            crate::error::EngineError::Validation(ValidationError::BadSchema(e.to_string()))
        })
    }

    /// Validates the definition, collecting every error rather than
    /// stopping at the first. Cycle detection happens later in the
    /// resolver, which needs the full graph.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::BadSchema(
                "workflow name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            errors.push(ValidationError::BadSchema(
                "workflow must declare at least one step".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                errors.push(ValidationError::DuplicateStepId(step.id.clone()));
            }
        }

        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    errors.push(ValidationError::SelfDependency(step.id.clone()));
                } else if !ids.contains(dep.as_str()) {
                    errors.push(ValidationError::MissingDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let resources = self
            .parallel
            .as_ref()
            .map(|p| &p.resources)
            .cloned()
            .unwrap_or_default();
        for (name, quota) in &resources {
            if *quota == 0 {
                errors.push(ValidationError::ZeroResourceQuota(name.clone()));
            }
        }
        for step in &self.steps {
            if let Some(resource) = step.parallel.as_ref().and_then(|p| p.resource.as_ref()) {
                if !resources.contains_key(resource) {
                    errors.push(ValidationError::UnknownResource {
                        step_id: step.id.clone(),
                        resource: resource.clone(),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Effective parallel configuration, defaulted when absent.
    pub fn parallel_config(&self) -> ParallelConfig {
        self.parallel.clone().unwrap_or_default()
    }
}

fn warn_unknown_fields(raw: &serde_yaml::Value) {
    let Some(mapping) = raw.as_mapping() else {
        return;
    };
    for key in mapping.keys() {
        if let Some(key) = key.as_str() {
            if !KNOWN_WORKFLOW_KEYS.contains(&key) {
                warn!(field = key, "ignoring unknown workflow field");
            }
        }
    }
    let Some(steps) = mapping
        .iter()
        .find(|(key, _)| key.as_str() == Some("steps"))
        .and_then(|(_, value)| value.as_sequence())
    else {
        return;
    };
    for step in steps {
        let Some(step) = step.as_mapping() else {
            continue;
        };
        for key in step.keys() {
            if let Some(key) = key.as_str() {
                if !KNOWN_STEP_KEYS.contains(&key) {
                    warn!(field = key, "ignoring unknown step field");
                }
            }
        }
    }
}
