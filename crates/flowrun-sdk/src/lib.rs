// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Builder API for constructing workflow definitions programmatically.
//!
//! ```
//! use flowrun_sdk::{StepBuilder, WorkflowBuilder};
//!
//! let workflow = WorkflowBuilder::new("nightly-report")
//!     .description("Build and publish the nightly report")
//!     .resource("cpu", 2)
//!     .step(StepBuilder::script("extract", "python").arg("extract.py"))
//!     .step(
//!         StepBuilder::script("render", "python")
//!             .arg("render.py")
//!             .depends_on("extract")
//!             .resource("cpu"),
//!     )
//!     .build()
//!     .unwrap();
//! assert_eq!(workflow.steps.len(), 2);
//! ```

use anyhow::{bail, Result};
use flowrun_core::workflow::{
    AgentConfig, ParallelConfig, RetryConfig, ScriptConfig, Step, StepConfig, StepKind,
    StepParallel, Workflow,
};
use serde_json::Value;
use std::collections::HashMap;

/// Fluent builder for a [`Workflow`].
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    version: String,
    description: Option<String>,
    env: HashMap<String, String>,
    steps: Vec<Step>,
    parallel: ParallelConfig,
    timeout_ms: Option<u64>,
    metadata: HashMap<String, Value>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0".to_string(),
            description: None,
            env: HashMap::new(),
            steps: Vec::new(),
            parallel: ParallelConfig::default(),
            timeout_ms: None,
            metadata: HashMap::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds an environment overlay entry.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Declares a named resource quota.
    pub fn resource(mut self, name: impl Into<String>, quota: usize) -> Self {
        self.parallel.resources.insert(name.into(), quota);
        self
    }

    pub fn parallel_enabled(mut self, enabled: bool) -> Self {
        self.parallel.enabled = enabled;
        self
    }

    pub fn default_max_concurrency(mut self, cap: usize) -> Self {
        self.parallel.default_max_concurrency = cap;
        self
    }

    /// Whole-workflow deadline in milliseconds.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Appends a step.
    pub fn step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Finalizes and validates the definition.
    pub fn build(self) -> Result<Workflow> {
        let workflow = Workflow {
            name: self.name,
            version: self.version,
            description: self.description,
            env: self.env,
            steps: self.steps,
            parallel: Some(self.parallel),
            timeout_ms: self.timeout_ms,
            metadata: self.metadata,
        };
        if let Err(errors) = workflow.validate() {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            bail!("invalid workflow definition: {joined}");
        }
        Ok(workflow)
    }
}

/// Fluent builder for a [`Step`].
#[derive(Debug, Clone)]
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    /// A `script` step running `command`.
    pub fn script(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            step: Step {
                id: id.into(),
                name: None,
                kind: StepKind::Script,
                config: StepConfig::Script(ScriptConfig {
                    command: command.into(),
                    args: Vec::new(),
                    cwd: None,
                    env: HashMap::new(),
                    timeout_ms: None,
                }),
                depends_on: Vec::new(),
                condition: None,
                continue_on_error: false,
                parallel: None,
                retry: None,
                timeout_ms: None,
            },
        }
    }

    /// An `agent` step with the given prompt.
    pub fn agent(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            step: Step {
                id: id.into(),
                name: None,
                kind: StepKind::Agent,
                config: StepConfig::Agent(AgentConfig {
                    prompt: prompt.into(),
                    model: None,
                    system: None,
                    temperature: None,
                    max_tokens: None,
                    extra: HashMap::new(),
                }),
                depends_on: Vec::new(),
                condition: None,
                continue_on_error: false,
                parallel: None,
                retry: None,
                timeout_ms: None,
            },
        }
    }

    /// A plugin-typed step with an opaque config mapping.
    pub fn custom(
        id: impl Into<String>,
        kind: impl Into<String>,
        config: HashMap<String, Value>,
    ) -> Self {
        Self {
            step: Step {
                id: id.into(),
                name: None,
                kind: StepKind::Custom(kind.into()),
                config: StepConfig::Extra(config),
                depends_on: Vec::new(),
                condition: None,
                continue_on_error: false,
                parallel: None,
                retry: None,
                timeout_ms: None,
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.step.name = Some(name.into());
        self
    }

    /// Appends one script argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        if let StepConfig::Script(config) = &mut self.step.config {
            config.args.push(arg.into());
        }
        self
    }

    /// Replaces the script argument list.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        if let StepConfig::Script(config) = &mut self.step.config {
            config.args = args.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Adds a script environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let StepConfig::Script(config) = &mut self.step.config {
            config.env.insert(key.into(), value.into());
        }
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        if let StepConfig::Script(config) = &mut self.step.config {
            config.cwd = Some(cwd.into());
        }
        self
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.step.depends_on.push(dep.into());
        self
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.step.condition = Some(condition.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.step.continue_on_error = true;
        self
    }

    /// Simple retry policy with exponential backoff defaults.
    pub fn retry(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.step.retry = Some(RetryConfig {
            max_attempts,
            initial_delay_ms,
            ..Default::default()
        });
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.step.retry = Some(retry);
        self
    }

    /// Per-step deadline in milliseconds.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step.timeout_ms = Some(timeout_ms);
        self
    }

    /// Caps the concurrency of the group containing this step.
    pub fn max_concurrency(mut self, cap: usize) -> Self {
        self.step
            .parallel
            .get_or_insert_with(StepParallel::default)
            .max_concurrency = Some(cap);
        self
    }

    /// Tags the step with a named resource.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.step
            .parallel
            .get_or_insert_with(StepParallel::default)
            .resource = Some(resource.into());
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}

impl From<StepBuilder> for Step {
    fn from(builder: StepBuilder) -> Self {
        builder.build()
    }
}
