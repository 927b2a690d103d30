// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Step executor contract and registry.
//!
//! The engine never runs a step type it has no executor for. Built-ins
//! cover `script` and `agent`; plugins may register additional kinds
//! through the same four-operation contract.

mod agent;
mod plugin;
mod script;

pub use agent::{AgentExecutor, AgentHost, AgentRequest, AgentResponse};
pub use plugin::{discover_plugins, register_plugins, LoadedPlugin, PluginExecutor, PluginManifest};
pub use script::ScriptExecutor;

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::interpolate::Interpolator;
use crate::workflow::Step;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pluggable strategy for realizing one step type.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The step type this executor serves.
    fn kind(&self) -> &str;

    /// Whether this executor can run the given step.
    fn can_execute(&self, step: &Step) -> bool {
        step.kind.as_str() == self.kind()
    }

    /// Definition-time validation of the step's config.
    fn validate(&self, step: &Step) -> Result<()>;

    /// Runs the step. Reads the context (interpolating references) and
    /// returns the step output; must observe the cancellation token
    /// around any blocking work.
    async fn execute(
        &self,
        step: &Step,
        ctx: Arc<ExecutionContext>,
        interpolator: &Interpolator,
        cancel: CancellationToken,
    ) -> Result<Value>;
}

/// Maps step types to executors.
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    /// A registry with the built-in `script` executor. The `agent`
    /// executor joins once a host is supplied via [`with_agent_host`].
    ///
    /// [`with_agent_host`]: ExecutorRegistry::with_agent_host
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry
            .register(Arc::new(ScriptExecutor::default()))
            .expect("empty registry accepts builtins");
        registry
    }

    /// Registers the `agent` executor backed by the given host.
    pub fn with_agent_host(self, host: Arc<dyn AgentHost>) -> Result<Self> {
        self.register(Arc::new(AgentExecutor::new(host)))?;
        Ok(self)
    }

    /// Registers an executor. Duplicate kinds are rejected.
    pub fn register(&self, executor: Arc<dyn StepExecutor>) -> Result<()> {
        let kind = executor.kind().to_string();
        if self.executors.contains_key(&kind) {
            return Err(EngineError::other(format!(
                "executor for step type '{kind}' already registered"
            )));
        }
        debug!(kind = %kind, "registered step executor");
        self.executors.insert(kind, executor);
        Ok(())
    }

    /// Resolves the executor for a step type.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn StepExecutor>> {
        self.executors
            .get(kind)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::ExecutorMissing(kind.to_string()))
    }

    /// Whether a step type is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    /// All registered step types.
    pub fn kinds(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolves and validates a step against its executor.
    pub fn validate_step(&self, step: &Step) -> Result<()> {
        let executor = self.get(step.kind.as_str())?;
        if !executor.can_execute(step) {
            return Err(EngineError::other(format!(
                "executor '{}' refused step '{}'",
                executor.kind(),
                step.id
            )));
        }
        executor.validate(step)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
