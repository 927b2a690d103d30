// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the workflow engine.
//!
//! Every failure the engine can surface is an [`EngineError`]. Retry
//! policies match on the coarser [`ErrorKind`] classification rather than
//! on concrete variants.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Definition-level validation failure.
    #[error("workflow validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No executor registered for a step type.
    #[error("no executor registered for step type '{0}'")]
    ExecutorMissing(String),

    /// A step's executor returned failure or panicked.
    #[error("step '{step_id}' failed: {reason}")]
    ExecutorFailure { step_id: String, reason: String },

    /// Step or workflow deadline exceeded.
    #[error("deadline of {}ms exceeded", .duration.as_millis())]
    Timeout { duration: Duration },

    /// User-requested or fatal-failure cancellation.
    #[error("execution cancelled: {0}")]
    Cancelled(String),

    /// Variable interpolation failure.
    #[error("interpolation failed: {0}")]
    Interpolation(#[from] InterpolationError),

    /// Snapshot read/write/serialize failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Hook handler failure (surfaced only when error isolation is off).
    #[error("hook '{hook_id}' failed: {reason}")]
    Hook { hook_id: String, reason: String },

    /// Hook registry is at capacity.
    #[error("hook limit of {0} exceeded")]
    HookLimitExceeded(usize),

    /// Unusable resource configuration.
    #[error("unusable resource configuration: {0}")]
    ResourceExhausted(String),

    /// Referenced step does not exist.
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Creates an `Other` error from any displayable value.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Creates an executor failure for a step.
    pub fn executor_failure(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutorFailure {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    /// Classifies this error for retry matching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ExecutorMissing(_) => ErrorKind::ExecutorMissing,
            Self::ExecutorFailure { .. } => ErrorKind::ExecutorFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Interpolation(_) => ErrorKind::Interpolation,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Hook { .. } | Self::HookLimitExceeded(_) => ErrorKind::Hook,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Io(_) => ErrorKind::ExecutorFailure,
            Self::StepNotFound(_) | Self::Serialization(_) | Self::Other(_) => ErrorKind::Other,
        }
    }

    /// True when the error is a cancellation (never retried).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Coarse error classification used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ExecutorMissing,
    ExecutorFailure,
    Timeout,
    Cancelled,
    Interpolation,
    Persistence,
    Hook,
    ResourceExhausted,
    Other,
}

/// Definition-level validation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The dependency graph contains at least one cycle.
    #[error("dependency cycle involving steps: {}", .remaining.join(", "))]
    Cycle { remaining: Vec<String> },

    /// A step depends on an id that is not declared in the workflow.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    MissingDependency { step_id: String, dependency: String },

    /// A step depends on itself.
    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    /// Two steps share the same id.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// A step names a resource absent from the workflow resource table.
    #[error("step '{step_id}' names unknown resource '{resource}'")]
    UnknownResource { step_id: String, resource: String },

    /// A resource quota is zero.
    #[error("resource '{0}' has a zero quota")]
    ZeroResourceQuota(String),

    /// A step type has no registered executor at validation time.
    #[error("step '{step_id}' has unknown type '{kind}'")]
    UnknownStepType { step_id: String, kind: String },

    /// The definition is structurally unusable.
    #[error("bad workflow schema: {0}")]
    BadSchema(String),
}

/// Variable interpolation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterpolationError {
    /// A referenced path resolved to nothing in strict mode.
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// Re-interpolation did not reach a fixed point within the depth cap.
    #[error("interpolation exceeded max depth of {0}")]
    MaxDepthExceeded(usize),

    /// The expression inside `{{ }}` could not be parsed.
    #[error("malformed expression '{expression}': {reason}")]
    MalformedExpression { expression: String, reason: String },

    /// A built-in function rejected its arguments.
    #[error("function '{name}' failed: {reason}")]
    FunctionFailure { name: String, reason: String },

    /// Call to a function that does not exist.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
}

impl InterpolationError {
    pub(crate) fn malformed(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedExpression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn function(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FunctionFailure {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
