// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Workflow-level shutdown control.
//!
//! User cancellation, fatal step failures, and the workflow deadline all
//! flow through one [`ShutdownController`]; everything downstream
//! (scheduler, executors, hook handlers) observes child tokens of its
//! root cancellation token.

use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why the workflow is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Explicit cancel request.
    UserCancel(String),

    /// A step failed without `continue_on_error`.
    FatalStep(String),

    /// The whole-workflow deadline expired.
    WorkflowTimeout,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserCancel(reason) => write!(f, "cancelled by user: {reason}"),
            Self::FatalStep(step_id) => write!(f, "fatal failure in step '{step_id}'"),
            Self::WorkflowTimeout => write!(f, "workflow timeout"),
        }
    }
}

/// Fuses all shutdown causes into a single cancellation token tree.
#[derive(Debug)]
pub struct ShutdownController {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    grace_period: Duration,
}

impl ShutdownController {
    /// Default grace period granted to in-flight work after cancellation.
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            grace_period,
        }
    }

    /// The root token; cancelled exactly once, on the first shutdown.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A child token for one step or subsystem.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Requests shutdown. The first reason wins; later calls are ignored.
    /// Returns true when this call initiated the shutdown.
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.token.cancel();
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new(Self::DEFAULT_GRACE_PERIOD)
    }
}
