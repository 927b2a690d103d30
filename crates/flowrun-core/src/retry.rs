// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Retry with exponential backoff, and per-attempt deadlines.
//!
//! A [`RetryExecutor`] wraps one step execution with an attempt budget.
//! Only errors whose [`ErrorKind`] matches the policy retry; cancellation
//! interrupts both attempts and backoff sleeps.

use crate::error::{EngineError, ErrorKind, Result};
use crate::workflow::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry policy for a single step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempt budget; 1 means no retry.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Backoff multiplier applied per retry.
    pub multiplier: f64,

    /// Cap on any single delay.
    pub max_delay: Duration,

    /// Randomize each delay between 50% and 150% of nominal.
    pub jitter: bool,

    /// Error kinds worth retrying; empty means executor failures and
    /// timeouts.
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
            retryable_kinds: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier,
            max_delay,
            ..Default::default()
        }
    }

    /// Builds a policy from a step's retry configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: false,
            retryable_kinds: config.retryable_kinds.clone(),
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Nominal delay after `retry_index` failed attempts (1-based):
    /// `initial * multiplier^(retry_index - 1)`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry_index: u32) -> Duration {
        let factor = self.multiplier.powi(retry_index.saturating_sub(1) as i32);
        let nominal = self.initial_delay.mul_f64(factor.max(0.0));
        let capped = nominal.min(self.max_delay);
        if self.jitter {
            capped.mul_f64(0.5 + rand::random::<f64>())
        } else {
            capped
        }
    }

    /// Whether an error is worth another attempt.
    pub fn should_retry(&self, error: &EngineError) -> bool {
        let kind = error.kind();
        if matches!(kind, ErrorKind::Cancelled | ErrorKind::Validation) {
            return false;
        }
        if self.retryable_kinds.is_empty() {
            matches!(kind, ErrorKind::ExecutorFailure | ErrorKind::Timeout)
        } else {
            self.retryable_kinds.contains(&kind)
        }
    }
}

/// Drives an operation through a retry policy.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `operation` until it succeeds, exhausts the attempt budget,
    /// or fails non-retryably. Returns the final result and the number of
    /// attempts made.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_retry_hook(cancel, operation, |_, _| async {})
            .await
    }

    /// As [`execute`], invoking `on_retry(attempt, error)` before each
    /// backoff sleep.
    ///
    /// [`execute`]: RetryExecutor::execute
    pub async fn execute_with_retry_hook<T, F, Fut, H, HFut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_retry: H,
    ) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        H: FnMut(u32, String) -> HFut,
        HFut: Future<Output = ()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return (
                    Err(EngineError::Cancelled(
                        "cancelled before attempt".to_string(),
                    )),
                    attempt,
                );
            }

            match operation(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(error) => {
                    if attempt >= self.policy.max_attempts || !self.policy.should_retry(&error) {
                        return (Err(error), attempt);
                    }

                    let delay = self.policy.delay_for_retry(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after backoff"
                    );
                    on_retry(attempt, error.to_string()).await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return (
                                Err(EngineError::Cancelled(
                                    "cancelled during retry backoff".to_string(),
                                )),
                                attempt,
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Runs a future under an optional deadline. When the deadline expires
/// the child token is tripped and the future is awaited for `grace`
/// before being abandoned; either way the step records a timeout.
pub async fn with_deadline<T>(
    deadline: Option<Duration>,
    grace: Duration,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(deadline) = deadline else {
        return fut.await;
    };

    tokio::pin!(fut);
    tokio::select! {
        result = &mut fut => result,
        _ = tokio::time::sleep(deadline) => {
            cancel.cancel();
            tokio::select! {
                _ = &mut fut => {}
                _ = tokio::time::sleep(grace) => {
                    debug!("abandoning step after grace period");
                }
            }
            Err(EngineError::Timeout { duration: deadline })
        }
    }
}
