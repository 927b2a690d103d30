// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Engine metrics: a process-wide prometheus registry plus the per-run
//! metrics block attached to workflow results.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

lazy_static! {
    /// Steps reaching a terminal state, labeled by status.
    pub static ref STEPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "flowrun_steps_total",
        "Steps reaching a terminal state",
        &["status"]
    )
    .expect("valid metric");

    /// Wall-clock step duration, labeled by step type.
    pub static ref STEP_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "flowrun_step_duration_seconds",
        "Wall-clock step duration in seconds",
        &["type"]
    )
    .expect("valid metric");

    /// Workflows reaching a terminal state, labeled by status.
    pub static ref WORKFLOWS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "flowrun_workflows_total",
        "Workflows reaching a terminal state",
        &["status"]
    )
    .expect("valid metric");

    /// Retry attempts across all steps.
    pub static ref STEP_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "flowrun_step_retries_total",
        "Retry attempts across all steps"
    )
    .expect("valid metric");
}

/// Records one terminal step transition.
pub fn record_step(status: &str, step_type: &str, duration: Duration) {
    STEPS_TOTAL.with_label_values(&[status]).inc();
    STEP_DURATION_SECONDS
        .with_label_values(&[step_type])
        .observe(duration.as_secs_f64());
}

/// Records one terminal workflow transition.
pub fn record_workflow(status: &str) {
    WORKFLOWS_TOTAL.with_label_values(&[status]).inc();
}

/// Per-run metrics block included in results when metrics are enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub cancelled_steps: usize,
    pub total_retries: u64,
    pub peak_concurrency: usize,
    pub duration_ms: u64,
}

/// Tracks current and peak in-flight step counts.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    /// Marks one step entering execution; returns the new current count.
    pub fn enter(&self) -> usize {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        now
    }

    /// Marks one step leaving execution.
    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_tracks_peak() {
        let gauge = ConcurrencyGauge::default();
        assert_eq!(gauge.enter(), 1);
        assert_eq!(gauge.enter(), 2);
        gauge.exit();
        assert_eq!(gauge.enter(), 2);
        assert_eq!(gauge.peak(), 2);
        gauge.exit();
        gauge.exit();
        assert_eq!(gauge.current(), 0);
        assert_eq!(gauge.peak(), 2);
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_step("completed", "script", Duration::from_millis(5));
        record_workflow("completed");
        STEP_RETRIES_TOTAL.inc();
    }
}
