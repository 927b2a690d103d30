// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint and resume scenarios against the filesystem state store.

#![cfg(all(unix, feature = "state-persistence"))]

use flowrun_core::workflow::{ScriptConfig, Step, StepConfig, StepKind, Workflow};
use flowrun_core::{RunnerOptions, StepStatus, WorkflowRunner, WorkflowStatus};
use flowrun_state::{FileStateStore, SnapshotStatus, StateStore, StateStoreRef};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn appending_step(id: &str, log: &Path, deps: &[&str], gate: Option<&Path>) -> Step {
    // Appends its id to the log; optionally fails until the gate file
    // exists.
    let mut script = format!("echo {id} >> {}", log.display());
    if let Some(gate) = gate {
        script = format!("test -f {} && {script}", gate.display());
    }
    Step {
        id: id.to_string(),
        name: None,
        kind: StepKind::Script,
        config: StepConfig::Script(ScriptConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            cwd: None,
            env: HashMap::new(),
            timeout_ms: None,
        }),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        condition: None,
        continue_on_error: false,
        parallel: None,
        retry: None,
        timeout_ms: None,
    }
}

fn linear_workflow(log: &Path, gate: &Path) -> Workflow {
    Workflow {
        name: "resumable".to_string(),
        version: "1.0".to_string(),
        description: None,
        env: HashMap::new(),
        steps: vec![
            appending_step("s1", log, &[], None),
            appending_step("s2", log, &["s1"], None),
            appending_step("s3", log, &["s2"], None),
            appending_step("s4", log, &["s3"], Some(gate)),
            appending_step("s5", log, &["s4"], None),
        ],
        parallel: None,
        timeout_ms: None,
        metadata: HashMap::new(),
    }
}

fn store(dir: &Path) -> StateStoreRef {
    Arc::new(
        FileStateStore::new(dir.join("state"))
            .unwrap()
            .with_backup(true),
    )
}

fn log_lines(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn interrupted_workflow_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("ran.log");
    let gate = dir.path().join("gate");
    let store = store(dir.path());

    // First run: s4 fails (gate missing) after s1..s3 checkpointed.
    let runner = WorkflowRunner::new(RunnerOptions {
        checkpoint_interval: 1,
        ..Default::default()
    })
    .with_state_store(store.clone());
    let first = runner
        .execute(linear_workflow(&log, &gate))
        .await
        .unwrap();

    assert!(!first.success);
    assert_eq!(first.step_results["s3"].status, StepStatus::Completed);
    assert_eq!(first.step_results["s4"].status, StepStatus::Failed);
    assert_eq!(first.step_results["s5"].status, StepStatus::Skipped);
    assert_eq!(log_lines(&log), vec!["s1", "s2", "s3"]);

    // The persisted snapshot reflects the interruption point.
    let snapshot = store.load(&first.workflow_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Failed);
    assert_eq!(snapshot.completed_steps(), vec!["s1", "s2", "s3"]);
    assert_eq!(snapshot.current_index, 3);

    // Unblock s4 and resume on a fresh runner.
    std::fs::write(&gate, "open").unwrap();
    let resumed_runner =
        WorkflowRunner::new(RunnerOptions::default()).with_state_store(store.clone());
    let second = resumed_runner.resume(&first.workflow_id).await.unwrap();

    assert!(second.success, "resume failed: {:?}", second.error);
    assert_eq!(second.status, WorkflowStatus::Completed);
    assert_eq!(second.workflow_id, first.workflow_id);
    assert_eq!(second.step_results.len(), 5);
    for id in ["s1", "s2", "s3", "s4", "s5"] {
        assert_eq!(second.step_results[id].status, StepStatus::Completed);
    }

    // Steps 1-3 were restored, not re-run.
    assert_eq!(log_lines(&log), vec!["s1", "s2", "s3", "s4", "s5"]);

    // Restored outputs are identical to the first run's.
    for id in ["s1", "s2", "s3"] {
        assert_eq!(
            second.step_results[id].output,
            first.step_results[id].output
        );
    }

    // Terminal snapshot.
    let final_snapshot = store.load(&first.workflow_id).await.unwrap().unwrap();
    assert_eq!(final_snapshot.status, SnapshotStatus::Completed);
    assert_eq!(final_snapshot.completed_steps().len(), 5);
}

#[tokio::test]
async fn completed_workflow_is_not_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("ran.log");
    let gate = dir.path().join("gate");
    std::fs::write(&gate, "open").unwrap();
    let store = store(dir.path());

    let runner =
        WorkflowRunner::new(RunnerOptions::default()).with_state_store(store.clone());
    let result = runner
        .execute(linear_workflow(&log, &gate))
        .await
        .unwrap();
    assert!(result.success);

    let resumed_runner =
        WorkflowRunner::new(RunnerOptions::default()).with_state_store(store);
    let err = resumed_runner.resume(&result.workflow_id).await.unwrap_err();
    assert!(err.to_string().contains("not resumable"));
}

#[tokio::test]
async fn resume_of_unknown_workflow_fails() {
    let dir = tempfile::tempdir().unwrap();
    let runner = WorkflowRunner::new(RunnerOptions::default())
        .with_state_store(store(dir.path()));
    let err = runner.resume("no-such-id").await.unwrap_err();
    assert!(err.to_string().contains("no snapshot"));
}

#[tokio::test]
async fn checkpoint_backups_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("ran.log");
    let gate = dir.path().join("gate");
    std::fs::write(&gate, "open").unwrap();
    let store = store(dir.path());

    let runner =
        WorkflowRunner::new(RunnerOptions::default()).with_state_store(store.clone());
    let result = runner
        .execute(linear_workflow(&log, &gate))
        .await
        .unwrap();
    assert!(result.success);

    let bak = dir
        .path()
        .join("state")
        .join(format!("{}.json.bak", result.workflow_id));
    assert!(bak.exists(), "previous snapshot generation missing");
}
