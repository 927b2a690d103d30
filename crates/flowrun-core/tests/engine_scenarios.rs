// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios driving real subprocess steps through the full
//! runner stack.

#![cfg(unix)]

use flowrun_core::workflow::{
    ParallelConfig, RetryConfig, ScriptConfig, Step, StepConfig, StepKind, StepParallel, Workflow,
};
use flowrun_core::{RunnerOptions, StepStatus, WorkflowDag, WorkflowRunner, WorkflowStatus};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn script_step(id: &str, command: &str, args: &[&str], deps: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        name: None,
        kind: StepKind::Script,
        config: StepConfig::Script(ScriptConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
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

fn echo_step(id: &str, deps: &[&str]) -> Step {
    script_step(id, "echo", &[id], deps)
}

fn workflow(name: &str, steps: Vec<Step>) -> Workflow {
    Workflow {
        name: name.to_string(),
        version: "1.0".to_string(),
        description: None,
        env: HashMap::new(),
        steps,
        parallel: None,
        timeout_ms: None,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn linear_dependency_chain() {
    let wf = workflow(
        "linear",
        vec![
            echo_step("a", &[]),
            echo_step("b", &[]),
            echo_step("c", &["b"]),
            echo_step("d", &["c"]),
        ],
    );

    let dag = WorkflowDag::from_workflow(&wf).unwrap();
    let order = dag.execution_order().unwrap();
    assert_eq!(order, vec!["a", "b", "c", "d"]);

    let runner = WorkflowRunner::new(RunnerOptions::default());
    let result = runner.execute(wf).await.unwrap();

    assert!(result.success);
    assert_eq!(result.step_results.len(), 4);
    for id in ["a", "b", "c", "d"] {
        let step = &result.step_results[id];
        assert!(step.success, "step {id} should succeed");
        assert_eq!(
            step.output.as_ref().unwrap()["stdout"].as_str().unwrap().trim(),
            id
        );
    }
}

#[tokio::test]
async fn diamond_fan_out_and_in() {
    let wf = workflow(
        "diamond",
        vec![
            echo_step("a", &[]),
            script_step("b", "sh", &["-c", "sleep 0.4; echo b"], &["a"]),
            script_step("c", "sh", &["-c", "sleep 0.4; echo c"], &["a"]),
            echo_step("d", &["b", "c"]),
        ],
    );

    let dag = WorkflowDag::from_workflow(&wf).unwrap();
    let groups = dag.parallel_groups(&wf, 4).unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[0].step_ids, vec!["a"]);
    assert_eq!(groups[1].step_ids, vec!["b", "c"]);
    assert_eq!(groups[2].step_ids, vec!["d"]);

    let runner = WorkflowRunner::new(RunnerOptions {
        enable_metrics: true,
        ..Default::default()
    });
    let started = Instant::now();
    let result = runner.execute(wf).await.unwrap();
    let elapsed = started.elapsed();

    assert!(result.success);
    assert_eq!(result.step_results["d"].parallel_group, Some(2));
    // b and c ran concurrently: well under the 0.8s serial floor.
    assert!(
        elapsed < Duration::from_millis(750),
        "diamond took {elapsed:?}, b and c likely serialized"
    );
    assert!(result.metrics.unwrap().peak_concurrency >= 2);
}

#[tokio::test]
async fn resource_quota_caps_parallelism() {
    let mut steps = Vec::new();
    for id in ["x", "y", "z"] {
        let mut step = script_step(id, "sh", &["-c", "sleep 0.2"], &[]);
        step.parallel = Some(StepParallel {
            resource: Some("cpu".to_string()),
            ..Default::default()
        });
        steps.push(step);
    }
    let mut wf = workflow("capped", steps);
    wf.parallel = Some(ParallelConfig {
        enabled: true,
        default_max_concurrency: 8,
        resources: HashMap::from([("cpu".to_string(), 2)]),
    });

    let runner = WorkflowRunner::new(RunnerOptions {
        enable_metrics: true,
        ..Default::default()
    });
    let result = runner.execute(wf).await.unwrap();

    assert!(result.success);
    let metrics = result.metrics.unwrap();
    assert!(
        metrics.peak_concurrency <= 2,
        "resource quota exceeded: peak {}",
        metrics.peak_concurrency
    );
}

#[tokio::test]
async fn failure_without_continue_on_error() {
    let wf = workflow(
        "failing",
        vec![
            echo_step("a", &[]),
            script_step("b", "sh", &["-c", "sleep 0.3; exit 1"], &[]),
            echo_step("c", &["b"]),
        ],
    );

    let runner = WorkflowRunner::new(RunnerOptions::default());
    let result = runner.execute(wf).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.as_ref().unwrap().contains("b"));

    assert!(result.step_results["a"].success);
    assert_eq!(result.step_results["b"].status, StepStatus::Failed);
    assert_eq!(result.step_results["c"].status, StepStatus::Skipped);
    assert_eq!(
        result.step_results["c"].skip_reason.as_deref(),
        Some("dependencies failed")
    );
}

#[tokio::test]
async fn retry_succeeds_on_third_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let script = format!(
        "n=$(cat {path} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {path}; [ $n -ge 3 ]",
        path = counter.display()
    );

    let mut step = script_step("flaky", "sh", &["-c", &script], &[]);
    step.retry = Some(RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 10,
        ..Default::default()
    });
    let wf = workflow("retrying", vec![step]);

    let runner = WorkflowRunner::new(RunnerOptions::default());
    let started = Instant::now();
    let result = runner.execute(wf).await.unwrap();

    assert!(result.success);
    let step = &result.step_results["flaky"];
    assert_eq!(step.attempts, 3);
    // Two backoff sleeps: 10ms then 20ms.
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(step.execution_time >= Duration::from_millis(30));
}

#[tokio::test]
async fn interpolation_flows_between_steps() {
    let mut first = script_step("greet", "echo", &["hello"], &[]);
    first.condition = Some("true".to_string());
    let second = script_step(
        "reply",
        "echo",
        &["{{trim(steps.greet.stdout)}} {{upper(name)}}"],
        &["greet"],
    );
    let wf = workflow("interp", vec![first, second]);

    let runner = WorkflowRunner::new(RunnerOptions {
        variables: HashMap::from([("name".to_string(), json!("john"))]),
        ..Default::default()
    });
    let result = runner.execute(wf).await.unwrap();

    assert!(result.success);
    assert_eq!(
        result.step_results["reply"].output.as_ref().unwrap()["stdout"]
            .as_str()
            .unwrap()
            .trim(),
        "hello JOHN"
    );
}

#[tokio::test]
async fn interpolation_function_failure_fails_step() {
    let step = script_step("bad", "echo", &["{{divide(1, 0)}}"], &[]);
    let wf = workflow("div-zero", vec![step]);

    let runner = WorkflowRunner::new(RunnerOptions {
        strict_interpolation: true,
        ..Default::default()
    });
    let result = runner.execute(wf).await.unwrap();

    assert!(!result.success);
    let step = &result.step_results["bad"];
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_ref().unwrap().contains("division by zero"));
}

#[tokio::test]
async fn condition_skip_and_continue() {
    let mut gated = echo_step("gated", &[]);
    gated.condition = Some("false".to_string());
    let wf = workflow("conditional", vec![gated, echo_step("always", &[])]);

    let runner = WorkflowRunner::new(RunnerOptions::default());
    let result = runner.execute(wf).await.unwrap();

    assert!(result.success);
    assert_eq!(result.step_results["gated"].status, StepStatus::Skipped);
    assert!(result.step_results["always"].success);
}

#[tokio::test]
async fn environment_overlay_reaches_scripts() {
    let mut wf = workflow(
        "env",
        vec![script_step("show", "sh", &["-c", "printf '%s' \"$STAGE\""], &[])],
    );
    wf.env.insert("STAGE".to_string(), "production".to_string());

    let runner = WorkflowRunner::new(RunnerOptions::default());
    let result = runner.execute(wf).await.unwrap();

    assert_eq!(
        result.step_results["show"].output.as_ref().unwrap()["stdout"],
        json!("production")
    );
}
