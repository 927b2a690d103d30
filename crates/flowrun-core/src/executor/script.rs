// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Built-in subprocess executor for `script` steps.

use super::StepExecutor;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::interpolate::Interpolator;
use crate::workflow::{ScriptConfig, Step, StepConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sentinel variable present in every spawned script environment.
pub const WORKFLOW_SENTINEL: &str = "FLOWRUN_WORKFLOW";

const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Spawns the step's command, captures bounded stdout/stderr, and maps
/// the exit status to a step outcome.
pub struct ScriptExecutor {
    max_output_bytes: usize,
}

impl ScriptExecutor {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    fn config(step: &Step) -> Result<ScriptConfig> {
        match &step.config {
            StepConfig::Script(config) => Ok(config.clone()),
            StepConfig::Extra(map) => {
                serde_json::from_value(json!(map)).map_err(|e| {
                    EngineError::executor_failure(
                        &step.id,
                        format!("invalid script config: {e}"),
                    )
                })
            }
            StepConfig::Agent(_) => Err(EngineError::executor_failure(
                &step.id,
                "expected script config, found agent config",
            )),
        }
    }
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

#[async_trait]
impl StepExecutor for ScriptExecutor {
    fn kind(&self) -> &str {
        "script"
    }

    fn validate(&self, step: &Step) -> Result<()> {
        let config = Self::config(step)?;
        if config.command.trim().is_empty() {
            return Err(EngineError::executor_failure(
                &step.id,
                "script command must not be empty",
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: Arc<ExecutionContext>,
        interpolator: &Interpolator,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let config = Self::config(step)?;

        let command = interpolator.interpolate_str(&ctx, &config.command)?;
        let mut args = Vec::with_capacity(config.args.len());
        for arg in &config.args {
            args.push(interpolator.interpolate_str(&ctx, arg)?);
        }

        let mut env: HashMap<String, String> = ctx.environment();
        for (key, value) in &config.env {
            env.insert(key.clone(), interpolator.interpolate_str(&ctx, value)?);
        }
        env.insert(WORKFLOW_SENTINEL.to_string(), "1".to_string());
        env.insert(
            "FLOWRUN_WORKFLOW_ID".to_string(),
            ctx.workflow_id().to_string(),
        );
        env.insert("FLOWRUN_STEP_ID".to_string(), step.id.clone());

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(interpolator.interpolate_str(&ctx, cwd)?);
        }

        debug!(step_id = %step.id, command = %command, "spawning script");
        let mut child = cmd.spawn().map_err(|e| {
            EngineError::executor_failure(&step.id, format!("failed to spawn '{command}': {e}"))
        })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        // Readers signal overflow so the child can be killed promptly.
        let (overflow_tx, mut overflow_rx) = mpsc::channel::<()>(2);
        let stdout_task = tokio::spawn(read_capped(
            stdout,
            self.max_output_bytes,
            overflow_tx.clone(),
        ));
        let stderr_task = tokio::spawn(read_capped(stderr, self.max_output_bytes, overflow_tx));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                EngineError::executor_failure(&step.id, format!("wait failed: {e}"))
            })?,
            _ = overflow_rx.recv() => {
                warn!(step_id = %step.id, "output limit exceeded, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(EngineError::executor_failure(
                    &step.id,
                    format!("output exceeded {} bytes", self.max_output_bytes),
                ));
            }
            _ = cancel.cancelled() => {
                debug!(step_id = %step.id, "cancellation requested, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(EngineError::Cancelled(format!(
                    "step '{}' cancelled",
                    step.id
                )));
            }
        };

        let (stdout_buf, stdout_overflow) = stdout_task
            .await
            .map_err(|e| EngineError::executor_failure(&step.id, format!("reader failed: {e}")))?;
        let (stderr_buf, stderr_overflow) = stderr_task
            .await
            .map_err(|e| EngineError::executor_failure(&step.id, format!("reader failed: {e}")))?;

        if stdout_overflow || stderr_overflow {
            return Err(EngineError::executor_failure(
                &step.id,
                format!("output exceeded {} bytes", self.max_output_bytes),
            ));
        }

        let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

        match status.code() {
            Some(0) => Ok(json!({
                "stdout": stdout,
                "stderr": stderr,
                "exitCode": 0,
            })),
            Some(code) => Err(EngineError::executor_failure(
                &step.id,
                format!("exit code {code}: {}", tail(&stderr, 512)),
            )),
            None => Err(EngineError::executor_failure(
                &step.id,
                "terminated by signal",
            )),
        }
    }
}

/// Reads a stream into a capped buffer. Returns the captured bytes and
/// whether the cap was hit; on overflow a notification is sent and the
/// reader stops consuming.
pub(crate) async fn read_capped(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    cap: usize,
    overflow: mpsc::Sender<()>,
) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return (buf, false),
            Ok(n) => {
                if buf.len() + n > cap {
                    buf.extend_from_slice(&chunk[..cap.saturating_sub(buf.len()).min(n)]);
                    let _ = overflow.try_send(());
                    return (buf, true);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(_) => return (buf, false),
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let start = s.len() - max;
        // Stay on a char boundary.
        let mut start = start;
        while !s.is_char_boundary(start) {
            start += 1;
        }
        &s[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn context() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(
            "wf-script",
            HashMap::new(),
            HashMap::new(),
        ))
    }

    fn script_step(id: &str, command: &str, args: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: None,
            kind: crate::workflow::StepKind::Script,
            config: StepConfig::Script(ScriptConfig {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
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
        }
    }

    #[tokio::test]
    async fn test_echo_succeeds() {
        let executor = ScriptExecutor::default();
        let step = script_step("a", "echo", &["hello"]);
        let output = executor
            .execute(
                &step,
                context(),
                &Interpolator::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output["exitCode"], json!(0));
        assert_eq!(output["stdout"].as_str().unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let executor = ScriptExecutor::default();
        let step = script_step("b", "sh", &["-c", "echo oops >&2; exit 3"]);
        let err = executor
            .execute(
                &step,
                context(),
                &Interpolator::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            EngineError::ExecutorFailure { step_id, reason } => {
                assert_eq!(step_id, "b");
                assert!(reason.contains("exit code 3"));
                assert!(reason.contains("oops"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let executor = ScriptExecutor::default();
        let step = script_step("c", "/nonexistent/definitely-not-a-binary", &[]);
        let err = executor
            .execute(
                &step,
                context(),
                &Interpolator::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_environment_sentinel_and_context_env() {
        let ctx = context();
        ctx.set_environment_variable("GREETING", "hi");

        let executor = ScriptExecutor::default();
        let step = script_step(
            "d",
            "sh",
            &["-c", "printf '%s %s %s' \"$GREETING\" \"$FLOWRUN_WORKFLOW\" \"$FLOWRUN_STEP_ID\""],
        );
        let output = executor
            .execute(
                &step,
                ctx,
                &Interpolator::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output["stdout"], json!("hi 1 d"));
    }

    #[tokio::test]
    async fn test_args_are_interpolated() {
        let ctx = context();
        ctx.set_variable("who", json!("world"));

        let executor = ScriptExecutor::default();
        let step = script_step("e", "echo", &["hello {{who}}"]);
        let output = executor
            .execute(
                &step,
                ctx,
                &Interpolator::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output["stdout"].as_str().unwrap().trim(), "hello world");
    }

    #[tokio::test]
    async fn test_output_cap_kills_child() {
        let executor = ScriptExecutor::new(1024);
        let step = script_step("f", "sh", &["-c", "yes x | head -c 100000; sleep 30"]);
        let err = executor
            .execute(
                &step,
                context(),
                &Interpolator::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("output exceeded"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let executor = ScriptExecutor::default();
        let step = script_step("g", "sleep", &["30"]);
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let err = executor
            .execute(&step, context(), &Interpolator::default(), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled(_)));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let executor = ScriptExecutor::default();
        let step = script_step("h", "  ", &[]);
        assert!(executor.validate(&step).is_err());
    }
}
