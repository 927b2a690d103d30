// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Plugin discovery and the generic plugin executor.
//!
//! A plugin is a directory containing a `plugin.json` manifest naming an
//! entry point and the step types it serves. The entry point runs as a
//! subprocess: it receives the step's config as JSON on stdin and prints
//! its output (JSON if it can) on stdout.

use super::script::read_capped;
use super::StepExecutor;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::interpolate::Interpolator;
use crate::workflow::Step;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "plugin.json";
const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Plugin manifest schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,

    /// Entry point, relative to the plugin directory.
    pub main: String,

    /// Step types this plugin serves.
    pub step_types: Vec<String>,
}

/// A manifest plus the directory it was found in.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub root: PathBuf,
}

/// Scans a directory for plugin manifests. Subdirectories without a
/// manifest are skipped; unparseable manifests are logged and skipped.
pub fn discover_plugins(dir: &Path) -> Result<Vec<LoadedPlugin>> {
    let mut plugins = Vec::new();
    if !dir.is_dir() {
        return Ok(plugins);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let root = entry.path();
        if !root.is_dir() {
            continue;
        }
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&manifest_path)?;
        match serde_json::from_str::<PluginManifest>(&content) {
            Ok(manifest) => {
                debug!(
                    plugin = %manifest.name,
                    version = %manifest.version,
                    path = %root.display(),
                    "discovered plugin"
                );
                plugins.push(LoadedPlugin { manifest, root });
            }
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "skipping invalid plugin manifest");
            }
        }
    }

    // Deterministic registration order.
    plugins.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    Ok(plugins)
}

/// Discovers plugins under `dir` and registers an executor per declared
/// step type. Returns how many executors were registered; duplicate step
/// types are rejected by the registry.
pub fn register_plugins(registry: &super::ExecutorRegistry, dir: &Path) -> Result<usize> {
    let mut registered = 0;
    for plugin in discover_plugins(dir)? {
        for step_type in &plugin.manifest.step_types {
            registry.register(Arc::new(PluginExecutor::new(
                plugin.clone(),
                step_type.clone(),
            )))?;
            registered += 1;
        }
        info!(
            plugin = %plugin.manifest.name,
            step_types = ?plugin.manifest.step_types,
            "registered plugin"
        );
    }
    Ok(registered)
}

/// Runs one plugin-provided step type through the plugin's entry point.
pub struct PluginExecutor {
    plugin: LoadedPlugin,
    step_type: String,
    max_output_bytes: usize,
}

impl PluginExecutor {
    pub fn new(plugin: LoadedPlugin, step_type: String) -> Self {
        Self {
            plugin,
            step_type,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[async_trait]
impl StepExecutor for PluginExecutor {
    fn kind(&self) -> &str {
        &self.step_type
    }

    fn validate(&self, _step: &Step) -> Result<()> {
        let main = self.plugin.root.join(&self.plugin.manifest.main);
        if !main.is_file() {
            return Err(EngineError::other(format!(
                "plugin '{}' entry point {} does not exist",
                self.plugin.manifest.name,
                main.display()
            )));
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
        let config = interpolator.interpolate(&ctx, &step.config.to_value())?;
        let input = json!({
            "workflowId": ctx.workflow_id(),
            "stepId": step.id,
            "stepType": self.step_type,
            "config": config,
        });

        let main = self.plugin.root.join(&self.plugin.manifest.main);
        let mut child = Command::new(&main)
            .current_dir(&self.plugin.root)
            .envs(ctx.environment())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::executor_failure(
                    &step.id,
                    format!("failed to spawn plugin '{}': {e}", main.display()),
                )
            })?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        let payload = serde_json::to_vec(&input)?;
        stdin.write_all(&payload).await.map_err(|e| {
            EngineError::executor_failure(&step.id, format!("failed to write plugin input: {e}"))
        })?;
        drop(stdin);

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
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
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(EngineError::executor_failure(
                    &step.id,
                    format!("plugin output exceeded {} bytes", self.max_output_bytes),
                ));
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(EngineError::Cancelled(format!(
                    "step '{}' cancelled",
                    step.id
                )));
            }
        };

        let (stdout_buf, _) = stdout_task
            .await
            .map_err(|e| EngineError::executor_failure(&step.id, format!("reader failed: {e}")))?;
        let (stderr_buf, _) = stderr_task
            .await
            .map_err(|e| EngineError::executor_failure(&step.id, format!("reader failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_buf);
            return Err(EngineError::executor_failure(
                &step.id,
                format!(
                    "plugin exited with {}: {stderr}",
                    status.code().map_or("signal".to_string(), |c| c.to_string())
                ),
            ));
        }

        // Structured output when the plugin emits JSON, raw text otherwise.
        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(value) => Ok(value),
            Err(_) => Ok(json!({ "stdout": stdout })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRegistry;

    fn write_plugin(dir: &Path, name: &str, step_types: &[&str]) {
        let root = dir.join(name);
        std::fs::create_dir_all(&root).unwrap();
        let manifest = json!({
            "name": name,
            "version": "0.1.0",
            "main": "run.sh",
            "stepTypes": step_types,
        });
        std::fs::write(root.join(MANIFEST_FILE), manifest.to_string()).unwrap();
        std::fs::write(root.join("run.sh"), "#!/bin/sh\ncat >/dev/null\necho '{\"ok\":true}'\n")
            .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                root.join("run.sh"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_discovery_finds_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "beta", &["transform"]);
        write_plugin(dir.path(), "alpha", &["fetch", "store"]);
        std::fs::create_dir(dir.path().join("not-a-plugin")).unwrap();

        let plugins = discover_plugins(dir.path()).unwrap();
        assert_eq!(plugins.len(), 2);
        // Sorted by name for deterministic registration.
        assert_eq!(plugins[0].manifest.name, "alpha");
        assert_eq!(plugins[1].manifest.name, "beta");
        assert_eq!(plugins[0].manifest.step_types, vec!["fetch", "store"]);
    }

    #[test]
    fn test_register_plugins_rejects_duplicate_types() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "one", &["transform"]);
        write_plugin(dir.path(), "two", &["transform"]);

        let registry = ExecutorRegistry::new();
        let err = register_plugins(&registry, dir.path()).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let plugins = discover_plugins(Path::new("/definitely/not/here")).unwrap();
        assert!(plugins.is_empty());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_plugin_executes_entry_point() {
        use std::collections::HashMap;

        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "runner", &["custom"]);

        let registry = ExecutorRegistry::new();
        register_plugins(&registry, dir.path()).unwrap();

        let executor = registry.get("custom").unwrap();
        let step = Step {
            id: "p1".to_string(),
            name: None,
            kind: crate::workflow::StepKind::Custom("custom".to_string()),
            config: Default::default(),
            depends_on: Vec::new(),
            condition: None,
            continue_on_error: false,
            parallel: None,
            retry: None,
            timeout_ms: None,
        };
        let ctx = Arc::new(ExecutionContext::new(
            "wf-plugin",
            HashMap::new(),
            HashMap::new(),
        ));

        let output = executor
            .execute(&step, ctx, &Interpolator::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, json!({"ok": true}));
    }
}
