// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Built-in `agent` executor.
//!
//! The engine does not talk to models itself; it hands rendered prompts
//! to an [`AgentHost`] capability object supplied by the embedding
//! application. Without a host the `agent` type simply stays
//! unregistered.

use super::StepExecutor;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::interpolate::Interpolator;
use crate::workflow::{AgentConfig, Step, StepConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capability object the agent executor calls back into.
#[async_trait]
pub trait AgentHost: Send + Sync {
    /// Produces a completion for the request.
    async fn complete(&self, request: AgentRequest) -> anyhow::Result<AgentResponse>;

    /// Host name for diagnostics.
    fn name(&self) -> &str;

    /// Liveness probe.
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A rendered agent request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub extra: HashMap<String, Value>,
}

/// A host response.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub text: String,
    pub model: Option<String>,
    pub tokens_used: Option<u32>,
    pub metadata: HashMap<String, Value>,
}

/// Executes `agent` steps through a host.
pub struct AgentExecutor {
    host: Arc<dyn AgentHost>,
}

impl AgentExecutor {
    pub fn new(host: Arc<dyn AgentHost>) -> Self {
        Self { host }
    }

    fn config(step: &Step) -> Result<AgentConfig> {
        match &step.config {
            StepConfig::Agent(config) => Ok(config.clone()),
            StepConfig::Extra(map) => serde_json::from_value(json!(map)).map_err(|e| {
                EngineError::executor_failure(&step.id, format!("invalid agent config: {e}"))
            }),
            StepConfig::Script(_) => Err(EngineError::executor_failure(
                &step.id,
                "expected agent config, found script config",
            )),
        }
    }
}

#[async_trait]
impl StepExecutor for AgentExecutor {
    fn kind(&self) -> &str {
        "agent"
    }

    fn validate(&self, step: &Step) -> Result<()> {
        let config = Self::config(step)?;
        if config.prompt.trim().is_empty() {
            return Err(EngineError::executor_failure(
                &step.id,
                "agent prompt must not be empty",
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

        let prompt = interpolator.interpolate_str(&ctx, &config.prompt)?;
        let system = match &config.system {
            Some(system) => Some(interpolator.interpolate_str(&ctx, system)?),
            None => None,
        };
        let mut extra = HashMap::with_capacity(config.extra.len());
        for (key, value) in &config.extra {
            extra.insert(key.clone(), interpolator.interpolate(&ctx, value)?);
        }

        let request = AgentRequest {
            prompt,
            system,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            extra,
        };

        debug!(
            step_id = %step.id,
            host = %self.host.name(),
            model = ?request.model,
            "dispatching agent request"
        );

        let response = tokio::select! {
            response = self.host.complete(request) => response.map_err(|e| {
                EngineError::executor_failure(&step.id, format!("agent host error: {e}"))
            })?,
            _ = cancel.cancelled() => {
                return Err(EngineError::Cancelled(format!(
                    "step '{}' cancelled",
                    step.id
                )));
            }
        };

        Ok(json!({
            "text": response.text,
            "model": response.model,
            "tokensUsed": response.tokens_used,
            "metadata": response.metadata,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepKind;

    struct EchoHost;

    #[async_trait]
    impl AgentHost for EchoHost {
        async fn complete(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            Ok(AgentResponse {
                text: format!("echo: {}", request.prompt),
                model: request.model,
                tokens_used: Some(7),
                metadata: HashMap::new(),
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn agent_step(prompt: &str) -> Step {
        Step {
            id: "ask".to_string(),
            name: None,
            kind: StepKind::Agent,
            config: StepConfig::Agent(AgentConfig {
                prompt: prompt.to_string(),
                model: Some("small".to_string()),
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
        }
    }

    #[tokio::test]
    async fn test_prompt_is_interpolated_before_dispatch() {
        let ctx = Arc::new(ExecutionContext::new(
            "wf-agent",
            HashMap::new(),
            HashMap::new(),
        ));
        ctx.set_variable("topic", json!("graphs"));

        let executor = AgentExecutor::new(Arc::new(EchoHost));
        let step = agent_step("explain {{topic}}");
        let output = executor
            .execute(
                &step,
                ctx,
                &Interpolator::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output["text"], json!("echo: explain graphs"));
        assert_eq!(output["model"], json!("small"));
        assert_eq!(output["tokensUsed"], json!(7));
    }

    #[test]
    fn test_validate_rejects_empty_prompt() {
        let executor = AgentExecutor::new(Arc::new(EchoHost));
        let step = agent_step("   ");
        assert!(executor.validate(&step).is_err());
    }
}
