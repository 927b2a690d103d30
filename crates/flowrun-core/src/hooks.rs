// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Typed lifecycle event bus with prioritized, isolated delivery.
//!
//! Handlers register against one event kind with a priority; higher
//! priorities run first. On emit, synchronous handlers run sequentially
//! on the emitting task, then asynchronous handlers run concurrently
//! under a per-handler soft deadline. Handler failures are isolated by
//! default and recorded in per-hook stats.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle event kinds. The serialized names are stable interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    WorkflowStart,
    WorkflowComplete,
    WorkflowError,
    WorkflowCancelled,
    StepStart,
    StepComplete,
    StepError,
    StepSkip,
    StepRetry,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WorkflowStart => "WorkflowStart",
            Self::WorkflowComplete => "WorkflowComplete",
            Self::WorkflowError => "WorkflowError",
            Self::WorkflowCancelled => "WorkflowCancelled",
            Self::StepStart => "StepStart",
            Self::StepComplete => "StepComplete",
            Self::StepError => "StepError",
            Self::StepSkip => "StepSkip",
            Self::StepRetry => "StepRetry",
        };
        f.write_str(name)
    }
}

/// An emitted event.
#[derive(Debug, Clone, Serialize)]
pub struct HookEvent {
    pub kind: EventKind,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<String>,
    pub payload: Value,
}

impl HookEvent {
    /// A workflow-scoped event.
    pub fn workflow(kind: EventKind, workflow_id: impl Into<String>) -> Self {
        Self {
            kind,
            workflow_id: workflow_id.into(),
            timestamp: Utc::now(),
            step_id: None,
            payload: Value::Null,
        }
    }

    /// A step-scoped event.
    pub fn step(
        kind: EventKind,
        workflow_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            workflow_id: workflow_id.into(),
            timestamp: Utc::now(),
            step_id: Some(step_id.into()),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Handler contract. Sync handlers are simply handlers registered with
/// `run_async = false`; they still use this (awaitable) entry point.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &HookEvent) -> std::result::Result<(), String>;
}

/// Adapts a plain closure into a handler.
pub struct ClosureHook<F>(pub F);

#[async_trait]
impl<F> HookHandler for ClosureHook<F>
where
    F: Fn(&HookEvent) -> std::result::Result<(), String> + Send + Sync,
{
    async fn handle(&self, event: &HookEvent) -> std::result::Result<(), String> {
        (self.0)(event)
    }
}

/// Registration metadata for one hook.
#[derive(Debug, Clone)]
pub struct HookRegistration {
    /// Unique id across the whole bus.
    pub id: String,

    /// Event this hook listens to.
    pub event: EventKind,

    /// Higher priorities run first.
    pub priority: i32,

    /// Disabled hooks stay registered but are skipped on emit.
    pub enabled: bool,

    /// Run concurrently after the synchronous phase.
    pub run_async: bool,
}

impl HookRegistration {
    pub fn new(id: impl Into<String>, event: EventKind) -> Self {
        Self {
            id: id.into(),
            event,
            priority: 0,
            enabled: true,
            run_async: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.run_async = true;
        self
    }
}

#[derive(Clone)]
struct HookEntry {
    registration: HookRegistration,
    handler: Arc<dyn HookHandler>,
}

/// Per-hook delivery statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookStats {
    pub total_calls: u64,
    pub errors: u64,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub total_time: Duration,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub avg_time: Duration,
    pub last_called_at: Option<DateTime<Utc>>,
}

fn serialize_duration_ms<S>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(d.as_millis() as u64)
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct HookBusConfig {
    /// Cap on total registrations.
    pub max_hooks: usize,

    /// Soft deadline per handler invocation.
    pub max_execution_time: Duration,

    /// Swallow handler errors (recording them in stats) instead of
    /// propagating into engine code.
    pub isolate_errors: bool,
}

impl Default for HookBusConfig {
    fn default() -> Self {
        Self {
            max_hooks: 128,
            max_execution_time: Duration::from_secs(30),
            isolate_errors: true,
        }
    }
}

/// The event bus.
pub struct HookBus {
    hooks: RwLock<HashMap<EventKind, Vec<HookEntry>>>,
    ids: RwLock<HashSet<String>>,
    stats: Mutex<HashMap<String, HookStats>>,
    config: HookBusConfig,
}

impl HookBus {
    pub fn new(config: HookBusConfig) -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            ids: RwLock::new(HashSet::new()),
            stats: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Registers a handler. Rejects duplicate ids and enforces the
    /// registration cap. The per-event list stays sorted high-priority
    /// first; equal priorities keep registration order.
    pub fn register(
        &self,
        registration: HookRegistration,
        handler: Arc<dyn HookHandler>,
    ) -> Result<()> {
        let mut ids = self.ids.write();
        if ids.contains(&registration.id) {
            return Err(EngineError::Hook {
                hook_id: registration.id.clone(),
                reason: "duplicate hook id".to_string(),
            });
        }
        if ids.len() >= self.config.max_hooks {
            return Err(EngineError::HookLimitExceeded(self.config.max_hooks));
        }
        ids.insert(registration.id.clone());
        drop(ids);

        let mut hooks = self.hooks.write();
        let entries = hooks.entry(registration.event).or_default();
        debug!(hook_id = %registration.id, event = %registration.event, priority = registration.priority, "registered hook");
        entries.push(HookEntry {
            registration,
            handler,
        });
        entries.sort_by_key(|e| std::cmp::Reverse(e.registration.priority));
        Ok(())
    }

    /// Registers a synchronous closure handler.
    pub fn register_fn<F>(&self, registration: HookRegistration, f: F) -> Result<()>
    where
        F: Fn(&HookEvent) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.register(registration, Arc::new(ClosureHook(f)))
    }

    /// Removes a hook by id. Returns true when something was removed.
    pub fn unregister(&self, id: &str) -> bool {
        if !self.ids.write().remove(id) {
            return false;
        }
        let mut hooks = self.hooks.write();
        for entries in hooks.values_mut() {
            entries.retain(|e| e.registration.id != id);
        }
        true
    }

    /// Enables or disables a hook in place.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut hooks = self.hooks.write();
        for entries in hooks.values_mut() {
            for entry in entries.iter_mut() {
                if entry.registration.id == id {
                    entry.registration.enabled = enabled;
                    return true;
                }
            }
        }
        false
    }

    /// Total number of registrations.
    pub fn hook_count(&self) -> usize {
        self.ids.read().len()
    }

    /// Delivers an event: enabled sync handlers sequentially in priority
    /// order, then enabled async handlers concurrently, each under the
    /// configured soft deadline.
    pub async fn emit(&self, event: &HookEvent) -> Result<()> {
        // Emission traverses an immutable snapshot of the registrations.
        let entries: Vec<HookEntry> = {
            let hooks = self.hooks.read();
            hooks.get(&event.kind).cloned().unwrap_or_default()
        };
        if entries.is_empty() {
            return Ok(());
        }

        let mut first_error: Option<EngineError> = None;

        for entry in entries.iter().filter(|e| e.registration.enabled && !e.registration.run_async)
        {
            let outcome = self.invoke(entry, event).await;
            if let Err(reason) = outcome {
                if first_error.is_none() {
                    first_error = Some(EngineError::Hook {
                        hook_id: entry.registration.id.clone(),
                        reason,
                    });
                }
            }
        }

        let async_entries: Vec<&HookEntry> = entries
            .iter()
            .filter(|e| e.registration.enabled && e.registration.run_async)
            .collect();
        let outcomes = join_all(async_entries.iter().map(|entry| self.invoke(*entry, event))).await;
        for (entry, outcome) in async_entries.iter().zip(outcomes) {
            if let Err(reason) = outcome {
                if first_error.is_none() {
                    first_error = Some(EngineError::Hook {
                        hook_id: entry.registration.id.clone(),
                        reason,
                    });
                }
            }
        }

        match first_error {
            Some(error) if !self.config.isolate_errors => Err(error),
            _ => Ok(()),
        }
    }

    async fn invoke(
        &self,
        entry: &HookEntry,
        event: &HookEvent,
    ) -> std::result::Result<(), String> {
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(self.config.max_execution_time, entry.handler.handle(event))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "handler exceeded soft deadline of {}ms",
                    self.config.max_execution_time.as_millis()
                )),
            };

        let elapsed = started.elapsed();
        let mut stats = self.stats.lock();
        let entry_stats = stats.entry(entry.registration.id.clone()).or_default();
        entry_stats.total_calls += 1;
        entry_stats.total_time += elapsed;
        entry_stats.avg_time = entry_stats.total_time / entry_stats.total_calls as u32;
        entry_stats.last_called_at = Some(Utc::now());
        if outcome.is_err() {
            entry_stats.errors += 1;
        }
        drop(stats);

        if let Err(reason) = &outcome {
            warn!(hook_id = %entry.registration.id, event = %event.kind, error = %reason, "hook handler failed");
        }
        outcome
    }

    /// Stats for one hook.
    pub fn stats(&self, id: &str) -> Option<HookStats> {
        self.stats.lock().get(id).cloned()
    }

    /// Stats for every hook that has been called.
    pub fn all_stats(&self) -> HashMap<String, HookStats> {
        self.stats.lock().clone()
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new(HookBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_hook(
        bus: &HookBus,
        id: &str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    ) {
        let id_owned = id.to_string();
        bus.register_fn(
            HookRegistration::new(id, EventKind::StepStart).with_priority(priority),
            move |_| {
                log.lock().push(id_owned.clone());
                Ok(())
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_priority_order_high_first() {
        let bus = HookBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        record_hook(&bus, "low", -10, log.clone());
        record_hook(&bus, "high", 100, log.clone());
        record_hook(&bus, "mid", 0, log.clone());

        bus.emit(&HookEvent::step(EventKind::StepStart, "wf", "a"))
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let bus = HookBus::default();
        bus.register_fn(HookRegistration::new("h", EventKind::StepStart), |_| Ok(()))
            .unwrap();
        let err = bus
            .register_fn(HookRegistration::new("h", EventKind::StepComplete), |_| {
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook { .. }));
    }

    #[tokio::test]
    async fn test_hook_limit() {
        let bus = HookBus::new(HookBusConfig {
            max_hooks: 2,
            ..Default::default()
        });
        bus.register_fn(HookRegistration::new("a", EventKind::StepStart), |_| Ok(()))
            .unwrap();
        bus.register_fn(HookRegistration::new("b", EventKind::StepStart), |_| Ok(()))
            .unwrap();
        let err = bus
            .register_fn(HookRegistration::new("c", EventKind::StepStart), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, EngineError::HookLimitExceeded(2)));
    }

    #[tokio::test]
    async fn test_errors_isolated_and_counted() {
        let bus = HookBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register_fn(
            HookRegistration::new("broken", EventKind::StepError).with_priority(10),
            |_| Err("boom".to_string()),
        )
        .unwrap();
        let log_ref = log.clone();
        bus.register_fn(
            HookRegistration::new("after", EventKind::StepError),
            move |_| {
                log_ref.lock().push("after".to_string());
                Ok(())
            },
        )
        .unwrap();

        // Isolation on: emit succeeds, later hooks still run.
        bus.emit(&HookEvent::step(EventKind::StepError, "wf", "a"))
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["after"]);

        let stats = bus.stats("broken").unwrap();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_errors_propagate_when_isolation_off() {
        let bus = HookBus::new(HookBusConfig {
            isolate_errors: false,
            ..Default::default()
        });
        bus.register_fn(HookRegistration::new("broken", EventKind::StepError), |_| {
            Err("boom".to_string())
        })
        .unwrap();

        let err = bus
            .emit(&HookEvent::step(EventKind::StepError, "wf", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook { hook_id, .. } if hook_id == "broken"));
    }

    #[tokio::test]
    async fn test_disabled_hook_skipped() {
        let bus = HookBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        record_hook(&bus, "h", 0, log.clone());

        assert!(bus.set_enabled("h", false));
        bus.emit(&HookEvent::step(EventKind::StepStart, "wf", "a"))
            .await
            .unwrap();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_async_handler_soft_deadline() {
        struct SlowHook;

        #[async_trait]
        impl HookHandler for SlowHook {
            async fn handle(&self, _event: &HookEvent) -> std::result::Result<(), String> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let bus = HookBus::new(HookBusConfig {
            max_execution_time: Duration::from_millis(20),
            ..Default::default()
        });
        bus.register(
            HookRegistration::new("slow", EventKind::WorkflowComplete).asynchronous(),
            Arc::new(SlowHook),
        )
        .unwrap();

        bus.emit(&HookEvent::workflow(EventKind::WorkflowComplete, "wf"))
            .await
            .unwrap();

        let stats = bus.stats("slow").unwrap();
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let bus = HookBus::default();
        bus.register_fn(HookRegistration::new("h", EventKind::StepComplete), |_| {
            Ok(())
        })
        .unwrap();

        for _ in 0..3 {
            bus.emit(&HookEvent::step(EventKind::StepComplete, "wf", "a"))
                .await
                .unwrap();
        }

        let stats = bus.stats("h").unwrap();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_called_at.is_some());
    }

    #[tokio::test]
    async fn test_unregister() {
        let bus = HookBus::default();
        bus.register_fn(HookRegistration::new("h", EventKind::StepStart), |_| Ok(()))
            .unwrap();
        assert_eq!(bus.hook_count(), 1);
        assert!(bus.unregister("h"));
        assert!(!bus.unregister("h"));
        assert_eq!(bus.hook_count(), 0);

        // Id is reusable after unregistration.
        bus.register_fn(HookRegistration::new("h", EventKind::StepStart), |_| Ok(()))
            .unwrap();
    }
}
