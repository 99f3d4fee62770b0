//! Scripting host and JSON pipeline runner.
//!
//! Scripts see every registered name and alias as a global, call functions
//! with dynamic values, subscribe to events and get session handles. Script
//! bodies passed to [`ScriptHost::spawn`] run on their own task so the shell
//! is never blocked.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use corsair_proto::v1::Task;

use crate::bridge::{FunctionBridge, Invocation, Rendered};
use crate::dispatch::TaskCallbacks;
use crate::error::{ClientError, Result};
use crate::events::{EventCondition, EventHookMatcher, HookHandler};
use crate::session::SessionRegistry;

/// Handle scripts use to reach the client.
#[derive(Clone)]
pub struct ScriptHost {
    bridge: Arc<FunctionBridge>,
    sessions: Arc<SessionRegistry>,
    hooks: Arc<EventHookMatcher>,
}

impl ScriptHost {
    pub fn new(
        bridge: Arc<FunctionBridge>,
        sessions: Arc<SessionRegistry>,
        hooks: Arc<EventHookMatcher>,
    ) -> Self {
        Self {
            bridge,
            sessions,
            hooks,
        }
    }

    /// Every callable symbol: canonical names and aliases.
    pub fn globals(&self) -> Vec<String> {
        self.bridge.functions().symbols()
    }

    /// Submit; the result lands in the session log.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Task> {
        self.bridge
            .invoke(name, Invocation::Script(args), None)
            .await
    }

    /// Submit with per-task callbacks.
    pub async fn call_with(
        &self,
        name: &str,
        args: Vec<Value>,
        callbacks: TaskCallbacks,
    ) -> Result<Task> {
        self.bridge
            .invoke_with(name, Invocation::Script(args), None, callbacks)
            .await
    }

    /// Submit, wait and return the rendered result.
    pub async fn call_sync(&self, name: &str, args: Vec<Value>) -> Result<Rendered> {
        self.bridge
            .invoke_sync(name, Invocation::Script(args), None)
            .await
    }

    /// Run a script body on its own task. Failures are logged.
    pub fn spawn<F, Fut>(&self, body: F) -> JoinHandle<()>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let host = self.clone();
        tokio::spawn(async move {
            if let Err(e) = body(host).await {
                warn!(error = %e, "Script body failed");
            }
        })
    }

    /// Subscribe `handler` to events matching `condition`.
    pub async fn on_event(&self, condition: &EventCondition, handler: HookHandler) -> Uuid {
        self.hooks.register(condition, handler).await;
        condition.id()
    }

    /// Handles (`{"session_id": ..}`) for every live session, usable as the
    /// leading argument of [`ScriptHost::call`].
    pub async fn sessions(&self) -> Vec<Value> {
        self.sessions
            .list_alive()
            .await
            .iter()
            .map(|s| json!({ "session_id": s.id() }))
            .collect()
    }

    /// Run every step of `pipeline` in order. A failed step is reported and
    /// does not stop the ones after it.
    pub async fn run_pipeline(&self, pipeline: &Pipeline) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(pipeline.steps.len());
        for (index, step) in pipeline.steps.iter().enumerate() {
            let mut args = Vec::with_capacity(step.args.len() + 1);
            if let Some(id) = step.session.as_ref().or(pipeline.session.as_ref()) {
                args.push(json!({ "session_id": id }));
            }
            args.extend(step.args.iter().cloned());

            let outcome = if step.wait {
                self.call_sync(&step.call, args)
                    .await
                    .map(|rendered| rendered.text)
            } else {
                self.call(&step.call, args).await.map(|task| {
                    format!("task {} submitted on {}", task.task_id, task.session_id)
                })
            };
            match &outcome {
                Ok(_) => info!(step = index, call = %step.call, "Pipeline step done"),
                Err(e) => {
                    warn!(step = index, call = %step.call, error = %e, "Pipeline step failed");
                }
            }
            reports.push(StepReport {
                call: step.call.clone(),
                outcome,
            });
        }
        reports
    }
}

/// A JSON list of calls.
///
/// ```json
/// {
///   "session": "S1",
///   "steps": [
///     { "call": "whoami", "wait": true },
///     { "call": "download", "args": ["/etc/hosts"] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Pipeline {
    /// Default target for every step; otherwise the active session.
    #[serde(default)]
    pub session: Option<String>,
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PipelineStep {
    pub call: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub session: Option<String>,
    /// Wait for the result instead of only submitting.
    #[serde(default)]
    pub wait: bool,
}

/// Outcome of one pipeline step.
#[derive(Debug)]
pub struct StepReport {
    pub call: String,
    pub outcome: std::result::Result<String, ClientError>,
}

/// Read a pipeline file.
pub fn load_pipeline(path: &Path) -> corsair_core::Result<Pipeline> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
