//! Per-task callback correlation.
//!
//! Callers that care about a specific task register a Done handler (progress,
//! may fire repeatedly) and/or a Finish handler (fires at most once). Task
//! events arriving on the stream are matched by (session id, task id). A
//! terminal event (Finish or Cancel) always removes both registrations for its
//! key, whether or not a handler was present.
//!
//! A terminal event can overtake the registration of its own task (the server
//! acknowledges `Execute` after the implant has already answered). Recent
//! unclaimed terminal events are kept in a small bounded window; a Finish
//! handler registered for one of those keys fires at registration time and
//! nothing is stored.
//!
//! Tasks without registrations are rendered through the operation's
//! registered parser/formatter into the session log.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use corsair_proto::v1::{Spite, Task};

use super::{Event, TaskPhase};
use crate::bridge::FunctionRegistry;
use crate::error::{ClientError, Result};
use crate::session::{SessionLog, SessionRegistry};

/// Identifies one in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackKey {
    pub session_id: String,
    pub task_id: u32,
}

impl CallbackKey {
    pub fn new(session_id: impl Into<String>, task_id: u32) -> Self {
        Self {
            session_id: session_id.into(),
            task_id,
        }
    }
}

impl From<&Task> for CallbackKey {
    fn from(task: &Task) -> Self {
        Self::new(task.session_id.clone(), task.task_id)
    }
}

impl fmt::Display for CallbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.session_id, self.task_id)
    }
}

/// Task event as delivered to callbacks.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub key: CallbackKey,
    pub phase: TaskPhase,
    pub task: Task,
    pub spite: Option<Spite>,
    pub error: Option<String>,
    /// Log of the owning session, or the console log for unknown sessions.
    pub log: SessionLog,
}

impl TaskEvent {
    pub fn is_cancelled(&self) -> bool {
        self.phase == TaskPhase::Cancel
    }

    /// `(cur, total)` progress counters.
    pub const fn progress(&self) -> (u32, u32) {
        (self.task.cur, self.task.total)
    }
}

/// Progress handler; must tolerate repeated invocation.
pub type DoneHandler = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Terminal handler; consumed by the first Finish or Cancel event.
pub type FinishHandler = Box<dyn FnOnce(&TaskEvent) + Send>;

/// A handler for one phase.
pub enum Callback {
    Done(DoneHandler),
    Finish(FinishHandler),
}

impl Callback {
    pub fn done(f: impl Fn(&TaskEvent) + Send + Sync + 'static) -> Self {
        Self::Done(Arc::new(f))
    }

    pub fn finish(f: impl FnOnce(&TaskEvent) + Send + 'static) -> Self {
        Self::Finish(Box::new(f))
    }
}

/// Unclaimed terminal events kept for late registrations.
const RECENT_TERMINALS: usize = 256;

/// Matches task events to registered per-task handlers.
pub struct CallbackCorrelator {
    done: RwLock<HashMap<CallbackKey, DoneHandler>>,
    finish: Mutex<HashMap<CallbackKey, FinishHandler>>,
    terminated: Mutex<VecDeque<TaskEvent>>,
    sessions: Arc<SessionRegistry>,
    functions: Arc<FunctionRegistry>,
    console: SessionLog,
}

impl CallbackCorrelator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        functions: Arc<FunctionRegistry>,
        console: SessionLog,
    ) -> Self {
        Self {
            done: RwLock::new(HashMap::new()),
            finish: Mutex::new(HashMap::new()),
            terminated: Mutex::new(VecDeque::with_capacity(RECENT_TERMINALS)),
            sessions,
            functions,
            console,
        }
    }

    /// Register a handler for `key`.
    ///
    /// A second handler for the same key and phase is rejected while the first
    /// is pending; once the task's terminal event has been processed the key
    /// is free again.
    pub async fn register(&self, key: CallbackKey, callback: Callback) -> Result<()> {
        match callback {
            Callback::Done(handler) => self.register_task(key, Some(handler), None).await,
            Callback::Finish(handler) => self.register_task(key, None, Some(handler)).await,
        }
    }

    /// Register both handlers of one task in a single step.
    ///
    /// Either both are stored or neither is. When the task's terminal event
    /// was already processed without a handler, `finish` runs immediately
    /// with that event and nothing is stored.
    pub async fn register_task(
        &self,
        key: CallbackKey,
        done_handler: Option<DoneHandler>,
        finish_handler: Option<FinishHandler>,
    ) -> Result<()> {
        let mut done = self.done.write().await;
        let mut finish = self.finish.lock().await;
        let mut terminated = self.terminated.lock().await;

        let exists = |phase| ClientError::CallbackExists {
            key: key.to_string(),
            phase,
        };
        if done_handler.is_some() && done.contains_key(&key) {
            return Err(exists("Done"));
        }
        if finish_handler.is_some() && finish.contains_key(&key) {
            return Err(exists("Finish"));
        }

        if let Some(pos) = terminated.iter().position(|ev| ev.key == key) {
            let late = match finish_handler {
                Some(handler) => terminated.remove(pos).map(|ev| (handler, ev)),
                None => None,
            };
            drop(terminated);
            drop(finish);
            drop(done);
            match late {
                Some((handler, event)) => {
                    debug!(key = %key, "Task already terminated, firing Finish now");
                    handler(&event);
                }
                None => debug!(key = %key, "Task already terminated, progress handler dropped"),
            }
            return Ok(());
        }

        if let Some(handler) = done_handler {
            done.insert(key.clone(), handler);
        }
        if let Some(handler) = finish_handler {
            finish.insert(key.clone(), handler);
        }
        debug!(key = %key, "Callbacks registered");
        Ok(())
    }

    /// Route one task event. Runs on the stream task.
    pub async fn on_event(&self, event: &Event) {
        let Some(task) = event.task.as_ref() else {
            warn!(op = %event.op, "Task event without task descriptor");
            return;
        };
        let Some(phase) = event.task_phase() else {
            debug!(op = %event.op, task_id = task.task_id, "Ignoring task event op");
            return;
        };

        let key = CallbackKey::from(task);
        let task_event = TaskEvent {
            key: key.clone(),
            phase,
            task: task.clone(),
            spite: event.spite.clone(),
            error: event.operation_error().map(str::to_string),
            log: self.log_for(&task.session_id).await,
        };

        if phase.is_terminal() {
            let finish = self.take(&task_event).await;
            match finish {
                Some(handler) => handler(&task_event),
                None => self.render_terminal(&task_event),
            }
        } else {
            let done = self.done.read().await.get(&key).cloned();
            match done {
                Some(handler) => handler(&task_event),
                None => render_progress(&task_event),
            }
        }
    }

    /// Remove both registrations for the event's key, returning the Finish
    /// handler. An unclaimed event is remembered for a late registration.
    async fn take(&self, event: &TaskEvent) -> Option<FinishHandler> {
        let key = &event.key;
        let mut done = self.done.write().await;
        let mut finish = self.finish.lock().await;
        done.remove(key);
        let handler = finish.remove(key);
        if handler.is_none() {
            let mut terminated = self.terminated.lock().await;
            terminated.retain(|ev| ev.key != *key);
            if terminated.len() == RECENT_TERMINALS {
                terminated.pop_front();
            }
            terminated.push_back(event.clone());
        }
        drop(finish);
        drop(done);
        debug!(key = %key, "Callbacks cleared");
        handler
    }

    /// Drop every registration belonging to `session_id`.
    pub async fn forget_session(&self, session_id: &str) -> usize {
        let mut done = self.done.write().await;
        let mut finish = self.finish.lock().await;
        let before = done.len() + finish.len();
        done.retain(|k, _| k.session_id != session_id);
        finish.retain(|k, _| k.session_id != session_id);
        self.terminated
            .lock()
            .await
            .retain(|ev| ev.key.session_id != session_id);
        before - done.len() - finish.len()
    }

    /// Keys with any pending registration, rendered as `session_task`.
    pub async fn pending(&self) -> Vec<String> {
        let done = self.done.read().await;
        let finish = self.finish.lock().await;
        let mut keys: Vec<String> = done
            .keys()
            .chain(finish.keys().filter(|k| !done.contains_key(*k)))
            .map(ToString::to_string)
            .collect();
        keys.sort();
        keys
    }

    pub async fn contains(&self, key: &CallbackKey) -> bool {
        self.done.read().await.contains_key(key) || self.finish.lock().await.contains_key(key)
    }

    async fn log_for(&self, session_id: &str) -> SessionLog {
        match self.sessions.get(session_id).await {
            Ok(session) => session.log().clone(),
            Err(_) => self.console.clone(),
        }
    }

    fn render_terminal(&self, event: &TaskEvent) {
        let task = &event.task;
        if event.is_cancelled() {
            event
                .log
                .warn(format!("task {} ({}) cancelled", task.task_id, task.r#type));
            return;
        }
        if let Some(err) = &event.error {
            event
                .log
                .error(format!("task {} ({}) failed: {err}", task.task_id, task.r#type));
            return;
        }
        let Some(spite) = &event.spite else {
            event
                .log
                .info(format!("task {} ({}) finished", task.task_id, task.r#type));
            return;
        };
        match self.functions.render(&task.r#type, spite) {
            Ok(rendered) => event.log.info(format!(
                "task {} ({}) finished\n{}",
                task.task_id, task.r#type, rendered.text
            )),
            Err(e) => {
                warn!(key = %event.key, error = %e, "Dropping unparseable task result");
                event.log.warn(e.to_string());
            }
        }
    }
}

fn render_progress(event: &TaskEvent) {
    let (cur, total) = event.progress();
    event.log.info(format!(
        "task {} ({}) {cur}/{total}",
        event.task.task_id, event.task.r#type
    ));
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::tests::harness::{Fixture, task, task_event};

    #[test]
    fn key_renders_as_session_underscore_task() {
        assert_eq!(CallbackKey::new("S1", 7).to_string(), "S1_7");
    }

    #[tokio::test]
    async fn finish_removes_done_and_finish() {
        let fx = Fixture::new().await;
        let key = CallbackKey::new("S1", 7);
        fx.correlator
            .register(key.clone(), Callback::done(|_| {}))
            .await
            .unwrap();
        fx.correlator
            .register(key.clone(), Callback::finish(|_| {}))
            .await
            .unwrap();
        assert_eq!(fx.correlator.pending().await, ["S1_7"]);

        fx.correlator
            .on_event(&task_event("finish", task("S1", 7, "ping")))
            .await;
        assert!(!fx.correlator.contains(&key).await);
        assert!(fx.correlator.pending().await.is_empty());
    }

    #[tokio::test]
    async fn finish_without_done_fires_once() {
        let fx = Fixture::new().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        fx.correlator
            .register(
                CallbackKey::new("S1", 1),
                Callback::finish(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let ev = task_event("finish", task("S1", 1, "ping"));
        fx.correlator.on_event(&ev).await;
        // A duplicate terminal event finds nothing registered.
        fx.correlator.on_event(&ev).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_finish_registration_is_rejected() {
        let fx = Fixture::new().await;
        let key = CallbackKey::new("S1", 2);
        fx.correlator
            .register(key.clone(), Callback::finish(|_| {}))
            .await
            .unwrap();
        let err = fx
            .correlator
            .register(key.clone(), Callback::finish(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CallbackExists { phase: "Finish", .. }));
    }

    #[tokio::test]
    async fn key_is_fresh_after_cleanup() {
        let fx = Fixture::new().await;
        let key = CallbackKey::new("S1", 3);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        fx.correlator
            .register(
                key.clone(),
                Callback::finish(move |_| first.lock().unwrap().push("first")),
            )
            .await
            .unwrap();
        fx.correlator
            .on_event(&task_event("finish", task("S1", 3, "ping")))
            .await;

        let second = Arc::clone(&seen);
        fx.correlator
            .register(
                key.clone(),
                Callback::finish(move |_| second.lock().unwrap().push("second")),
            )
            .await
            .unwrap();
        fx.correlator
            .on_event(&task_event("finish", task("S1", 3, "ping")))
            .await;

        assert_eq!(*seen.lock().unwrap(), ["first", "second"]);
    }

    #[tokio::test]
    async fn cancel_cleans_up_like_finish() {
        let fx = Fixture::new().await;
        let key = CallbackKey::new("S1", 4);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let done_calls = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&done_calls);
        fx.correlator
            .register(
                key.clone(),
                Callback::done(move |_| {
                    d.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        let c = Arc::clone(&cancelled);
        fx.correlator
            .register(
                key.clone(),
                Callback::finish(move |ev| {
                    if ev.is_cancelled() {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        fx.correlator
            .on_event(&task_event("cancel", task("S1", 4, "download")))
            .await;
        // Late progress after cancellation reaches no handler.
        fx.correlator
            .on_event(&task_event("done", task("S1", 4, "download")))
            .await;

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(done_calls.load(Ordering::SeqCst), 0);
        assert!(!fx.correlator.contains(&key).await);
    }

    #[tokio::test]
    async fn unhandled_finish_renders_into_session_log() {
        let fx = Fixture::new().await;
        let session = fx.session("S1").await;
        fx.correlator
            .on_event(&task_event("finish", task("S1", 9, "unregistered-op")))
            .await;
        let lines = session.log().lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text.contains("task 9 (unregistered-op) finished"));
    }

    #[tokio::test]
    async fn unhandled_error_is_rendered_not_raised() {
        let fx = Fixture::new().await;
        let session = fx.session("S1").await;
        let mut failed = task("S1", 5, "exec");
        failed.error = "access denied".into();
        fx.correlator.on_event(&task_event("error", failed)).await;

        let lines = session.log().lines();
        assert_eq!(lines[0].level, crate::session::LogLevel::Error);
        assert!(lines[0].text.contains("access denied"));
    }

    #[tokio::test]
    async fn unknown_session_falls_back_to_console() {
        let fx = Fixture::new().await;
        fx.correlator
            .on_event(&task_event("done", task("ghost", 1, "download")))
            .await;
        assert_eq!(fx.console.lines().len(), 1);
    }

    #[tokio::test]
    async fn late_finish_registration_fires_immediately() {
        let fx = Fixture::new().await;
        let key = CallbackKey::new("S1", 12);
        fx.correlator
            .on_event(&task_event("finish", task("S1", 12, "ping")))
            .await;

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        fx.correlator
            .register_task(
                key.clone(),
                Some(Arc::new(|_: &TaskEvent| {})),
                Some(Box::new(move |ev: &TaskEvent| {
                    sink.lock().unwrap().push(ev.task.task_id);
                })),
            )
            .await
            .unwrap();

        assert_eq!(*fired.lock().unwrap(), [12]);
        assert!(!fx.correlator.contains(&key).await);

        // The remembered event is consumed by the first claim.
        fx.correlator
            .register(key.clone(), Callback::finish(|_| {}))
            .await
            .unwrap();
        assert_eq!(fx.correlator.pending().await, ["S1_12"]);
    }

    #[tokio::test]
    async fn late_done_registration_is_not_stored() {
        let fx = Fixture::new().await;
        fx.correlator
            .on_event(&task_event("cancel", task("S1", 13, "download")))
            .await;
        fx.correlator
            .register(CallbackKey::new("S1", 13), Callback::done(|_| {}))
            .await
            .unwrap();
        assert!(fx.correlator.pending().await.is_empty());
    }

    #[tokio::test]
    async fn register_task_is_all_or_nothing() {
        let fx = Fixture::new().await;
        let key = CallbackKey::new("S1", 14);
        fx.correlator
            .register(key.clone(), Callback::finish(|_| {}))
            .await
            .unwrap();
        let err = fx
            .correlator
            .register_task(
                key.clone(),
                Some(Arc::new(|_: &TaskEvent| {})),
                Some(Box::new(|_: &TaskEvent| {})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CallbackExists { phase: "Finish", .. }));

        // The rejected Done handler was not left behind.
        fx.correlator
            .register(key.clone(), Callback::done(|_| {}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forget_session_drops_only_that_session() {
        let fx = Fixture::new().await;
        for (sid, tid) in [("S1", 1), ("S1", 2), ("S2", 1)] {
            fx.correlator
                .register(CallbackKey::new(sid, tid), Callback::finish(|_| {}))
                .await
                .unwrap();
        }
        assert_eq!(fx.correlator.forget_session("S1").await, 2);
        assert_eq!(fx.correlator.pending().await, ["S2_1"]);
    }
}
