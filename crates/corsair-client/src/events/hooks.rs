//! Predicate-based subscriptions over the raw event stream.
//!
//! Independent of task correlation: any number of conditions can be
//! registered, each with any number of handlers. Every matching handler runs
//! in its own task, raced against the cancellation scope of the session the
//! event belongs to. Handler failures are logged and go nowhere else.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Event, EventKind};

pub type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Asynchronous event handler.
pub type HookHandler = Arc<dyn Fn(Event) -> HookFuture + Send + Sync>;

/// Wrap an async closure as a [`HookHandler`].
pub fn hook<F, Fut>(f: F) -> HookHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A named predicate over events. Clones share the same identity.
#[derive(Clone)]
pub struct EventCondition {
    id: Uuid,
    label: String,
    predicate: Predicate,
}

impl EventCondition {
    pub fn new(
        label: impl Into<String>,
        predicate: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Every event of `kind`.
    pub fn kind(kind: EventKind) -> Self {
        let label = kind.to_string();
        Self::new(label, move |ev| ev.kind == kind)
    }

    /// Events of `kind` whose sub-code is `op`.
    pub fn kind_op(kind: EventKind, op: &str) -> Self {
        let label = format!("{kind}:{op}");
        let op = op.to_string();
        Self::new(label, move |ev| ev.kind == kind && ev.op == op)
    }

    /// Events concerning one session.
    pub fn session(session_id: &str) -> Self {
        let label = format!("session={session_id}");
        let session_id = session_id.to_string();
        Self::new(label, move |ev| ev.session_id() == Some(session_id.as_str()))
    }

    /// Events whose message matches `pattern`.
    pub fn message_matches(pattern: Regex) -> Self {
        let label = format!("message~/{pattern}/");
        Self::new(label, move |ev| pattern.is_match(&ev.message))
    }

    /// Both conditions must hold.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        let label = format!("{} && {}", self.label, other.label);
        let (a, b) = (self.predicate, other.predicate);
        Self::new(label, move |ev| a(ev) && b(ev))
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn matches(&self, event: &Event) -> bool {
        (self.predicate)(event)
    }
}

impl fmt::Debug for EventCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCondition")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

struct HookEntry {
    condition: EventCondition,
    handlers: Vec<HookHandler>,
}

/// Pub/sub over the event stream.
pub struct EventHookMatcher {
    entries: RwLock<Vec<HookEntry>>,
    tracker: TaskTracker,
}

impl Default for EventHookMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHookMatcher {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Attach `handler` to `condition`. Handlers sharing a condition run in
    /// registration order of spawning, but concurrently.
    pub async fn register(&self, condition: &EventCondition, handler: HookHandler) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.condition.id == condition.id) {
            entry.handlers.push(handler);
        } else {
            entries.push(HookEntry {
                condition: condition.clone(),
                handlers: vec![handler],
            });
        }
        drop(entries);
        debug!(condition = %condition.label, "Event hook registered");
    }

    /// Remove a condition and all its handlers.
    pub async fn unregister(&self, condition_id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.condition.id != condition_id);
        before != entries.len()
    }

    /// Spawn every handler whose condition matches `event`. Returns how many
    /// were started. Never blocks on handler completion.
    pub async fn dispatch(&self, event: &Event, scope: &CancellationToken) -> usize {
        let matched: Vec<(String, HookHandler)> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.condition.matches(event))
            .flat_map(|entry| {
                entry
                    .handlers
                    .iter()
                    .map(|h| (entry.condition.label.clone(), Arc::clone(h)))
            })
            .collect();

        let count = matched.len();
        for (label, handler) in matched {
            let event = event.clone();
            let scope = scope.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    () = scope.cancelled() => {
                        debug!(condition = %label, "Event hook cancelled with its session");
                    }
                    result = handler(event) => {
                        if let Err(e) = result {
                            warn!(condition = %label, error = %e, "Event hook failed");
                        }
                    }
                }
            });
        }
        count
    }

    /// Number of registered conditions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Wait for every handler spawned so far to finish.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
