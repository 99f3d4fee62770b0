//! Server-pushed events and everything that reacts to them.
//!
//! - [`consumer`]: owns the stream and demultiplexes events by kind
//! - [`correlator`]: per-task Done/Finish callbacks
//! - [`hooks`]: predicate-based subscriptions over the raw stream

pub mod consumer;
pub mod correlator;
pub mod hooks;

pub use consumer::{EventStreamConsumer, StreamState};
pub use correlator::{
    Callback, CallbackCorrelator, CallbackKey, DoneHandler, FinishHandler, TaskEvent,
};
pub use hooks::{EventCondition, EventHookMatcher, HookHandler, hook};

use std::fmt;

use corsair_proto::v1::{Event as EventMessage, Job, Session as SessionMessage, Spite, Task};

/// Operation sub-codes carried in `Event.op`.
pub mod op {
    pub const REGISTER: &str = "register";
    pub const REBORN: &str = "reborn";
    pub const CHECKIN: &str = "checkin";
    pub const DEAD: &str = "dead";
    pub const DELETE: &str = "delete";

    pub const DONE: &str = "done";
    pub const FINISH: &str = "finish";
    pub const ERROR: &str = "error";
    pub const CANCEL: &str = "cancel";
}

/// Event family carried in `Event.type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Session,
    Task,
    Job,
    Listener,
    Pipeline,
    Website,
    Broadcast,
    Notify,
    Client,
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "session" => Self::Session,
            "task" => Self::Task,
            "job" => Self::Job,
            "listener" => Self::Listener,
            "pipeline" => Self::Pipeline,
            "website" => Self::Website,
            "broadcast" => Self::Broadcast,
            "notify" => Self::Notify,
            "client" => Self::Client,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Session => "session",
            Self::Task => "task",
            Self::Job => "job",
            Self::Listener => "listener",
            Self::Pipeline => "pipeline",
            Self::Website => "website",
            Self::Broadcast => "broadcast",
            Self::Notify => "notify",
            Self::Client => "client",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task event sits in the task's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Intermediate progress; may repeat.
    Done,
    /// Terminal, successful or carrying an operation error.
    Finish,
    /// Terminal after a cancel request. Cleans up like `Finish`.
    Cancel,
}

impl TaskPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finish | Self::Cancel)
    }
}

/// Decoded server event.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub kind: EventKind,
    pub op: String,
    pub task: Option<Task>,
    pub session: Option<SessionMessage>,
    pub spite: Option<Spite>,
    pub job: Option<Job>,
    pub message: String,
    pub error: Option<String>,
    pub client: String,
}

impl Default for EventKind {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl From<EventMessage> for Event {
    fn from(msg: EventMessage) -> Self {
        Self {
            kind: EventKind::parse(&msg.r#type),
            op: msg.op,
            task: msg.task,
            session: msg.session,
            spite: msg.spite,
            job: msg.job,
            message: msg.message,
            error: (!msg.err.is_empty()).then_some(msg.err),
            client: msg.client,
        }
    }
}

impl Event {
    /// Session this event concerns, from the session snapshot or the task.
    pub fn session_id(&self) -> Option<&str> {
        [
            self.session.as_ref().map(|s| s.session_id.as_str()),
            self.task.as_ref().map(|t| t.session_id.as_str()),
        ]
        .into_iter()
        .flatten()
        .find(|id| !id.is_empty())
    }

    /// Lifecycle phase for task events; `None` for other kinds and unknown ops.
    pub fn task_phase(&self) -> Option<TaskPhase> {
        if self.kind != EventKind::Task {
            return None;
        }
        match self.op.as_str() {
            op::DONE => Some(TaskPhase::Done),
            op::FINISH | op::ERROR => Some(TaskPhase::Finish),
            op::CANCEL => Some(TaskPhase::Cancel),
            _ => None,
        }
    }

    /// Operation error reported anywhere on the event.
    pub fn operation_error(&self) -> Option<&str> {
        [
            self.error.as_deref(),
            self.task.as_ref().map(|t| t.error.as_str()),
            self.spite.as_ref().map(|s| s.error.as_str()),
        ]
        .into_iter()
        .flatten()
        .find(|e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_event(op: &str) -> Event {
        Event::from(EventMessage {
            r#type: "task".into(),
            op: op.into(),
            task: Some(Task {
                task_id: 3,
                session_id: "S1".into(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn task_ops_map_to_phases() {
        assert_eq!(task_event("done").task_phase(), Some(TaskPhase::Done));
        assert_eq!(task_event("finish").task_phase(), Some(TaskPhase::Finish));
        assert_eq!(task_event("error").task_phase(), Some(TaskPhase::Finish));
        assert_eq!(task_event("cancel").task_phase(), Some(TaskPhase::Cancel));
        assert_eq!(task_event("ctrl").task_phase(), None);
    }

    #[test]
    fn non_task_events_have_no_phase() {
        let ev = Event::from(EventMessage {
            r#type: "session".into(),
            op: "finish".into(),
            ..Default::default()
        });
        assert_eq!(ev.task_phase(), None);
    }

    #[test]
    fn session_id_falls_back_to_task() {
        assert_eq!(task_event("done").session_id(), Some("S1"));
        assert_eq!(Event::default().session_id(), None);
    }

    #[test]
    fn empty_error_string_is_no_error() {
        let ev = task_event("finish");
        assert!(ev.error.is_none());
        assert!(ev.operation_error().is_none());

        let mut failed = task_event("error");
        if let Some(task) = failed.task.as_mut() {
            task.error = "access denied".into();
        }
        assert_eq!(failed.operation_error(), Some("access denied"));
    }

    #[test]
    fn unknown_kinds_round_trip_their_name() {
        let kind = EventKind::parse("audit");
        assert_eq!(kind, EventKind::Other("audit".into()));
        assert_eq!(kind.to_string(), "audit");
    }
}
