//! Test harness for client tests.
//!
//! Provides:
//! - FakeRpc: an in-memory teamserver implementing `ServerRpc`
//! - Fixture: a wired `Client` over a `FakeRpc`, with its parts exposed
//! - message builders for sessions, tasks and events

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use corsair_proto::methods::{METHOD_EVENTS, METHOD_GET_SESSION};
use corsair_proto::v1::{
    Event as EventMessage, Session as SessionMessage, Spite, Task, TaskContext, TaskRequest,
};

use crate::bridge::{FunctionBridge, FunctionRegistry};
use crate::client::Client;
use crate::dispatch::TaskDispatcher;
use crate::error::{ClientError, Result};
use crate::events::{CallbackCorrelator, Event, EventHookMatcher, EventStreamConsumer};
use crate::rpc::{EventStream, ServerRpc};
use crate::session::{Session, SessionLog, SessionRegistry};

/// Calls seen by a [`FakeRpc`], per method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_session: usize,
    pub list_sessions: usize,
    pub execute: usize,
    pub wait_task_finish: usize,
    pub cancel_task: usize,
    pub events: usize,
}

impl CallCounts {
    pub const fn total(&self) -> usize {
        self.get_session
            + self.list_sessions
            + self.execute
            + self.wait_task_finish
            + self.cancel_task
            + self.events
    }
}

/// Canned result for `WaitTaskFinish`, keyed by task type.
#[derive(Debug, Clone)]
enum Canned {
    Body(Vec<u8>),
    Error(String),
}

type EventItem = Result<EventMessage>;

struct State {
    sessions: HashMap<String, SessionMessage>,
    calls: CallCounts,
    executed: Vec<TaskRequest>,
    next_task_id: u32,
    canned: HashMap<String, Canned>,
    events_tx: Option<mpsc::UnboundedSender<EventItem>>,
    events_rx: Option<mpsc::UnboundedReceiver<EventItem>>,
    events_error: Option<String>,
}

/// In-memory teamserver.
pub struct FakeRpc {
    state: Mutex<State>,
}

impl Default for FakeRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRpc {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State {
                sessions: HashMap::new(),
                calls: CallCounts::default(),
                executed: Vec::new(),
                next_task_id: 1,
                canned: HashMap::new(),
                events_tx: Some(tx),
                events_rx: Some(rx),
                events_error: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Every `Execute` request, in order.
    pub fn executed(&self) -> Vec<TaskRequest> {
        self.state().executed.clone()
    }

    pub async fn add_server_session(&self, session: SessionMessage) {
        self.state()
            .sessions
            .insert(session.session_id.clone(), session);
    }

    /// Id handed to the next executed task.
    pub fn set_next_task_id(&self, task_id: u32) {
        self.state().next_task_id = task_id;
    }

    /// Body returned by `WaitTaskFinish` for tasks of type `op`.
    pub fn respond(&self, op: &str, body: Vec<u8>) {
        self.state().canned.insert(op.into(), Canned::Body(body));
    }

    /// Operation error returned by `WaitTaskFinish` for tasks of type `op`.
    pub fn respond_error(&self, op: &str, error: &str) {
        self.state()
            .canned
            .insert(op.into(), Canned::Error(error.into()));
    }

    /// Deliver one event on the current stream.
    pub fn push_event(&self, event: EventMessage) {
        if let Some(tx) = &self.state().events_tx {
            let _ = tx.send(Ok(event));
        }
    }

    /// End the current stream; it yields `None` once drained.
    pub fn close_events(&self) {
        self.state().events_tx = None;
    }

    /// Make every following `Events` call fail.
    pub fn fail_events(&self, message: &str) {
        self.state().events_error = Some(message.into());
    }
}

#[tonic::async_trait]
impl ServerRpc for FakeRpc {
    async fn get_session(&self, session_id: &str) -> Result<SessionMessage> {
        let mut state = self.state();
        state.calls.get_session += 1;
        state.sessions.get(session_id).cloned().ok_or_else(|| {
            ClientError::rpc(
                METHOD_GET_SESSION,
                &tonic::Status::not_found(format!("session {session_id}")),
            )
        })
    }

    async fn list_sessions(&self) -> Result<Vec<SessionMessage>> {
        let mut state = self.state();
        state.calls.list_sessions += 1;
        let mut sessions: Vec<_> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn execute(&self, request: TaskRequest) -> Result<Task> {
        let mut state = self.state();
        state.calls.execute += 1;
        let task_id = state.next_task_id;
        state.next_task_id += 1;
        let task = task(&request.session_id, task_id, &request.name);
        state.executed.push(request);
        Ok(task)
    }

    async fn wait_task_finish(&self, task: &Task, _timeout: Duration) -> Result<TaskContext> {
        let mut state = self.state();
        state.calls.wait_task_finish += 1;
        let mut spite = Spite {
            name: task.r#type.clone(),
            task_id: task.task_id,
            ..Default::default()
        };
        match state.canned.get(&task.r#type) {
            Some(Canned::Body(body)) => spite.body.clone_from(body),
            Some(Canned::Error(error)) => spite.error.clone_from(error),
            None => {}
        }
        Ok(TaskContext {
            task: Some(Task {
                finished: true,
                ..task.clone()
            }),
            spite: Some(spite),
            session: state.sessions.get(&task.session_id).cloned(),
        })
    }

    async fn cancel_task(&self, task: &Task) -> Result<Task> {
        self.state().calls.cancel_task += 1;
        Ok(task.clone())
    }

    async fn events(&self) -> Result<EventStream> {
        let mut state = self.state();
        state.calls.events += 1;
        if let Some(message) = &state.events_error {
            return Err(ClientError::Transport {
                method: METHOD_EVENTS,
                code: Some(tonic::Code::Unavailable),
                message: message.clone(),
            });
        }
        let rx = match state.events_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.events_tx = Some(tx);
                rx
            }
        };
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// A client over a [`FakeRpc`] with every part reachable.
pub struct Fixture {
    pub client: Arc<Client>,
    pub rpc: Arc<FakeRpc>,
    pub root: CancellationToken,
    pub console: SessionLog,
    pub sessions: Arc<SessionRegistry>,
    pub functions: Arc<FunctionRegistry>,
    pub correlator: Arc<CallbackCorrelator>,
    pub hooks: Arc<EventHookMatcher>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub bridge: Arc<FunctionBridge>,
    pub consumer: Arc<EventStreamConsumer>,
}

impl Fixture {
    /// Client with the built-in operations registered.
    pub async fn new() -> Self {
        let rpc = Arc::new(FakeRpc::new());
        let client = Client::with_builtins(rpc.clone(), Duration::from_secs(5))
            .unwrap_or_else(|e| panic!("builtins failed to register: {e}"));
        Self::wrap(client, rpc)
    }

    /// Client with an empty function registry.
    pub async fn bare() -> Self {
        let rpc = Arc::new(FakeRpc::new());
        let client = Client::new(rpc.clone(), Duration::from_secs(5));
        Self::wrap(client, rpc)
    }

    fn wrap(client: Client, rpc: Arc<FakeRpc>) -> Self {
        Self {
            root: client.root().clone(),
            console: client.console().clone(),
            sessions: Arc::clone(client.sessions()),
            functions: Arc::clone(client.functions()),
            correlator: Arc::clone(client.correlator()),
            hooks: Arc::clone(client.hooks()),
            dispatcher: Arc::clone(client.dispatcher()),
            bridge: Arc::clone(client.bridge()),
            consumer: Arc::clone(client.consumer()),
            client: Arc::new(client),
            rpc,
        }
    }

    /// Cache a live session `id` carrying the `exec` and `download` modules.
    pub async fn session(&self, id: &str) -> Arc<Session> {
        self.sessions.upsert(session_message(id, true)).await
    }

    /// Cache session `id` and make it the active target.
    pub async fn activate(&self, id: &str) -> Arc<Session> {
        let session = self.session(id).await;
        self.sessions.set_active(Arc::clone(&session)).await;
        session
    }
}

pub fn session_message(id: &str, alive: bool) -> SessionMessage {
    SessionMessage {
        session_id: id.into(),
        name: format!("{id}-implant"),
        is_alive: alive,
        modules: vec!["exec".into(), "download".into()],
        group: "default".into(),
        os: "linux".into(),
        arch: "x86_64".into(),
        hostname: format!("host-{}", id.to_lowercase()),
        username: "svc".into(),
        pid: 4242,
        ..Default::default()
    }
}

pub fn task(session_id: &str, task_id: u32, task_type: &str) -> Task {
    Task {
        task_id,
        session_id: session_id.into(),
        r#type: task_type.into(),
        ..Default::default()
    }
}

pub fn task_message(op: &str, task: Task) -> EventMessage {
    EventMessage {
        r#type: "task".into(),
        op: op.into(),
        task: Some(task),
        ..Default::default()
    }
}

pub fn task_event(op: &str, task: Task) -> Event {
    Event::from(task_message(op, task))
}

pub fn event_message(kind: &str, op: &str, message: &str) -> EventMessage {
    EventMessage {
        r#type: kind.into(),
        op: op.into(),
        message: message.into(),
        ..Default::default()
    }
}

pub fn session_event(op: &str, id: &str, alive: bool) -> Event {
    Event::from(EventMessage {
        r#type: "session".into(),
        op: op.into(),
        session: Some(session_message(id, alive)),
        ..Default::default()
    })
}
