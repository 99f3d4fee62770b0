//! The single long-lived event stream and its demultiplexer.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CallbackCorrelator, Event, EventHookMatcher, EventKind, op};
use crate::rpc::ServerRpc;
use crate::session::{SessionLog, SessionRegistry};

/// Connectivity of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Never started.
    Idle,
    Connecting,
    Streaming,
    /// Ended by EOF or a transport error. Only an explicit reconnect leaves
    /// this state.
    Broken(String),
    /// Stopped by client shutdown.
    Stopped,
}

impl StreamState {
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }
}

/// Reads server events and routes them to hooks, the session registry and the
/// callback correlator.
pub struct EventStreamConsumer {
    rpc: Arc<dyn ServerRpc>,
    sessions: Arc<SessionRegistry>,
    correlator: Arc<CallbackCorrelator>,
    hooks: Arc<EventHookMatcher>,
    console: SessionLog,
    state: watch::Sender<StreamState>,
    root: CancellationToken,
}

impl EventStreamConsumer {
    pub fn new(
        rpc: Arc<dyn ServerRpc>,
        sessions: Arc<SessionRegistry>,
        correlator: Arc<CallbackCorrelator>,
        hooks: Arc<EventHookMatcher>,
        console: SessionLog,
        root: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            rpc,
            sessions,
            correlator,
            hooks,
            console,
            state,
            root,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Run the stream loop on its own task. The state is `Connecting` by the
    /// time this returns.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.state.send_replace(StreamState::Connecting);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Subscribe and process events until the stream ends or the client shuts
    /// down. There is no automatic reconnection.
    pub async fn run(&self) {
        self.state.send_replace(StreamState::Connecting);
        let mut stream = match self.rpc.events().await {
            Ok(stream) => stream,
            Err(e) => {
                self.broken(e.to_string());
                return;
            }
        };
        self.state.send_replace(StreamState::Streaming);
        info!("Event stream established");

        loop {
            tokio::select! {
                () = self.root.cancelled() => {
                    self.state.send_replace(StreamState::Stopped);
                    info!("Event stream stopped");
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(msg)) => self.handle_event(Event::from(msg)).await,
                    Some(Err(e)) => {
                        self.broken(e.to_string());
                        return;
                    }
                    None => {
                        self.broken("stream closed by server".to_string());
                        return;
                    }
                },
            }
        }
    }

    fn broken(&self, reason: String) {
        warn!(reason = %reason, "Event stream broken");
        self.console
            .error(format!("event stream lost: {reason} (use `reconnect`)"));
        self.state.send_replace(StreamState::Broken(reason));
    }

    /// Route one event: hooks first, then the kind-specific handler.
    ///
    /// Hooks run under the owning session's scope, except for the event that
    /// removes the session: its scope is cancelled by the removal itself.
    pub async fn handle_event(&self, event: Event) {
        let removes_session = event.kind == EventKind::Session && event.op == op::DELETE;
        let scope = match event.session_id() {
            Some(id) if !removes_session => match self.sessions.get(id).await {
                Ok(session) => session.scope().clone(),
                Err(_) => self.root.clone(),
            },
            _ => self.root.clone(),
        };
        let hooked = self.hooks.dispatch(&event, &scope).await;
        if hooked > 0 {
            debug!(kind = %event.kind, op = %event.op, hooked, "Event hooks started");
        }

        match event.kind {
            EventKind::Session => self.handle_session(event).await,
            EventKind::Task => self.correlator.on_event(&event).await,
            EventKind::Job
            | EventKind::Listener
            | EventKind::Pipeline
            | EventKind::Website
            | EventKind::Broadcast
            | EventKind::Notify
            | EventKind::Client => self.render_console(&event),
            EventKind::Other(ref kind) => {
                debug!(kind = %kind, op = %event.op, "Ignoring unknown event kind");
            }
        }
    }

    async fn handle_session(&self, event: Event) {
        let Some(mut snapshot) = event.session else {
            warn!(op = %event.op, "Session event without session snapshot");
            return;
        };
        let session_id = snapshot.session_id.clone();
        match event.op.as_str() {
            op::REGISTER | op::REBORN | op::CHECKIN => {
                let session = self.sessions.upsert(snapshot).await;
                if event.op != op::CHECKIN {
                    self.console
                        .info(format!("session {session_id} {}", event.op));
                    session.log().info(format!("session {}", event.op));
                }
            }
            op::DEAD => {
                snapshot.is_alive = false;
                let session = self.sessions.upsert(snapshot).await;
                session.log().warn("session is dead");
                self.console.warn(format!("session {session_id} dead"));
            }
            op::DELETE => {
                if self.sessions.remove(&session_id).await.is_some() {
                    let dropped = self.correlator.forget_session(&session_id).await;
                    debug!(session_id, dropped, "Dropped callbacks of removed session");
                    self.console.info(format!("session {session_id} removed"));
                }
            }
            other => debug!(session_id, op = other, "Ignoring session event op"),
        }
    }

    fn render_console(&self, event: &Event) {
        let subject = event
            .job
            .as_ref()
            .map(|job| format!(" {}", job.name))
            .unwrap_or_default();
        let text = if event.message.is_empty() {
            format!("[{}] {}{subject}", event.kind, event.op)
        } else if event.op.is_empty() {
            format!("[{}]{subject} {}", event.kind, event.message)
        } else {
            format!("[{}] {}{subject}: {}", event.kind, event.op, event.message)
        };
        match &event.error {
            Some(err) => self.console.error(format!("{text} ({err})")),
            None => self.console.info(text),
        }
    }
}
