//! The operator client: owns every registry and wires them together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use corsair_core::Config;

use crate::bridge::{FunctionBridge, FunctionRegistry};
use crate::connection::{ConnectionConfig, ServerConnection};
use crate::dispatch::TaskDispatcher;
use crate::error::Result;
use crate::events::{CallbackCorrelator, EventHookMatcher, EventStreamConsumer, StreamState};
use crate::ops;
use crate::rpc::ServerRpc;
use crate::script::ScriptHost;
use crate::session::{SessionLog, SessionRegistry};
use crate::tools::ToolBridge;

/// One logged-in operator. Front ends borrow its registries.
pub struct Client {
    root: CancellationToken,
    console: SessionLog,
    sessions: Arc<SessionRegistry>,
    functions: Arc<FunctionRegistry>,
    correlator: Arc<CallbackCorrelator>,
    hooks: Arc<EventHookMatcher>,
    dispatcher: Arc<TaskDispatcher>,
    bridge: Arc<FunctionBridge>,
    consumer: Arc<EventStreamConsumer>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Wire a client over `rpc` with an empty function registry.
    pub fn new(rpc: Arc<dyn ServerRpc>, wait_timeout: Duration) -> Self {
        let root = CancellationToken::new();
        let console = SessionLog::new("console");
        let sessions = Arc::new(SessionRegistry::new(Arc::clone(&rpc), root.clone()));
        let functions = Arc::new(FunctionRegistry::new());
        let correlator = Arc::new(CallbackCorrelator::new(
            Arc::clone(&sessions),
            Arc::clone(&functions),
            console.clone(),
        ));
        let hooks = Arc::new(EventHookMatcher::new());
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&rpc),
            Arc::clone(&correlator),
            wait_timeout,
        ));
        let bridge = Arc::new(FunctionBridge::new(
            Arc::clone(&functions),
            Arc::clone(&sessions),
            Arc::clone(&dispatcher),
        ));
        let consumer = Arc::new(EventStreamConsumer::new(
            rpc,
            Arc::clone(&sessions),
            Arc::clone(&correlator),
            Arc::clone(&hooks),
            console.clone(),
            root.clone(),
        ));
        Self {
            root,
            console,
            sessions,
            functions,
            correlator,
            hooks,
            dispatcher,
            bridge,
            consumer,
            stream_task: Mutex::new(None),
        }
    }

    /// Wire a client with the built-in operations registered.
    pub fn with_builtins(rpc: Arc<dyn ServerRpc>, wait_timeout: Duration) -> Result<Self> {
        let client = Self::new(rpc, wait_timeout);
        ops::register_builtins(&client.functions)?;
        Ok(client)
    }

    /// Connect to the teamserver described by `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let connection = ServerConnection::connect(ConnectionConfig::from(&config.server)).await?;
        Self::with_builtins(Arc::new(connection), config.tasks.wait_timeout())
    }

    /// Subscribe to the event stream and load the session list.
    ///
    /// Does nothing to the stream if it is already running. Also serves as
    /// the explicit reconnect after the stream broke.
    pub async fn start(&self) -> Result<usize> {
        {
            let mut task = self.stream_task.lock().await;
            if self.consumer.state().is_running() {
                warn!("Event stream already running");
            } else {
                *task = Some(self.consumer.spawn());
            }
        }
        let count = self.sessions.refresh().await?;
        info!(sessions = count, "Client started");
        Ok(count)
    }

    /// Stop the stream loop and wait for outstanding hook handlers.
    pub async fn shutdown(&self) {
        self.root.cancel();
        if let Some(task) = self.stream_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Event stream task panicked");
        }
        self.hooks.wait_idle().await;
        info!("Client shut down");
    }

    pub fn stream_state(&self) -> StreamState {
        self.consumer.state()
    }

    pub fn console(&self) -> &SessionLog {
        &self.console
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn correlator(&self) -> &Arc<CallbackCorrelator> {
        &self.correlator
    }

    pub fn hooks(&self) -> &Arc<EventHookMatcher> {
        &self.hooks
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn bridge(&self) -> &Arc<FunctionBridge> {
        &self.bridge
    }

    pub fn consumer(&self) -> &Arc<EventStreamConsumer> {
        &self.consumer
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    pub fn script_host(&self) -> ScriptHost {
        ScriptHost::new(
            Arc::clone(&self.bridge),
            Arc::clone(&self.sessions),
            Arc::clone(&self.hooks),
        )
    }

    pub fn tool_bridge(&self) -> ToolBridge {
        ToolBridge::new(Arc::clone(&self.bridge))
    }
}
