//! The RPC seam between the client core and the teamserver.
//!
//! [`crate::connection::ServerConnection`] implements it over tonic; tests
//! substitute an in-memory fake.

use std::pin::Pin;
use std::time::Duration;

use tokio_stream::Stream;

use corsair_proto::v1::{
    Event as EventMessage, Session as SessionMessage, Task, TaskContext, TaskRequest,
};

use crate::error::Result;

/// Server-push event stream. Yields `Err` once on transport failure.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventMessage>> + Send>>;

/// Unary and streaming calls the client core depends on.
#[tonic::async_trait]
pub trait ServerRpc: Send + Sync {
    /// Fetch one session snapshot.
    async fn get_session(&self, session_id: &str) -> Result<SessionMessage>;

    /// Fetch every session the server knows about.
    async fn list_sessions(&self) -> Result<Vec<SessionMessage>>;

    /// Start an operation; returns the server-assigned task descriptor.
    async fn execute(&self, request: TaskRequest) -> Result<Task>;

    /// Block until `task` finishes or `timeout` elapses.
    async fn wait_task_finish(&self, task: &Task, timeout: Duration) -> Result<TaskContext>;

    /// Ask the implant to abandon `task`. The terminal event still arrives on the stream.
    async fn cancel_task(&self, task: &Task) -> Result<Task>;

    /// Open the long-lived event stream.
    async fn events(&self) -> Result<EventStream>;
}
