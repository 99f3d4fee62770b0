//! Teamserver connection client.
//!
//! Manages the gRPC channel to the teamserver and implements [`ServerRpc`].

use std::future::Future;
use std::time::Duration;

use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use corsair_core::config::ServerConfig;
use corsair_proto::methods::{
    METHOD_CANCEL_TASK, METHOD_EVENTS, METHOD_EXECUTE, METHOD_GET_SESSION, METHOD_GET_SESSIONS,
    METHOD_WAIT_TASK_FINISH,
};
use corsair_proto::v1::{
    Empty, Session as SessionMessage, SessionRequest, Task, TaskCancelRequest, TaskContext,
    TaskRequest, TaskWaitRequest, operator_service_client::OperatorServiceClient,
};

use crate::error::{ClientError, Result};
use crate::rpc::{EventStream, ServerRpc};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Teamserver address.
    pub addr: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Deadline for unary requests.
    pub request_timeout: Duration,
    /// Operator bearer token.
    pub auth_token: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ConnectionConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            addr: server.addr.clone(),
            connect_timeout: server.connect_timeout(),
            request_timeout: server.request_timeout(),
            auth_token: server.token.clone(),
        }
    }
}

/// Attach the operator token to a tonic request.
fn apply_auth_meta<T>(req: &mut tonic::Request<T>, auth_token: Option<&str>) {
    if let Some(token) = auth_token
        && let Ok(val) = format!("Bearer {token}").parse()
    {
        req.metadata_mut().insert("authorization", val);
    }
}

/// Client connection to the teamserver.
pub struct ServerConnection {
    config: ConnectionConfig,
    client: OperatorServiceClient<Channel>,
}

impl ServerConnection {
    /// Connect to the teamserver.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(config.addr.clone())
            .map_err(|e| ClientError::InvalidAddress(e.to_string()))?
            .connect_timeout(config.connect_timeout)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10));

        let channel = endpoint.connect().await.map_err(|e| ClientError::Transport {
            method: "connect",
            code: None,
            message: e.to_string(),
        })?;

        info!(addr = %config.addr, "Connected to teamserver");
        Ok(Self {
            client: OperatorServiceClient::new(channel),
            config,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        apply_auth_meta(&mut request, self.config.auth_token.as_deref());
        request
    }

    /// Run a unary call under the configured deadline.
    async fn unary<R, F>(&self, method: &'static str, call: F) -> Result<R>
    where
        F: Future<Output = std::result::Result<tonic::Response<R>, tonic::Status>>,
    {
        self.unary_with_deadline(method, self.config.request_timeout, call)
            .await
    }

    async fn unary_with_deadline<R, F>(
        &self,
        method: &'static str,
        deadline: Duration,
        call: F,
    ) -> Result<R>
    where
        F: Future<Output = std::result::Result<tonic::Response<R>, tonic::Status>>,
    {
        debug!(method, "RPC call");
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(ClientError::rpc(method, &status)),
            Err(_) => Err(ClientError::Timeout {
                method,
                secs: deadline.as_secs(),
            }),
        }
    }
}

#[tonic::async_trait]
impl ServerRpc for ServerConnection {
    async fn get_session(&self, session_id: &str) -> Result<SessionMessage> {
        let mut client = self.client.clone();
        let request = self.request(SessionRequest {
            session_id: session_id.to_string(),
        });
        self.unary(METHOD_GET_SESSION, client.get_session(request))
            .await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionMessage>> {
        let mut client = self.client.clone();
        let request = self.request(Empty {});
        let sessions = self
            .unary(METHOD_GET_SESSIONS, client.get_sessions(request))
            .await?;
        Ok(sessions.sessions)
    }

    async fn execute(&self, task_request: TaskRequest) -> Result<Task> {
        let mut client = self.client.clone();
        let request = self.request(task_request);
        self.unary(METHOD_EXECUTE, client.execute(request)).await
    }

    async fn wait_task_finish(&self, task: &Task, timeout: Duration) -> Result<TaskContext> {
        let mut client = self.client.clone();
        let request = self.request(TaskWaitRequest {
            session_id: task.session_id.clone(),
            task_id: task.task_id,
            timeout_secs: timeout.as_secs(),
        });
        // The server enforces `timeout_secs`; the local deadline only catches a
        // server that never answers.
        let deadline = timeout + self.config.request_timeout;
        self.unary_with_deadline(
            METHOD_WAIT_TASK_FINISH,
            deadline,
            client.wait_task_finish(request),
        )
        .await
    }

    async fn cancel_task(&self, task: &Task) -> Result<Task> {
        let mut client = self.client.clone();
        let request = self.request(TaskCancelRequest {
            session_id: task.session_id.clone(),
            task_id: task.task_id,
        });
        self.unary(METHOD_CANCEL_TASK, client.cancel_task(request))
            .await
    }

    async fn events(&self) -> Result<EventStream> {
        let mut client = self.client.clone();
        let request = self.request(Empty {});
        // No deadline: the stream lives as long as the login session.
        let stream = client
            .events(request)
            .await
            .map_err(|status| ClientError::rpc(METHOD_EVENTS, &status))?
            .into_inner();
        Ok(Box::pin(stream.map(|item| {
            item.map_err(|status| ClientError::rpc(METHOD_EVENTS, &status))
        })))
    }
}
