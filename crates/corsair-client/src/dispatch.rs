//! Task dispatch: submit-and-correlate or submit-and-wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use corsair_proto::v1::{Task, TaskContext};

use crate::error::Result;
use crate::events::{CallbackCorrelator, CallbackKey, DoneHandler, FinishHandler, TaskEvent};
use crate::rpc::ServerRpc;

/// Optional per-task handlers attached at submit time.
#[derive(Default)]
pub struct TaskCallbacks {
    done: Option<DoneHandler>,
    finish: Option<FinishHandler>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_done(mut self, f: impl Fn(&TaskEvent) + Send + Sync + 'static) -> Self {
        self.done = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_finish(mut self, f: impl FnOnce(&TaskEvent) + Send + 'static) -> Self {
        self.finish = Some(Box::new(f));
        self
    }

    pub const fn is_empty(&self) -> bool {
        self.done.is_none() && self.finish.is_none()
    }
}

/// Uniform front door for every operation.
pub struct TaskDispatcher {
    rpc: Arc<dyn ServerRpc>,
    correlator: Arc<CallbackCorrelator>,
    wait_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(
        rpc: Arc<dyn ServerRpc>,
        correlator: Arc<CallbackCorrelator>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            correlator,
            wait_timeout,
        }
    }

    pub fn rpc(&self) -> &Arc<dyn ServerRpc> {
        &self.rpc
    }

    pub const fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Await the RPC, then register `callbacks` under the returned task.
    ///
    /// Returns as soon as the server has accepted the task. A terminal event
    /// that beats the registration is rendered as unhandled and then handed
    /// to the Finish handler as soon as it is registered.
    pub async fn submit<F>(&self, call: F, callbacks: TaskCallbacks) -> Result<Task>
    where
        F: Future<Output = Result<Task>> + Send,
    {
        let task = call.await?;
        let key = CallbackKey::from(&task);
        if !callbacks.is_empty() {
            self.correlator
                .register_task(key.clone(), callbacks.done, callbacks.finish)
                .await?;
        }
        debug!(key = %key, task_type = %task.r#type, "Task submitted");
        Ok(task)
    }

    /// Block on the server until `task` finishes, bypassing the event path.
    pub async fn await_sync(&self, task: &Task) -> Result<TaskContext> {
        debug!(
            session_id = %task.session_id,
            task_id = task.task_id,
            timeout_secs = self.wait_timeout.as_secs(),
            "Waiting for task"
        );
        self.rpc.wait_task_finish(task, self.wait_timeout).await
    }

    /// Ask the implant to abandon `task`; the terminal event arrives later.
    pub async fn cancel(&self, task: &Task) -> Result<Task> {
        info!(session_id = %task.session_id, task_id = task.task_id, "Cancelling task");
        self.rpc.cancel_task(task).await
    }
}
