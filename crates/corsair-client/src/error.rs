//! Client error types.
//!
//! Every failure maps onto one of four categories (see [`ErrorKind`]) which
//! decide how it propagates: transport failures end the event stream, lookup
//! and adaptation failures are returned to the caller before any network
//! traffic, and operation failures travel as ordinary task events.

use crate::bridge::AdaptationError;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Broad category of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Operation,
    Lookup,
    Adaptation,
    Registration,
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected to server")]
    NotConnected,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{method} failed: {message}")]
    Transport {
        method: &'static str,
        /// gRPC status code, when the server answered at all.
        code: Option<tonic::Code>,
        message: String,
    },

    #[error("{method} timed out after {secs}s")]
    Timeout { method: &'static str, secs: u64 },

    #[error("Task {task_id} on session {session_id} failed: {message}")]
    OperationFailed {
        session_id: String,
        task_id: u32,
        message: String,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("No active session; select one with `use <session-id>`")]
    NoActiveSession,

    #[error("Session {session_id} lacks module `{module}` required by {function}")]
    ModuleUnavailable {
        session_id: String,
        module: String,
        function: String,
    },

    #[error(transparent)]
    Adaptation(#[from] AdaptationError),

    #[error("Failed to parse {function} response: {message}")]
    Parse { function: String, message: String },

    #[error("Function already registered: {0}")]
    DuplicateFunction(String),

    #[error("{phase} callback already registered for {key}")]
    CallbackExists { key: String, phase: &'static str },
}

impl ClientError {
    /// Wrap a tonic status returned by `method`.
    pub fn rpc(method: &'static str, status: &tonic::Status) -> Self {
        Self::Transport {
            method,
            code: Some(status.code()),
            message: format!("{:?}: {}", status.code(), status.message()),
        }
    }

    /// gRPC status code carried by a transport error.
    pub const fn status_code(&self) -> Option<tonic::Code> {
        match self {
            Self::Transport { code, .. } => *code,
            _ => None,
        }
    }

    /// Category of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected
            | Self::InvalidAddress(_)
            | Self::Transport { .. }
            | Self::Timeout { .. } => ErrorKind::Transport,
            Self::OperationFailed { .. } | Self::Parse { .. } => ErrorKind::Operation,
            Self::SessionNotFound(_)
            | Self::FunctionNotFound(_)
            | Self::NoActiveSession
            | Self::ModuleUnavailable { .. } => ErrorKind::Lookup,
            Self::Adaptation(_) => ErrorKind::Adaptation,
            Self::DuplicateFunction(_) | Self::CallbackExists { .. } => ErrorKind::Registration,
        }
    }
}
