//! Named constants for gRPC method strings of the operator service.
//!
//! Used for structured logging and error context so method names stay in sync
//! with the protobuf definitions without duplicating string literals.

/// `OperatorService/GetSession`
pub const METHOD_GET_SESSION: &str = "OperatorService/GetSession";

/// `OperatorService/GetSessions`
pub const METHOD_GET_SESSIONS: &str = "OperatorService/GetSessions";

/// `OperatorService/Execute`
pub const METHOD_EXECUTE: &str = "OperatorService/Execute";

/// `OperatorService/WaitTaskFinish`
pub const METHOD_WAIT_TASK_FINISH: &str = "OperatorService/WaitTaskFinish";

/// `OperatorService/CancelTask`
pub const METHOD_CANCEL_TASK: &str = "OperatorService/CancelTask";

/// `OperatorService/Events`
pub const METHOD_EVENTS: &str = "OperatorService/Events";
