//! Argument adaptation and invocation for every front end.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use corsair_proto::v1::Task;

use super::registry::{FunctionRegistry, InvokeContext, RegisteredFunction};
use super::render::Rendered;
use super::{
    AdaptationError, BoundArgs, CallArgument, Param, ParamKind, coerce, session_handle,
    split_command_line,
};
use crate::dispatch::{TaskCallbacks, TaskDispatcher};
use crate::error::{ClientError, Result};
use crate::session::{Session, SessionRegistry};

/// Arguments as a front end supplies them.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Shell words, coerced positionally.
    Cli(Vec<String>),
    /// Dynamic script values. A leading `{"session_id": ..}` handle selects
    /// the target session. Session-typed parameters the script leaves out are
    /// filled with the target session.
    Script(Vec<Value>),
    /// One command line, split into words and handled like [`Invocation::Cli`].
    Tool(String),
}

struct Prepared {
    function: Arc<RegisteredFunction>,
    ctx: InvokeContext,
    args: BoundArgs,
}

/// Single entry point from the front ends to registered functions.
pub struct FunctionBridge {
    functions: Arc<FunctionRegistry>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<TaskDispatcher>,
}

impl FunctionBridge {
    pub fn new(
        functions: Arc<FunctionRegistry>,
        sessions: Arc<SessionRegistry>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        Self {
            functions,
            sessions,
            dispatcher,
        }
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Submit without callbacks; the result is rendered into the session log
    /// when the task finishes.
    pub async fn invoke(
        &self,
        name: &str,
        invocation: Invocation,
        session: Option<&str>,
    ) -> Result<Task> {
        self.invoke_with(name, invocation, session, TaskCallbacks::new())
            .await
    }

    /// Submit and attach per-task callbacks.
    pub async fn invoke_with(
        &self,
        name: &str,
        invocation: Invocation,
        session: Option<&str>,
        callbacks: TaskCallbacks,
    ) -> Result<Task> {
        let prepared = self.prepare(name, invocation, session).await?;
        info!(
            function = %prepared.function.name,
            session_id = prepared.ctx.session_id(),
            "Invoking function"
        );
        let call = (prepared.function.invoker)(prepared.ctx, prepared.args);
        self.dispatcher.submit(call, callbacks).await
    }

    /// Submit, wait for the result on the server and render it with the
    /// function's parser and formatter.
    pub async fn invoke_sync(
        &self,
        name: &str,
        invocation: Invocation,
        session: Option<&str>,
    ) -> Result<Rendered> {
        let prepared = self.prepare(name, invocation, session).await?;
        let function = Arc::clone(&prepared.function);
        info!(
            function = %function.name,
            session_id = prepared.ctx.session_id(),
            "Invoking function and waiting"
        );
        // Absorb the terminal event so the result is not rendered twice.
        let quiet = TaskCallbacks::new().on_finish(|_| {});
        let call = (function.invoker)(prepared.ctx, prepared.args);
        let task = self.dispatcher.submit(call, quiet).await?;
        let ctx = self.dispatcher.await_sync(&task).await?;

        let error = [
            ctx.task.as_ref().map(|t| t.error.as_str()),
            ctx.spite.as_ref().map(|s| s.error.as_str()),
        ]
        .into_iter()
        .flatten()
        .find(|e| !e.is_empty());
        if let Some(message) = error {
            return Err(ClientError::OperationFailed {
                session_id: task.session_id,
                task_id: task.task_id,
                message: message.to_string(),
            });
        }
        function.render(&ctx.spite.unwrap_or_default())
    }

    /// Lookup, adaptation, session resolution and module gating. Nothing here
    /// talks to the server except a session cache miss on an explicit id.
    async fn prepare(
        &self,
        name: &str,
        invocation: Invocation,
        session: Option<&str>,
    ) -> Result<Prepared> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| ClientError::FunctionNotFound(name.to_string()))?;

        let script = matches!(invocation, Invocation::Script(_));
        let (raw, handle) = raw_arguments(&function, invocation)?;
        let raw = match &function.binder {
            Some(binder) => binder(raw).map_err(|message| AdaptationError::Binder {
                function: function.name.clone(),
                message,
            })?,
            None => raw,
        };
        let explicit = handle.as_deref().or(session);
        let implicit = match (script, explicit) {
            (false, _) => None,
            (true, Some(id)) => Some(id.to_string()),
            (true, None) => self.sessions.active().await.map(|s| s.id().to_string()),
        };
        let args = bind(&function, name, raw, implicit.as_deref())?;

        let target = self.resolve_session(explicit).await?;
        if let Some(module) = &function.requires_module
            && !target.has_module(module).await
        {
            return Err(ClientError::ModuleUnavailable {
                session_id: target.id().to_string(),
                module: module.clone(),
                function: function.name.clone(),
            });
        }
        debug!(
            function = %function.name,
            session_id = target.id(),
            args = args.len(),
            "Arguments bound"
        );

        Ok(Prepared {
            ctx: InvokeContext {
                rpc: Arc::clone(self.dispatcher.rpc()),
                session: target,
            },
            function,
            args,
        })
    }

    async fn resolve_session(&self, explicit: Option<&str>) -> Result<Arc<Session>> {
        match explicit {
            Some(id) => self.sessions.get_or_fetch(id).await,
            None => self
                .sessions
                .active()
                .await
                .ok_or(ClientError::NoActiveSession),
        }
    }
}

/// Convert front-end arguments into untyped call arguments plus an optional
/// session handle.
fn raw_arguments(
    function: &RegisteredFunction,
    invocation: Invocation,
) -> std::result::Result<(Vec<CallArgument>, Option<String>), AdaptationError> {
    match invocation {
        Invocation::Cli(words) => Ok((words.into_iter().map(CallArgument::Str).collect(), None)),
        Invocation::Tool(line) => {
            let words = split_command_line(&line)?;
            Ok((words.into_iter().map(CallArgument::Str).collect(), None))
        }
        Invocation::Script(values) => {
            let (handle, rest) = match values.split_first() {
                Some((first, rest)) if session_handle(first).is_some() => {
                    (session_handle(first).map(str::to_string), rest)
                }
                _ => (None, values.as_slice()),
            };
            let raw = rest
                .iter()
                .map(|value| {
                    CallArgument::from_json(value).ok_or_else(|| {
                        AdaptationError::UnsupportedValue {
                            function: function.name.clone(),
                            value: value.to_string(),
                        }
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok((raw, handle))
        }
    }
}

/// Check arity against the name used, fill defaults and coerce each argument
/// into its declared type.
///
/// With an `implicit_session`, session-typed parameters that are left out or
/// passed as null are bound to it. When fewer arguments than parameters were
/// supplied, session parameters take no positional slot.
fn bind(
    function: &RegisteredFunction,
    called_as: &str,
    raw: Vec<CallArgument>,
    implicit_session: Option<&str>,
) -> std::result::Result<BoundArgs, AdaptationError> {
    let params = &function.params;
    let skip_sessions = implicit_session.is_some() && raw.len() < params.len();
    let positional: Vec<&Param> = params
        .iter()
        .filter(|p| !(skip_sessions && p.kind == ParamKind::Session))
        .collect();
    let (min, max) = match &function.alias {
        Some(alias) if alias.name == called_as => (alias.arity, alias.arity),
        _ => {
            let required = positional
                .iter()
                .rposition(|p| p.default.is_none())
                .map_or(0, |i| i + 1);
            (required, positional.len())
        }
    };
    if raw.len() < min || raw.len() > max {
        return Err(AdaptationError::Arity {
            function: called_as.to_string(),
            expected: if min == max {
                min.to_string()
            } else {
                format!("{min} to {max}")
            },
            got: raw.len(),
        });
    }

    let mut bound = BoundArgs::default();
    let mut raw = raw.into_iter();
    for param in params {
        let implicit = implicit_session.filter(|_| param.kind == ParamKind::Session);
        let supplied = if skip_sessions && implicit.is_some() {
            None
        } else {
            raw.next().filter(|arg| *arg != CallArgument::Null)
        };
        let value = match (supplied, implicit, &param.default) {
            (Some(arg), _, _) => arg,
            (None, Some(id), _) => CallArgument::Session(id.to_string()),
            (None, None, Some(default)) => default.clone(),
            (None, None, None) => {
                return Err(AdaptationError::Type {
                    function: function.name.clone(),
                    param: param.name.clone(),
                    kind: param.kind,
                    value: CallArgument::Null.to_string(),
                });
            }
        };
        let typed = coerce(&value, param.kind).ok_or_else(|| AdaptationError::Type {
            function: function.name.clone(),
            param: param.name.clone(),
            kind: param.kind,
            value: value.to_string(),
        })?;
        bound.push(param.name.clone(), typed);
    }
    Ok(bound)
}
