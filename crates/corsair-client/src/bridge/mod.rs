//! Function registration bridge.
//!
//! Each operation is registered once with a declared signature and a typed
//! invoker. The shell, scripting and tool-calling front ends all reach it
//! through [`FunctionBridge`], which adapts their argument conventions into
//! [`BoundArgs`] before anything goes over the wire.

mod args;
mod invoke;
mod registry;
mod render;
mod words;

pub use args::{
    AdaptationError, BoundArgs, CallArgument, Param, ParamKind, coerce, session_handle,
};
pub use invoke::{FunctionBridge, Invocation};
pub use registry::{
    Alias, Binder, Formatter, FunctionRegistry, FunctionSpec, InvokeContext, InvokeFuture,
    Invoker, Parser, RegisteredFunction, invoker,
};
pub use render::{Rendered, generic_parse, generic_render};
pub use words::split_command_line;
