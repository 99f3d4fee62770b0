//! Registered operations, looked up by name or alias.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use corsair_proto::v1::{Spite, Task, TaskRequest};

use super::render::{Rendered, generic_parse, generic_render};
use super::{CallArgument, Param};
use crate::error::{ClientError, Result};
use crate::rpc::ServerRpc;
use crate::session::Session;

/// What an invoker gets to work with: the transport and the resolved target.
#[derive(Clone)]
pub struct InvokeContext {
    pub rpc: Arc<dyn ServerRpc>,
    pub session: Arc<Session>,
}

impl InvokeContext {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Empty request for operation `name` on the target session.
    pub fn request(&self, name: &str) -> TaskRequest {
        TaskRequest {
            session_id: self.session.id().to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub async fn execute(&self, request: TaskRequest) -> Result<Task> {
        self.rpc.execute(request).await
    }
}

pub type InvokeFuture = Pin<Box<dyn Future<Output = Result<Task>> + Send>>;

/// Primary invoker: typed arguments in, server task descriptor out.
pub type Invoker = Arc<dyn Fn(InvokeContext, super::BoundArgs) -> InvokeFuture + Send + Sync>;

/// Reshapes raw arguments before coercion.
pub type Binder =
    Arc<dyn Fn(Vec<CallArgument>) -> std::result::Result<Vec<CallArgument>, String> + Send + Sync>;

/// Decodes a task payload.
pub type Parser = Arc<dyn Fn(&Spite) -> std::result::Result<Value, String> + Send + Sync>;

/// Formats a parsed payload for the operator.
pub type Formatter = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Wrap an async closure as an [`Invoker`].
pub fn invoker<F, Fut>(f: F) -> Invoker
where
    F: Fn(InvokeContext, super::BoundArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Task>> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

/// Reduced-arity alternative name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    /// Exact number of arguments the alias accepts; the remaining trailing
    /// parameters take their declared defaults.
    pub arity: usize,
}

/// One registered operation. Immutable once registered.
pub struct RegisteredFunction {
    pub name: String,
    pub alias: Option<Alias>,
    pub summary: String,
    pub params: Vec<Param>,
    /// Implant module or addon the target session must report.
    pub requires_module: Option<String>,
    pub(crate) invoker: Invoker,
    pub(crate) binder: Option<Binder>,
    parser: Option<Parser>,
    formatter: Option<Formatter>,
}

impl RegisteredFunction {
    /// Parse and format `spite` with this function's pair, falling back to the
    /// generic ones.
    pub fn render(&self, spite: &Spite) -> Result<Rendered> {
        let value = match &self.parser {
            Some(parse) => parse(spite).map_err(|message| ClientError::Parse {
                function: self.name.clone(),
                message,
            })?,
            None => generic_parse(spite),
        };
        let text = self
            .formatter
            .as_ref()
            .map_or_else(|| generic_render(&value), |format| format(&value));
        Ok(Rendered {
            function: self.name.clone(),
            value,
            text,
        })
    }

    /// `name <param:kind> [param:kind]` usage line.
    pub fn usage(&self) -> String {
        let mut usage = self.name.clone();
        for param in &self.params {
            if param.default.is_some() {
                usage.push_str(&format!(" [{}:{}]", param.name, param.kind));
            } else {
                usage.push_str(&format!(" <{}:{}>", param.name, param.kind));
            }
        }
        usage
    }
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("params", &self.params)
            .field("requires_module", &self.requires_module)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RegisteredFunction`].
pub struct FunctionSpec {
    function: RegisteredFunction,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, invoker: Invoker) -> Self {
        Self {
            function: RegisteredFunction {
                name: name.into(),
                alias: None,
                summary: String::new(),
                params: Vec::new(),
                requires_module: None,
                invoker,
                binder: None,
                parser: None,
                formatter: None,
            },
        }
    }

    #[must_use]
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.function.summary = summary.into();
        self
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.function.params.push(param);
        self
    }

    #[must_use]
    pub fn alias(mut self, name: impl Into<String>, arity: usize) -> Self {
        self.function.alias = Some(Alias {
            name: name.into(),
            arity,
        });
        self
    }

    #[must_use]
    pub fn requires_module(mut self, module: impl Into<String>) -> Self {
        self.function.requires_module = Some(module.into());
        self
    }

    #[must_use]
    pub fn binder(
        mut self,
        binder: impl Fn(Vec<CallArgument>) -> std::result::Result<Vec<CallArgument>, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.function.binder = Some(Arc::new(binder));
        self
    }

    #[must_use]
    pub fn parser(
        mut self,
        parser: impl Fn(&Spite) -> std::result::Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.function.parser = Some(Arc::new(parser));
        self
    }

    #[must_use]
    pub fn formatter(
        mut self,
        formatter: impl Fn(&Value) -> String + Send + Sync + 'static,
    ) -> Self {
        self.function.formatter = Some(Arc::new(formatter));
        self
    }
}

#[derive(Default)]
struct Table {
    /// Canonical names and aliases.
    by_name: HashMap<String, Arc<RegisteredFunction>>,
    /// Canonical functions in registration order.
    ordered: Vec<Arc<RegisteredFunction>>,
}

/// Every operation the front ends can call.
#[derive(Default)]
pub struct FunctionRegistry {
    table: RwLock<Table>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Names and aliases share one namespace and are
    /// never released.
    pub fn register(&self, spec: FunctionSpec) -> Result<Arc<RegisteredFunction>> {
        let function = Arc::new(spec.function);
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);

        let alias = function.alias.as_ref().map(|a| a.name.as_str());
        for name in std::iter::once(function.name.as_str()).chain(alias) {
            if table.by_name.contains_key(name) {
                return Err(ClientError::DuplicateFunction(name.to_string()));
            }
        }
        if alias == Some(function.name.as_str()) {
            return Err(ClientError::DuplicateFunction(function.name.clone()));
        }

        table
            .by_name
            .insert(function.name.clone(), Arc::clone(&function));
        if let Some(alias) = alias {
            table.by_name.insert(alias.to_string(), Arc::clone(&function));
        }
        table.ordered.push(Arc::clone(&function));
        drop(table);

        debug!(function = %function.name, "Function registered");
        Ok(function)
    }

    /// Look up by canonical name or alias.
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredFunction>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
    }

    /// Canonical functions in registration order.
    pub fn functions(&self) -> Vec<Arc<RegisteredFunction>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .clone()
    }

    /// Every callable symbol (names and aliases), sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .keys()
            .cloned()
            .collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render a payload for operation `name`. Unknown operations use the
    /// generic parser and formatter.
    pub fn render(&self, name: &str, spite: &Spite) -> Result<Rendered> {
        match self.get(name) {
            Some(function) => function.render(spite),
            None => {
                let value = generic_parse(spite);
                Ok(Rendered {
                    function: name.to_string(),
                    text: generic_render(&value),
                    value,
                })
            }
        }
    }
}
