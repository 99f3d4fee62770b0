//! Tool-calling front end.
//!
//! Every registered function is exposed as one tool taking a single command
//! line, which goes through the same word splitting and coercion as the
//! shell.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::bridge::{AdaptationError, FunctionBridge, Invocation, RegisteredFunction};
use crate::error::{ClientError, Result};

/// Tool description handed to a tool-calling agent.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Tool result. Operation failures come back as `is_error` output rather
/// than as an error.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Default, Deserialize)]
struct ToolInput {
    #[serde(default)]
    command_line: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Clone)]
pub struct ToolBridge {
    bridge: Arc<FunctionBridge>,
}

impl ToolBridge {
    pub fn new(bridge: Arc<FunctionBridge>) -> Self {
        Self { bridge }
    }

    /// One descriptor per registered function, in registration order.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.bridge
            .functions()
            .functions()
            .iter()
            .map(|f| describe(f))
            .collect()
    }

    /// Run tool `name` and wait for its rendered result.
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<ToolOutput> {
        let input: ToolInput = if arguments.is_null() {
            ToolInput::default()
        } else {
            serde_json::from_value(arguments.clone())
                .map_err(|e| AdaptationError::ToolInput(e.to_string()))?
        };
        let result = self
            .bridge
            .invoke_sync(
                name,
                Invocation::Tool(input.command_line),
                input.session_id.as_deref(),
            )
            .await;
        match result {
            Ok(rendered) => Ok(ToolOutput {
                text: rendered.text,
                is_error: false,
            }),
            Err(ClientError::OperationFailed { message, .. }) => Ok(ToolOutput {
                text: message,
                is_error: true,
            }),
            Err(e) => Err(e),
        }
    }
}

fn describe(function: &RegisteredFunction) -> ToolDescriptor {
    let mut description = if function.summary.is_empty() {
        function.name.clone()
    } else {
        function.summary.clone()
    };
    description.push_str(". Usage: ");
    description.push_str(&function.usage());
    if let Some(module) = &function.requires_module {
        description.push_str(&format!(". Requires the `{module}` module"));
    }

    ToolDescriptor {
        name: function.name.clone(),
        description,
        input_schema: json!({
            "type": "object",
            "properties": {
                "command_line": {
                    "type": "string",
                    "description": "Arguments as typed in the shell, after the function name"
                },
                "session_id": {
                    "type": "string",
                    "description": "Target session; defaults to the active session"
                }
            },
            "required": ["command_line"]
        }),
    }
}
