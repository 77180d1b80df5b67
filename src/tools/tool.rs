//! Tool abstraction: what a tool-bearing step may do.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ToolError, ValidationError};
use crate::scan::ScanEnqueuer;

/// Primitive type of a declared argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ArgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// One declared argument of a tool.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub description: &'static str,
}

impl ArgSpec {
    pub const fn required(name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// What running a tool produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// Finished synchronously; the step becomes `done`.
    Completed(Value),
    /// A scan job was queued; the step waits on it.
    Enqueued(Uuid),
}

/// Everything a tool may touch while running a step.
pub struct ToolContext<'a> {
    pub task_id: Uuid,
    pub step_index: usize,
    pub owner: &'a str,
    pub scans: &'a dyn ScanEnqueuer,
}

/// A registered capability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry key; matches `Step.tool`.
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// Declared arguments, checked before `run`.
    fn args(&self) -> &[ArgSpec];

    /// JSON-schema view of [`Tool::args`].
    fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in self.args() {
            properties.insert(
                arg.name.to_string(),
                serde_json::json!({
                    "type": arg.kind.as_str(),
                    "description": arg.description,
                }),
            );
            if arg.required {
                required.push(Value::String(arg.name.to_string()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError>;
}

/// Check `args` against a tool's declared schema.
///
/// Unknown keys are ignored.
pub fn validate_args(tool: &str, declared: &[ArgSpec], args: &Map<String, Value>) -> Result<(), ValidationError> {
    for arg in declared {
        match args.get(arg.name) {
            None | Some(Value::Null) if arg.required => {
                return Err(ValidationError::MissingArgument {
                    tool: tool.to_string(),
                    arg: arg.name.to_string(),
                });
            }
            Some(value) if !value.is_null() && !arg.kind.matches(value) => {
                return Err(ValidationError::WrongType {
                    tool: tool.to_string(),
                    arg: arg.name.to_string(),
                    expected: arg.kind.as_str().to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Get a required string argument.
pub fn require_str<'a>(tool: &str, args: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolError> {
    args.get(name).and_then(Value::as_str).ok_or_else(|| {
        ToolError::InvalidArguments(ValidationError::MissingArgument {
            tool: tool.to_string(),
            arg: name.to_string(),
        })
    })
}
