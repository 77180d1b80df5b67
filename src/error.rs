//! Error types for the scan orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors raised by task and scan stores.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A submitted plan or tool call that cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Plan contains no runnable steps")]
    EmptyPlan,

    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("Tool {tool} is missing required argument '{arg}'")]
    MissingArgument { tool: String, arg: String },

    #[error("Tool {tool} argument '{arg}' must be of type {expected}")]
    WrongType {
        tool: String,
        arg: String,
        expected: String,
    },

    #[error("Invalid scan target: {target}")]
    InvalidTarget { target: String },

    #[error("Unknown scan type: {kind}")]
    UnknownScanKind { kind: String },
}

/// Tool registration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool definition has no id")]
    MissingId,

    #[error("Tool '{0}' is already registered")]
    Duplicate(String),

    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),
}

/// A scan request refused by the per-target sliding window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit exceeded for {target}: {recent} scans in window, limit {limit}")]
pub struct RateLimitError {
    pub target: String,
    pub recent: u64,
    pub limit: i64,
}

/// Errors raised while running a step's tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(#[from] ValidationError),

    #[error("{0}")]
    RateLimited(#[from] RateLimitError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Tool {tool} execution failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },
}

/// Failures of a scan job or of the queue feeding it.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} exited with status {code}: {stderr}")]
    ExitStatus {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Scan timed out after {0:?}")]
    Timeout(Duration),

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid scan request: {0}")]
    Invalid(#[from] ValidationError),
}

/// Scheduler state-machine errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Deadlock: steps {steps:?} of task {task_id} unrunnable for {waited:?}")]
    Deadlock {
        task_id: Uuid,
        steps: Vec<usize>,
        waited: Duration,
    },

    #[error("Step {index} cannot transition from {from} to {to}")]
    InvalidTransition {
        index: usize,
        from: String,
        to: String,
    },
}
