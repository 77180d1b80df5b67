//! Tool registry: the sole authority on what a step may do.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{RegistryError, ToolError, ValidationError};
use crate::plan::Step;
use crate::tools::tool::{Tool, ToolContext, ToolOutcome, validate_args};

/// Public description of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub id: String,
    pub description: String,
    pub parameters: Value,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Never overwrites an existing registration.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let id = tool.id().trim().to_string();
        if id.is_empty() {
            return Err(RegistryError::MissingId);
        }

        let mut tools = self.tools.write().await;
        if tools.contains_key(&id) {
            tracing::warn!(tool = %id, "Rejected duplicate tool registration");
            return Err(RegistryError::Duplicate(id));
        }
        tools.insert(id.clone(), tool);
        tracing::debug!("Registered tool: {}", id);
        Ok(())
    }

    /// Get a tool by id.
    pub async fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(id).cloned()
    }

    /// Check if a tool exists.
    pub async fn has(&self, id: &str) -> bool {
        self.tools.read().await.contains_key(id)
    }

    /// All tool ids, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get the number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Definitions of every tool, sorted by id.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                id: tool.id().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Check a tool call without running it.
    pub async fn validate(&self, id: &str, args: &Map<String, Value>) -> Result<(), ValidationError> {
        let tool = self.get(id).await.ok_or_else(|| ValidationError::UnknownTool {
            tool: id.to_string(),
        })?;
        validate_args(id, tool.args(), args)
    }

    /// Look up, validate and run the tool of a tool-bearing step.
    pub async fn execute(&self, step: &Step, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
        let id = step.tool.as_deref().unwrap_or_default();
        let tool = self
            .get(id)
            .await
            .ok_or_else(|| ToolError::UnknownTool(id.to_string()))?;
        validate_args(id, tool.args(), &step.args)?;

        tracing::debug!(
            task_id = %ctx.task_id,
            step = ctx.step_index,
            tool = %id,
            "Running tool"
        );
        tool.run(&step.args, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ScanEnqueuer, ScanJob, ScanKind, ScanRequest};
    use crate::tools::tool::{ArgKind, ArgSpec};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct MockTool {
        id: String,
    }

    const MOCK_ARGS: &[ArgSpec] = &[ArgSpec::required("target", ArgKind::String, "host")];

    #[async_trait]
    impl Tool for MockTool {
        fn id(&self) -> &str {
            &self.id
        }
        fn description(&self) -> &str {
            "A mock tool for testing"
        }
        fn args(&self) -> &[ArgSpec] {
            MOCK_ARGS
        }
        async fn run(&self, args: &Map<String, Value>, _ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::Completed(args["target"].clone()))
        }
    }

    struct NoScans;

    #[async_trait]
    impl ScanEnqueuer for NoScans {
        async fn enqueue_scan(&self, _request: ScanRequest) -> Result<ScanJob, ToolError> {
            Err(ToolError::ExecutionFailed {
                tool: "mock".into(),
                reason: "no scans".into(),
            })
        }
        async fn recent_scans(&self, _target: &str, _limit: usize) -> Result<Vec<ScanJob>, ToolError> {
            Ok(Vec::new())
        }
        async fn reusable_scan(&self, _target: &str, _kind: ScanKind) -> Result<Option<ScanJob>, ToolError> {
            Ok(None)
        }
    }

    fn mock(id: &str) -> Arc<dyn Tool> {
        Arc::new(MockTool { id: id.to_string() })
    }

    fn ctx(scans: &NoScans) -> ToolContext<'_> {
        ToolContext {
            task_id: Uuid::new_v4(),
            step_index: 0,
            owner: "tester",
            scans,
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(mock("test_tool")).await.unwrap();
        assert!(registry.has("test_tool").await);
        assert!(!registry.has("nonexistent").await);

        let retrieved = registry.get("test_tool").await;
        assert_eq!(retrieved.unwrap().id(), "test_tool");
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_missing_id_rejected() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.register(mock("  ")).await, Err(RegistryError::MissingId));
    }

    #[tokio::test]
    async fn test_duplicate_rejected_without_overwrite() {
        let registry = ToolRegistry::new();
        registry.register(mock("a")).await.unwrap();
        assert_eq!(
            registry.register(mock("a")).await,
            Err(RegistryError::Duplicate("a".into()))
        );
        assert_eq!(registry.list().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_definitions() {
        let registry = ToolRegistry::new();
        registry.register(mock("b_tool")).await.unwrap();
        registry.register(mock("a_tool")).await.unwrap();

        let defs = registry.definitions().await;
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].id, "a_tool");
        assert_eq!(defs[0].parameters["required"][0], "target");
    }

    #[tokio::test]
    async fn test_validate() {
        let registry = ToolRegistry::new();
        registry.register(mock("a")).await.unwrap();

        let ok = serde_json::json!({ "target": "h" });
        assert!(registry.validate("a", ok.as_object().unwrap()).await.is_ok());
        assert!(matches!(
            registry.validate("zzz", ok.as_object().unwrap()).await,
            Err(ValidationError::UnknownTool { .. })
        ));
        assert!(matches!(
            registry.validate("a", &Map::new()).await,
            Err(ValidationError::MissingArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute() {
        let registry = ToolRegistry::new();
        registry.register(mock("a")).await.unwrap();
        let scans = NoScans;

        let step = Step::tool(0, "a", serde_json::json!({ "target": "h" }));
        let outcome = registry.execute(&step, &ctx(&scans)).await.unwrap();
        assert_eq!(outcome, ToolOutcome::Completed(serde_json::json!("h")));

        let unknown = Step::tool(1, "nope", serde_json::json!({}));
        assert!(matches!(
            registry.execute(&unknown, &ctx(&scans)).await,
            Err(ToolError::UnknownTool(_))
        ));

        let bad = Step::tool(2, "a", serde_json::json!({ "target": 5 }));
        assert!(matches!(
            registry.execute(&bad, &ctx(&scans)).await,
            Err(ToolError::InvalidArguments(ValidationError::WrongType { .. }))
        ));
    }
}
