//! Built-in scanning and reporting tools.

pub mod report;
pub mod scan;

use std::sync::Arc;

pub use report::{RECENT_SCAN_LIMIT, ReportTool, SummarizeTool, summary_text};
pub use scan::{ScanTool, VerifyPortTool};

use crate::error::RegistryError;
use crate::tools::ToolRegistry;

/// Register every built-in tool.
pub async fn register_builtin_tools(registry: &ToolRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(ScanTool::port_scan())).await?;
    registry.register(Arc::new(ScanTool::http_probe())).await?;
    registry.register(Arc::new(ScanTool::vuln_scan())).await?;
    registry.register(Arc::new(ScanTool::web_scan())).await?;
    registry.register(Arc::new(VerifyPortTool)).await?;
    registry.register(Arc::new(SummarizeTool)).await?;
    registry.register(Arc::new(ReportTool)).await?;
    tracing::info!(count = registry.count(), "Built-in tools registered");
    Ok(())
}
