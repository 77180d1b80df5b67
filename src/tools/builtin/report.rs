//! Reporting tools. Both read recent scan results synchronously.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::scan::{ScanJob, ScanStatus, Severity};
use crate::tools::tool::{ArgKind, ArgSpec, Tool, ToolContext, ToolOutcome, require_str};

/// How many recent scans a summary or report looks at.
pub const RECENT_SCAN_LIMIT: usize = 10;

const REPORT_ARGS: &[ArgSpec] = &[ArgSpec::required(
    "target",
    ArgKind::String,
    "Target whose completed scans are reported",
)];

/// Free-text digest of the completed scans among `jobs`.
pub fn summary_text(target: &str, jobs: &[ScanJob]) -> String {
    let completed: Vec<&ScanJob> = jobs
        .iter()
        .filter(|j| j.status == ScanStatus::Completed)
        .collect();
    if completed.is_empty() {
        return format!("No completed scans for {target}.");
    }

    let mut lines = vec![format!(
        "{} completed scan(s) for {target}:",
        completed.len()
    )];
    for job in completed {
        let headline = job
            .summary
            .as_ref()
            .map(|s| s.headline.as_str())
            .unwrap_or("no summary");
        match job.risk_score {
            Some(risk) => lines.push(format!("- {}: {headline} (risk {risk})", job.kind)),
            None => lines.push(format!("- {}: {headline}", job.kind)),
        }
    }
    lines.join("\n")
}

pub struct SummarizeTool;

#[async_trait]
impl Tool for SummarizeTool {
    fn id(&self) -> &str {
        "summarize"
    }

    fn description(&self) -> &str {
        "Summarize the most recent completed scans for a target in plain text."
    }

    fn args(&self) -> &[ArgSpec] {
        REPORT_ARGS
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
        let target = require_str(self.id(), args, "target")?;
        let jobs = ctx.scans.recent_scans(target, RECENT_SCAN_LIMIT).await?;
        Ok(ToolOutcome::Completed(serde_json::json!({
            "target": target,
            "summary": summary_text(target, &jobs),
        })))
    }
}

pub struct ReportTool;

#[async_trait]
impl Tool for ReportTool {
    fn id(&self) -> &str {
        "report"
    }

    fn description(&self) -> &str {
        "Build a structured report of open ports, findings and peak risk for a target."
    }

    fn args(&self) -> &[ArgSpec] {
        REPORT_ARGS
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
        let target = require_str(self.id(), args, "target")?;
        let jobs = ctx.scans.recent_scans(target, RECENT_SCAN_LIMIT).await?;
        Ok(ToolOutcome::Completed(build_report(target, &jobs)))
    }
}

fn build_report(target: &str, jobs: &[ScanJob]) -> Value {
    // Newest first, so the first sighting of a port wins.
    let mut ports: BTreeMap<u16, Value> = BTreeMap::new();
    let mut findings = Vec::new();
    let mut max_risk: Option<u8> = None;
    let mut max_severity: Option<Severity> = None;

    for job in jobs.iter().filter(|j| j.status == ScanStatus::Completed) {
        max_risk = max_risk.max(job.risk_score);
        let Some(summary) = &job.summary else {
            continue;
        };
        for port in &summary.open_ports {
            ports
                .entry(port.port)
                .or_insert_with(|| serde_json::to_value(port).unwrap_or(Value::Null));
        }
        for finding in &summary.findings {
            findings.push(serde_json::json!({
                "severity": finding.severity,
                "title": finding.title,
                "source": job.kind,
            }));
        }
        max_severity = max_severity.max(summary.max_severity());
    }

    let failed = jobs.iter().filter(|j| j.status == ScanStatus::Failed).count();

    serde_json::json!({
        "target": target,
        "generatedAt": Utc::now(),
        "scansConsidered": jobs.len(),
        "scansFailed": failed,
        "openPorts": ports.into_values().collect::<Vec<_>>(),
        "findings": findings,
        "maxSeverity": max_severity,
        "maxRisk": max_risk,
    })
}
