//! Action-bearing steps from plans written before the tool registry.

use serde_json::{Value, json};

use crate::error::{ToolError, ValidationError};
use crate::plan::{LegacyAction, Step};
use crate::scan::{ScanJob, ScanKind, ScanRequest, validate_target};
use crate::tools::builtin::{RECENT_SCAN_LIMIT, summary_text};
use crate::tools::{ToolContext, ToolOutcome};

/// Check a legacy step's arguments at submission time.
pub fn validate(action: LegacyAction, step: &Step) -> Result<(), ValidationError> {
    let tool = action.as_str();
    match action {
        LegacyAction::RunScan => {
            validate_target(required(tool, step, "target")?)?;
            let kind = required(tool, step, "type")?;
            ScanKind::parse(kind).ok_or_else(|| ValidationError::UnknownScanKind {
                kind: kind.to_string(),
            })?;
            Ok(())
        }
        LegacyAction::Summarize => {
            validate_target(required(tool, step, "target")?)?;
            Ok(())
        }
        LegacyAction::AwaitScan => Ok(()),
    }
}

/// Run a legacy action. `Enqueued` leaves the step waiting on that scan.
pub async fn run(action: LegacyAction, step: &Step, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
    match action {
        LegacyAction::RunScan => run_scan(step, ctx).await,
        LegacyAction::AwaitScan => step
            .scan_ref
            .map(ToolOutcome::Enqueued)
            .ok_or_else(|| ToolError::ExecutionFailed {
                tool: action.as_str().to_string(),
                reason: "no scan reference to await".to_string(),
            }),
        LegacyAction::Summarize => {
            let target = validate_target(required(action.as_str(), step, "target")?)?;
            let jobs = ctx.scans.recent_scans(target, RECENT_SCAN_LIMIT).await?;
            Ok(ToolOutcome::Completed(json!({
                "target": target,
                "summary": summary_text(target, &jobs),
            })))
        }
    }
}

async fn run_scan(step: &Step, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
    let tool = LegacyAction::RunScan.as_str();
    let target = validate_target(required(tool, step, "target")?)?;
    let raw_kind = required(tool, step, "type")?;
    let kind = ScanKind::parse(raw_kind).ok_or_else(|| ValidationError::UnknownScanKind {
        kind: raw_kind.to_string(),
    })?;

    if let Some(done) = ctx.scans.reusable_scan(target, kind).await? {
        tracing::debug!(
            task_id = %ctx.task_id,
            step = ctx.step_index,
            scan_id = %done.id,
            "Reusing completed scan"
        );
        let mut result = scan_result(&done);
        result["deduplicated"] = Value::Bool(true);
        return Ok(ToolOutcome::Completed(result));
    }

    let job = ctx
        .scans
        .enqueue_scan(ScanRequest::new(kind, target, ctx.owner))
        .await?;
    Ok(ToolOutcome::Enqueued(job.id))
}

/// Result recorded on a step whose scan finished.
pub fn scan_result(job: &ScanJob) -> Value {
    json!({
        "scanId": job.id,
        "kind": job.kind,
        "target": job.target,
        "summary": job.summary,
        "riskScore": job.risk_score,
    })
}

fn required<'a>(tool: &str, step: &'a Step, arg: &str) -> Result<&'a str, ValidationError> {
    match step.args.get(arg) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ValidationError::WrongType {
            tool: tool.to_string(),
            arg: arg.to_string(),
            expected: "string".to_string(),
        }),
        None => Err(ValidationError::MissingArgument {
            tool: tool.to_string(),
            arg: arg.to_string(),
        }),
    }
}
