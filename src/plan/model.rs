//! Task and step types with the step state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

/// State of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet.
    Pending,
    /// Its tool is executing right now.
    Running,
    /// Suspended on a scan job.
    Waiting,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Error,
}

impl StepStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Running -> Waiting` covers a tool that hands its work to the scan queue.
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        use StepStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Waiting) |
            (Running, Waiting) | (Running, Done) | (Running, Error) |
            (Waiting, Done) | (Waiting, Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Running or waiting; counts against the owning agent's ceiling.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Parse a status string, returning `None` for anything unrecognised.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions understood from plans written before the tool registry existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyAction {
    /// Enqueue a scan of `args.type` against `args.target`.
    RunScan,
    /// Wait for the scan already referenced by `scanRef`.
    AwaitScan,
    /// Free-text summary of recent completed scans for `args.target`.
    Summarize,
}

impl LegacyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunScan => "run_scan",
            Self::AwaitScan => "await_scan",
            Self::Summarize => "summarize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run_scan" | "scan" => Some(Self::RunScan),
            "await_scan" => Some(Self::AwaitScan),
            "summarize" => Some(Self::Summarize),
            _ => None,
        }
    }
}

/// One unit of plan work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Position in the plan. Never changes after sanitization.
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<LegacyAction>,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Sorted, de-duplicated sibling indexes.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// Owning agent, resolved once when the plan is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_ref: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_pending_at: Option<DateTime<Utc>>,
}

impl Step {
    /// A pending tool-bearing step.
    pub fn tool(index: usize, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: Some(tool.into()),
            args: into_map(args),
            ..Self::blank(index)
        }
    }

    /// A pending legacy action-bearing step.
    pub fn action(index: usize, action: LegacyAction, args: serde_json::Value) -> Self {
        Self {
            action: Some(action),
            args: into_map(args),
            ..Self::blank(index)
        }
    }

    pub(crate) fn blank(index: usize) -> Self {
        Self {
            index,
            tool: None,
            action: None,
            args: serde_json::Map::new(),
            depends_on: Vec::new(),
            agent: None,
            status: StepStatus::Pending,
            scan_ref: None,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            first_seen_pending_at: None,
        }
    }

    pub fn with_depends_on(mut self, deps: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on = deps.into_iter().collect();
        self.depends_on.sort_unstable();
        self.depends_on.dedup();
        self
    }

    /// Tool id or legacy action name, for logs.
    pub fn label(&self) -> &str {
        match (&self.tool, &self.action) {
            (Some(tool), _) => tool,
            (None, Some(action)) => action.as_str(),
            (None, None) => "<none>",
        }
    }

    /// The `target` argument, if present.
    pub fn target(&self) -> Option<&str> {
        self.args.get("target").and_then(|v| v.as_str())
    }

    /// Move to a new status, stamping timestamps.
    pub fn transition(&mut self, to: StepStatus) -> Result<(), SchedulerError> {
        if !self.status.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                index: self.index,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        match to {
            StepStatus::Running | StepStatus::Waiting if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            StepStatus::Done | StepStatus::Error => {
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.first_seen_pending_at = None;
        self.status = to;
        Ok(())
    }

    /// Finish successfully with a result.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), SchedulerError> {
        self.transition(StepStatus::Done)?;
        self.result = Some(result);
        Ok(())
    }

    /// Finish with an error message, truncated to [`MAX_STEP_ERROR_CHARS`].
    pub fn fail(&mut self, message: impl AsRef<str>) -> Result<(), SchedulerError> {
        self.transition(StepStatus::Error)?;
        self.error = Some(truncate_chars(message.as_ref(), MAX_STEP_ERROR_CHARS));
        Ok(())
    }

    /// Clear runtime state a client must not be able to pre-seed.
    ///
    /// An `await_scan` step keeps its `scanRef`, which is its only input.
    pub fn reset_for_submission(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.result = None;
        self.first_seen_pending_at = None;
        if self.action != Some(LegacyAction::AwaitScan) {
            self.scan_ref = None;
        }
    }
}

/// Maximum stored length of a step error message.
pub const MAX_STEP_ERROR_CHARS: usize = 500;

/// A unit of work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub owner: String,
    pub instruction: String,
    pub plan: Vec<Step>,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Failure reason when `status == failed`.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(owner: impl Into<String>, instruction: impl Into<String>, plan: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            instruction: instruction.into(),
            plan,
            status: TaskStatus::Queued,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Every step is done or errored.
    pub fn all_steps_terminal(&self) -> bool {
        self.plan.iter().all(|s| s.status.is_terminal())
    }

    /// Number of steps in each status.
    pub fn step_counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for step in &self.plan {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Waiting => counts.waiting += 1,
                StepStatus::Done => counts.done += 1,
                StepStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub pending: usize,
    pub running: usize,
    pub waiting: usize,
    pub done: usize,
    pub error: usize,
}

/// Which tasks a store listing should return.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub owner: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Tasks the scheduler still has to drive.
    pub fn active() -> Self {
        Self {
            statuses: Some(vec![TaskStatus::Queued, TaskStatus::Running]),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&task.status)
        {
            return false;
        }
        if let Some(ref owner) = self.owner
            && *owner != task.owner
        {
            return false;
        }
        true
    }
}

fn into_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// Truncate to at most `max` characters (UTF-8 safe).
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_transitions_valid() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Waiting));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Waiting));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Done));
        assert!(StepStatus::Waiting.can_transition_to(StepStatus::Error));
    }

    #[test]
    fn step_transitions_never_regress() {
        assert!(!StepStatus::Done.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Error.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Waiting.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Waiting.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Done));
        assert!(!StepStatus::Done.can_transition_to(StepStatus::Error));
    }

    #[test]
    fn transition_stamps_times() {
        let mut step = Step::tool(0, "port_scan", serde_json::json!({"target": "a"}));
        step.first_seen_pending_at = Some(Utc::now());
        step.transition(StepStatus::Running).unwrap();
        assert!(step.started_at.is_some());
        assert!(step.first_seen_pending_at.is_none());
        step.transition(StepStatus::Waiting).unwrap();
        step.complete(serde_json::json!({"ok": true})).unwrap();
        assert_eq!(step.status, StepStatus::Done);
        assert!(step.completed_at.is_some());
        assert!(step.transition(StepStatus::Running).is_err());
    }

    #[test]
    fn fail_truncates_message() {
        let mut step = Step::tool(0, "x", serde_json::json!({}));
        step.transition(StepStatus::Running).unwrap();
        step.fail("e".repeat(2000)).unwrap();
        assert_eq!(step.error.as_ref().unwrap().chars().count(), MAX_STEP_ERROR_CHARS);
    }

    #[test]
    fn reset_keeps_await_scan_ref() {
        let scan = Uuid::new_v4();
        let mut awaiting = Step::action(0, LegacyAction::AwaitScan, serde_json::json!({}));
        awaiting.scan_ref = Some(scan);
        awaiting.status = StepStatus::Done;
        awaiting.reset_for_submission();
        assert_eq!(awaiting.status, StepStatus::Pending);
        assert_eq!(awaiting.scan_ref, Some(scan));

        let mut tool = Step::tool(1, "port_scan", serde_json::json!({}));
        tool.scan_ref = Some(scan);
        tool.reset_for_submission();
        assert!(tool.scan_ref.is_none());
    }

    #[test]
    fn status_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&StepStatus::Waiting).unwrap(), "\"waiting\"");
        assert_eq!(serde_json::to_string(&TaskStatus::Completed).unwrap(), "\"completed\"");
        assert_eq!(StepStatus::parse("bogus"), None);
    }

    #[test]
    fn filter_active() {
        let mut task = Task::new("o", "i", vec![]);
        assert!(TaskFilter::active().matches(&task));
        task.status = TaskStatus::Completed;
        assert!(!TaskFilter::active().matches(&task));
    }
}
