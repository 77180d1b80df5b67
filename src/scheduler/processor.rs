//! The tick engine.
//!
//! One tick visits every active task in creation order and, per task:
//! reconciles waiting steps against their scan jobs, selects runnable steps,
//! tracks deadlock, executes within the transition budget, persists the plan
//! snapshot and completes the task once every step is terminal.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::legacy;
use super::state::{SchedulerState, SchedulingMode, TransitionBudget};
use crate::agents::Orchestrator;
use crate::error::{Error, SchedulerError, ToolError};
use crate::plan::{LegacyAction, Step, StepStatus, Task, TaskFilter, TaskStatus};
use crate::scan::queue::panic_message;
use crate::scan::{INTERRUPTED_BY_RESTART, ScanEnqueuer, ScanStatus};
use crate::store::{ScanStore, TaskStore};
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub tasks_visited: usize,
    /// Steps advanced across all tasks.
    pub transitions: usize,
    pub completed: usize,
    pub failed: usize,
}

/// How the execution set was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    /// Dependency-runnable and under the agent ceiling.
    Primary,
    /// Untagged, dependency-free pending steps. No concurrency gating.
    Secondary,
}

#[derive(Debug, Default)]
struct TaskTick {
    transitions: usize,
    finished: Option<TaskStatus>,
}

pub struct TaskProcessor {
    tasks: Arc<dyn TaskStore>,
    scans: Arc<dyn ScanStore>,
    tools: Arc<ToolRegistry>,
    orchestrator: Orchestrator,
    enqueuer: Arc<dyn ScanEnqueuer>,
    deadlock_timeout: Duration,
    max_transitions_per_tick: Option<i64>,
}

impl TaskProcessor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        scans: Arc<dyn ScanStore>,
        tools: Arc<ToolRegistry>,
        orchestrator: Orchestrator,
        enqueuer: Arc<dyn ScanEnqueuer>,
        deadlock_timeout: Duration,
        max_transitions_per_tick: Option<i64>,
    ) -> Self {
        Self {
            tasks,
            scans,
            tools,
            orchestrator,
            enqueuer,
            deadlock_timeout,
            max_transitions_per_tick,
        }
    }

    /// One pass over every active task.
    ///
    /// A store error aborts the pass for that task only.
    pub async fn tick(&self, state: &SchedulerState) -> TickReport {
        let mut report = TickReport::default();

        let tasks = match self.tasks.list(&TaskFilter::active()).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list active tasks");
                return report;
            }
        };

        for task in tasks {
            let task_id = task.id;
            report.tasks_visited += 1;
            match self.process_task(task, state.mode).await {
                Ok(tick) => {
                    report.transitions += tick.transitions;
                    match tick.finished {
                        Some(TaskStatus::Completed) => report.completed += 1,
                        Some(TaskStatus::Failed) => report.failed += 1,
                        _ => {}
                    }
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "Task tick aborted"),
            }
        }

        if report.transitions > 0 {
            debug!(
                tasks = report.tasks_visited,
                transitions = report.transitions,
                completed = report.completed,
                failed = report.failed,
                "Tick finished"
            );
        }
        report
    }

    /// Settle steps a previous process left `running`.
    ///
    /// A step without a scan reference stopped mid-tool and becomes `error`.
    /// One with a reference goes back to `waiting` so reconcile observes its
    /// scan job. Returns the number of steps touched.
    pub async fn recover_interrupted(&self) -> Result<usize, Error> {
        let mut recovered = 0;
        for mut task in self.tasks.list(&TaskFilter::active()).await? {
            let mut touched = 0;
            for step in task.plan.iter_mut().filter(|s| s.status == StepStatus::Running) {
                match step.scan_ref {
                    Some(_) => step.transition(StepStatus::Waiting)?,
                    None => step.fail(INTERRUPTED_BY_RESTART)?,
                }
                touched += 1;
            }
            if touched > 0 {
                self.tasks.replace_plan(task.id, &task.plan).await?;
                warn!(task_id = %task.id, steps = touched, "Recovered steps interrupted by restart");
                recovered += touched;
            }
        }
        Ok(recovered)
    }

    async fn process_task(&self, mut task: Task, mode: SchedulingMode) -> Result<TaskTick, Error> {
        let mut budget = TransitionBudget::for_mode(mode, self.max_transitions_per_tick);
        let mut tick = TaskTick::default();

        if task.status == TaskStatus::Queued {
            self.tasks.mark_running(task.id).await?;
            task.status = TaskStatus::Running;
            info!(task_id = %task.id, steps = task.plan.len(), "Task started");
        }

        tick.transitions += self.reconcile(&mut task, &mut budget).await?;
        let mut dirty = tick.transitions > 0;

        let (selected, selection) = self.select(&task.plan);
        dirty |= track_pending(&mut task.plan, &selected);

        if selected.is_empty()
            && let Some(waited) = longest_pending(&task.plan)
            && waited >= self.deadlock_timeout
        {
            self.fail_deadlocked(&task, waited).await?;
            tick.finished = Some(TaskStatus::Failed);
            return Ok(tick);
        }

        for index in selected {
            if budget.is_exhausted() {
                break;
            }
            if !self.still_selectable(&task.plan, index, selection) {
                continue;
            }
            budget.try_spend();
            self.execute_step(&mut task, index).await?;
            tick.transitions += 1;
            dirty = true;
        }

        if task.all_steps_terminal() {
            let result = synthesize_result(&task.plan);
            self.tasks.replace_plan(task.id, &task.plan).await?;
            self.tasks.mark_completed(task.id, &result).await?;
            let counts = task.step_counts();
            info!(
                task_id = %task.id,
                done = counts.done,
                errored = counts.error,
                "Task completed"
            );
            tick.finished = Some(TaskStatus::Completed);
        } else if dirty {
            self.tasks.replace_plan(task.id, &task.plan).await?;
        }
        Ok(tick)
    }

    /// Settle waiting steps whose scan job reached a terminal state.
    async fn reconcile(&self, task: &mut Task, budget: &mut TransitionBudget) -> Result<usize, Error> {
        let mut advanced = 0;
        for step in task.plan.iter_mut().filter(|s| s.status == StepStatus::Waiting) {
            if budget.is_exhausted() {
                break;
            }

            match step.scan_ref {
                Some(scan_id) => match self.scans.get(scan_id).await? {
                    Some(job) if job.status == ScanStatus::Completed => {
                        step.complete(legacy::scan_result(&job))?;
                    }
                    Some(job) if job.status == ScanStatus::Failed => {
                        step.fail(job.error.as_deref().unwrap_or("scan failed"))?;
                    }
                    Some(_) => continue,
                    None => step.fail(format!("scan job {scan_id} not found"))?,
                },
                None => step.fail("waiting without a scan reference")?,
            }

            budget.try_spend();
            advanced += 1;
            debug!(
                task_id = %task.id,
                step = step.index,
                status = %step.status,
                "Reconciled waiting step"
            );
        }
        Ok(advanced)
    }

    fn select(&self, plan: &[Step]) -> (Vec<usize>, Selection) {
        let primary = self.orchestrator.select(plan);
        if !primary.is_empty() {
            return (primary, Selection::Primary);
        }
        let secondary = self.orchestrator.legacy_candidates(plan);
        if !secondary.is_empty() {
            debug!(steps = ?secondary, "Using untagged-step selection");
        }
        (secondary, Selection::Secondary)
    }

    fn still_selectable(&self, plan: &[Step], index: usize, selection: Selection) -> bool {
        let step = &plan[index];
        if step.status != StepStatus::Pending {
            return false;
        }
        match selection {
            Selection::Primary => {
                self.orchestrator.dependencies_met(step, plan) && self.orchestrator.can_run(step, plan)
            }
            Selection::Secondary => step.agent.is_none() && step.depends_on.is_empty(),
        }
    }

    async fn execute_step(&self, task: &mut Task, index: usize) -> Result<(), Error> {
        let step = task.plan[index].clone();
        let owner = task.owner.clone();
        let ctx = ToolContext {
            task_id: task.id,
            step_index: index,
            owner: &owner,
            scans: self.enqueuer.as_ref(),
        };

        let run = async {
            match (step.tool.as_deref(), step.action) {
                (Some(_), _) => self.tools.execute(&step, &ctx).await,
                (None, Some(action)) => legacy::run(action, &step, &ctx).await,
                (None, None) => Err(ToolError::ExecutionFailed {
                    tool: step.label().to_string(),
                    reason: "step has neither a tool nor an action".to_string(),
                }),
            }
        };

        if step.tool.is_some() {
            task.plan[index].transition(StepStatus::Running)?;
            self.tasks.replace_plan(task.id, &task.plan).await?;
        }

        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(ToolError::ExecutionFailed {
                tool: step.label().to_string(),
                reason: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        };

        let target = &mut task.plan[index];
        match outcome {
            Ok(ToolOutcome::Completed(result)) => {
                if target.status == StepStatus::Pending {
                    target.transition(StepStatus::Running)?;
                }
                target.complete(result)?;
            }
            Ok(ToolOutcome::Enqueued(scan_id)) => {
                target.transition(StepStatus::Waiting)?;
                target.scan_ref = Some(scan_id);
            }
            Err(e) => {
                if target.status == StepStatus::Pending {
                    target.transition(StepStatus::Running)?;
                }
                warn!(
                    task_id = %task.id,
                    step = index,
                    tool = %step.label(),
                    error = %e,
                    "Step failed"
                );
                target.fail(e.to_string())?;
            }
        }

        debug!(
            task_id = %task.id,
            step = index,
            tool = %step.label(),
            agent = step.agent.as_deref().unwrap_or("-"),
            status = %task.plan[index].status,
            "Step executed"
        );
        Ok(())
    }

    async fn fail_deadlocked(&self, task: &Task, waited: Duration) -> Result<(), Error> {
        let steps: Vec<usize> = task
            .plan
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.index)
            .collect();
        let reason = SchedulerError::Deadlock {
            task_id: task.id,
            steps,
            waited,
        }
        .to_string();

        warn!(task_id = %task.id, waited_secs = waited.as_secs(), "Task deadlocked");
        self.tasks.replace_plan(task.id, &task.plan).await?;
        self.tasks.mark_failed(task.id, &reason).await?;
        Ok(())
    }
}

/// Clear stamps of selected steps; stamp every pending step when nothing
/// was selected. Returns whether anything changed.
fn track_pending(plan: &mut [Step], selected: &[usize]) -> bool {
    let now = Utc::now();
    let mut changed = false;
    for step in plan.iter_mut().filter(|s| s.status == StepStatus::Pending) {
        if selected.contains(&step.index) {
            changed |= step.first_seen_pending_at.take().is_some();
        } else if selected.is_empty() && step.first_seen_pending_at.is_none() {
            step.first_seen_pending_at = Some(now);
            changed = true;
        }
    }
    changed
}

/// Age of the oldest pending stamp.
fn longest_pending(plan: &[Step]) -> Option<Duration> {
    let oldest = plan
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter_map(|s| s.first_seen_pending_at)
        .min()?;
    Some((Utc::now() - oldest).to_std().unwrap_or_default())
}

/// Result of a finished task: the last report, else the last summary, else
/// the last successful step's result.
fn synthesize_result(plan: &[Step]) -> Value {
    let done = || {
        plan.iter()
            .rev()
            .filter(|s| s.status == StepStatus::Done)
    };
    let is_summary =
        |s: &&Step| s.tool.as_deref() == Some("summarize") || s.action == Some(LegacyAction::Summarize);

    done()
        .find(|s| s.tool.as_deref() == Some("report"))
        .or_else(|| done().find(is_summary))
        .or_else(|| done().next())
        .and_then(|s| s.result.clone())
        .unwrap_or(Value::Null)
}
