//! The scheduler facade: plan submission, task reads, ticks and the
//! free-running loop.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::legacy;
use super::processor::{TaskProcessor, TickReport};
use super::state::{SchedulerState, SchedulingMode};
use crate::agents::{AgentManifestEntry, AgentRegistry, Orchestrator};
use crate::config::SchedulerConfig;
use crate::error::{Error, ValidationError};
use crate::plan::{Step, Task, TaskFilter, sanitize_plan};
use crate::scan::{RateLimitedEnqueuer, RateLimiter, ScanQueue, validate_target};
use crate::store::{ScanStore, TaskStore};
use crate::tools::{ToolDefinition, ToolRegistry};

/// Collaborators the scheduler is built from.
pub struct SchedulerDeps {
    pub tasks: Arc<dyn TaskStore>,
    pub scans: Arc<dyn ScanStore>,
    pub tools: Arc<ToolRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub queue: Arc<ScanQueue>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub mode: SchedulingMode,
    pub paused: bool,
    /// Scan jobs waiting behind the running one.
    pub queued_scans: usize,
    pub scan_running: bool,
}

/// What the startup recovery pass repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub scans_failed: usize,
    pub steps_recovered: usize,
}

pub struct Scheduler {
    tasks: Arc<dyn TaskStore>,
    tools: Arc<ToolRegistry>,
    orchestrator: Orchestrator,
    queue: Arc<ScanQueue>,
    processor: TaskProcessor,
    config: SchedulerConfig,
    state: RwLock<SchedulerState>,
    /// Ticks never overlap.
    tick_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig) -> Self {
        let orchestrator = Orchestrator::new(deps.agents);
        let enqueuer = Arc::new(RateLimitedEnqueuer::new(
            Arc::clone(&deps.queue),
            deps.rate_limiter,
            Arc::clone(&deps.scans),
        ));
        let processor = TaskProcessor::new(
            Arc::clone(&deps.tasks),
            deps.scans,
            Arc::clone(&deps.tools),
            orchestrator.clone(),
            enqueuer,
            config.deadlock_timeout,
            config.max_transitions_per_tick,
        );
        let mode = if config.deterministic {
            SchedulingMode::Deterministic
        } else {
            SchedulingMode::FreeRunning
        };

        Self {
            tasks: deps.tasks,
            tools: deps.tools,
            orchestrator,
            queue: deps.queue,
            processor,
            config,
            state: RwLock::new(SchedulerState::new(mode)),
            tick_lock: Mutex::new(()),
        }
    }

    /// Accept a plan. The returned task is `queued`.
    ///
    /// Unknown tools, missing or mistyped arguments and bad targets are
    /// rejected before anything is stored.
    pub async fn submit(&self, owner: &str, instruction: &str, raw_plan: &[Value]) -> Result<Task, Error> {
        let mut plan = sanitize_plan(raw_plan);
        if plan.is_empty() {
            return Err(ValidationError::EmptyPlan.into());
        }

        for step in plan.iter_mut() {
            step.reset_for_submission();
        }
        for step in &plan {
            self.validate_step(step).await?;
        }

        self.orchestrator.assign_agents(&mut plan);
        if let Some(cycle) = self.orchestrator.find_cycle(&plan) {
            warn!(cycle = ?cycle, "Plan has a dependency cycle; its steps can never run");
        }

        let task = Task::new(owner, instruction, plan);
        self.tasks.create(&task).await?;
        info!(
            task_id = %task.id,
            owner = %task.owner,
            steps = task.plan.len(),
            "Task submitted"
        );
        Ok(task)
    }

    async fn validate_step(&self, step: &Step) -> Result<(), ValidationError> {
        if let Some(tool) = step.tool.as_deref() {
            self.tools.validate(tool, &step.args).await?;
            if let Some(target) = step.target() {
                validate_target(target)?;
            }
            Ok(())
        } else if let Some(action) = step.action {
            legacy::validate(action, step)
        } else {
            Err(ValidationError::UnknownTool {
                tool: step.label().to_string(),
            })
        }
    }

    /// Startup pass over work a previous process left unfinished.
    ///
    /// Orphaned scan jobs are failed and interrupted tool steps become
    /// `error`. Steps waiting on those jobs settle on the next tick.
    pub async fn recover(&self) -> Result<RecoveryReport, Error> {
        let _guard = self.tick_lock.lock().await;
        let report = RecoveryReport {
            scans_failed: self.queue.recover().await?,
            steps_recovered: self.processor.recover_interrupted().await?,
        };
        if report != RecoveryReport::default() {
            info!(
                scans_failed = report.scans_failed,
                steps_recovered = report.steps_recovered,
                "Recovered unfinished work"
            );
        }
        Ok(report)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, Error> {
        Ok(self.tasks.get(id).await?)
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error> {
        Ok(self.tasks.list(filter).await?)
    }

    /// Run exactly one tick with the current mode, paused or not.
    pub async fn manual_tick(&self) -> TickReport {
        let state = *self.state.read().await;
        self.run_tick(&state).await
    }

    async fn run_tick(&self, state: &SchedulerState) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        self.processor.tick(state).await
    }

    pub fn agent_manifest(&self) -> Vec<AgentManifestEntry> {
        self.orchestrator.agents().manifest()
    }

    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.definitions().await
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state().await;
        SchedulerStatus {
            mode: state.mode,
            paused: state.paused,
            queued_scans: self.queue.len().await,
            scan_running: self.queue.is_busy().await,
        }
    }

    pub async fn set_mode(&self, mode: SchedulingMode) {
        self.state.write().await.mode = mode;
        info!(mode = ?mode, "Scheduling mode changed");
    }

    pub async fn pause(&self) {
        self.state.write().await.paused = true;
        info!("Scheduler paused");
    }

    pub async fn resume(&self) {
        self.state.write().await.paused = false;
        info!("Scheduler resumed");
    }

    /// The serial scan queue, for status and draining.
    pub fn queue(&self) -> &Arc<ScanQueue> {
        &self.queue
    }

    /// Spawn the free-running loop. Ticks are skipped while paused or in
    /// deterministic mode.
    pub fn spawn_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_ms = scheduler.config.tick_interval.as_millis() as u64,
                "Scheduler loop started"
            );
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let state = scheduler.state().await;
                if !state.loop_should_tick() {
                    continue;
                }
                scheduler.run_tick(&state).await;
            }
        })
    }
}
