//! End-to-end scheduling scenarios over the in-memory store and a stub
//! scan executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use scan_orchestrator::agents::{AgentRegistry, RECON_AGENT};
use scan_orchestrator::config::{RateLimitConfig, ScanQueueConfig, SchedulerConfig};
use scan_orchestrator::error::{ScanError, ToolError};
use scan_orchestrator::plan::{Step, StepStatus, Task, TaskStatus, plan_to_json, sanitize_plan};
use scan_orchestrator::scan::{
    INTERRUPTED_BY_RESTART, RateLimiter, ScanExecutor, ScanJob, ScanOutcome, ScanQueue, ScanStatus,
};
use scan_orchestrator::scheduler::{Scheduler, SchedulerDeps, SchedulingMode};
use scan_orchestrator::store::{MemoryStore, TaskStore};
use scan_orchestrator::tools::{ArgSpec, Tool, ToolContext, ToolOutcome, ToolRegistry};
use scan_orchestrator::tools::builtin::register_builtin_tools;

/// Succeeds with empty output. Targets starting with `fail` fail to spawn;
/// targets starting with `slow` take 100ms and `hang` never finishes.
struct StubExecutor;

#[async_trait]
impl ScanExecutor for StubExecutor {
    async fn execute(&self, job: &ScanJob) -> Result<ScanOutcome, ScanError> {
        let delay = match job.target.as_str() {
            t if t.starts_with("hang") => 3_600_000,
            t if t.starts_with("slow") => 100,
            _ => 2,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if job.target.starts_with("fail") {
            return Err(ScanError::Spawn {
                program: "nmap".into(),
                reason: "No such file or directory".into(),
            });
        }
        Ok(ScanOutcome::from_output(job.kind, ""))
    }
}

/// Panics on every call.
struct ExplodingTool;

#[async_trait]
impl Tool for ExplodingTool {
    fn id(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Always panics."
    }

    fn args(&self) -> &[ArgSpec] {
        &[]
    }

    async fn run(&self, _args: &Map<String, Value>, _ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
        panic!("tool blew up")
    }
}

struct Harness {
    scheduler: Arc<Scheduler>,
    store: Arc<MemoryStore>,
    agents: Arc<AgentRegistry>,
}

impl Harness {
    async fn new(config: SchedulerConfig, rate_limit: RateLimitConfig) -> Self {
        Self::over(Arc::new(MemoryStore::new()), config, rate_limit, Vec::new()).await
    }

    /// A fresh scheduler and queue over an existing store, with `extra`
    /// tools next to the built-ins.
    async fn over(
        store: Arc<MemoryStore>,
        config: SchedulerConfig,
        rate_limit: RateLimitConfig,
        extra: Vec<Arc<dyn Tool>>,
    ) -> Self {
        let tools = Arc::new(ToolRegistry::new());
        register_builtin_tools(&tools).await.unwrap();
        for tool in extra {
            tools.register(tool).await.unwrap();
        }
        let agents = Arc::new(AgentRegistry::with_defaults());
        let queue = ScanQueue::new(store.clone(), Arc::new(StubExecutor), ScanQueueConfig::default());
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), rate_limit));

        let scheduler = Arc::new(Scheduler::new(
            SchedulerDeps {
                tasks: store.clone(),
                scans: store.clone(),
                tools,
                agents: agents.clone(),
                queue,
                rate_limiter,
            },
            config,
        ));
        Self {
            scheduler,
            store,
            agents,
        }
    }

    async fn with_mode(mode: SchedulingMode) -> Self {
        Self::new(config(mode), RateLimitConfig::default()).await
    }

    async fn submit(&self, plan: &[Value]) -> Task {
        self.scheduler.submit("tester", "scenario", plan).await.unwrap()
    }

    async fn task(&self, id: Uuid) -> Task {
        self.scheduler.get(id).await.unwrap().expect("task exists")
    }

    /// One tick, then let the scan queue drain.
    async fn tick(&self, id: Uuid) -> Task {
        self.scheduler.manual_tick().await;
        self.scheduler.queue().wait_idle().await;
        self.task(id).await
    }

    /// Tick until the task is terminal, returning every observed snapshot.
    async fn run(&self, id: Uuid, max_ticks: usize) -> Vec<Task> {
        let mut history = vec![self.task(id).await];
        for _ in 0..max_ticks {
            let task = self.tick(id).await;
            let terminal = task.status.is_terminal();
            history.push(task);
            if terminal {
                return history;
            }
        }
        panic!("task {id} not terminal after {max_ticks} ticks");
    }
}

fn config(mode: SchedulingMode) -> SchedulerConfig {
    SchedulerConfig {
        deterministic: mode == SchedulingMode::Deterministic,
        ..Default::default()
    }
}

fn tool(name: &str, target: &str) -> Value {
    json!({ "tool": name, "args": { "target": target } })
}

fn tool_after(name: &str, target: &str, deps: &[usize]) -> Value {
    json!({ "tool": name, "args": { "target": target }, "dependsOn": deps })
}

fn rank(status: StepStatus) -> u8 {
    match status {
        StepStatus::Pending => 0,
        StepStatus::Running => 1,
        StepStatus::Waiting => 2,
        StepStatus::Done | StepStatus::Error => 3,
    }
}

/// Properties that must hold for every snapshot sequence.
fn assert_invariants(history: &[Task], agents: &AgentRegistry) {
    for pair in history.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        for (old, new) in before.plan.iter().zip(&after.plan) {
            assert!(
                rank(new.status) >= rank(old.status),
                "step {} regressed from {} to {}",
                old.index,
                old.status,
                new.status
            );
            if old.status.is_terminal() {
                assert_eq!(old.status, new.status, "terminal step {} changed", old.index);
            }
        }
    }

    for task in history {
        assert_snapshot(task, agents);
    }
}

fn assert_snapshot(task: &Task, agents: &AgentRegistry) {
    let mut in_flight: HashMap<&str, usize> = HashMap::new();
    for step in &task.plan {
        if !step.status.is_in_flight() {
            continue;
        }
        for &dep in &step.depends_on {
            assert_eq!(
                task.plan[dep].status,
                StepStatus::Done,
                "step {} is {} before dependency {dep} is done",
                step.index,
                step.status
            );
        }
        if let Some(agent) = step.agent.as_deref() {
            *in_flight.entry(agent).or_default() += 1;
        }
    }
    for (agent, count) in in_flight {
        assert!(
            count <= agents.limit_of(agent),
            "agent {agent} has {count} steps in flight"
        );
    }
}

fn statuses(task: &Task) -> Vec<StepStatus> {
    task.plan.iter().map(|s| s.status).collect()
}

#[test]
fn sanitize_is_idempotent() {
    let plans = vec![
        json!([tool("port_scan", "a"), tool_after("summarize", "a", &[0])]),
        json!([
            "garbage",
            { "tool": "Bad Tool!" },
            tool_after("vuln_scan", "b", &[0, 1, 5]),
            { "action": "run_scan", "args": { "target": "b", "type": "nmap", "nested": { "x": 1 } } },
            { "tool": "report", "args": { "target": "b" }, "dependsOn": [2, 2, 3], "status": "bogus" },
        ]),
        json!([{ "tool": "port_scan", "args": { "target": "x".repeat(2000) }, "dependsOn": [0] }]),
    ];

    for raw in plans {
        let once = sanitize_plan(raw.as_array().unwrap());
        let twice = sanitize_plan(&plan_to_json(&once));
        assert_eq!(once, twice);
    }
}

#[tokio::test]
async fn scan_then_summarize_in_both_modes() {
    for mode in [SchedulingMode::Deterministic, SchedulingMode::FreeRunning] {
        let h = Harness::with_mode(mode).await;
        let task = h
            .submit(&[tool("port_scan", "10.0.0.5"), tool_after("summarize", "10.0.0.5", &[0])])
            .await;

        let history = h.run(task.id, 10).await;
        assert_invariants(&history, &h.agents);

        for snapshot in &history {
            if snapshot.plan[1].status.is_in_flight() || snapshot.plan[1].status.is_terminal() {
                assert_eq!(snapshot.plan[0].status, StepStatus::Done);
            }
        }

        let last = history.last().unwrap();
        assert_eq!(last.status, TaskStatus::Completed, "mode {mode:?}");
        assert_eq!(statuses(last), vec![StepStatus::Done, StepStatus::Done]);
        let summary = last.result.as_ref().unwrap()["summary"].as_str().unwrap();
        assert!(summary.starts_with("1 completed scan(s) for 10.0.0.5:"));
    }
}

#[tokio::test]
async fn deterministic_mode_advances_one_step_per_tick() {
    let h = Harness::with_mode(SchedulingMode::Deterministic).await;
    let task = h
        .submit(&[
            tool("port_scan", "a.example"),
            tool("http_probe", "a.example"),
            tool("vuln_scan", "a.example"),
            tool_after("report", "a.example", &[0, 1, 2]),
        ])
        .await;

    let history = h.run(task.id, 20).await;
    assert_invariants(&history, &h.agents);

    for pair in history.windows(2) {
        let changed = pair[0]
            .plan
            .iter()
            .zip(&pair[1].plan)
            .filter(|(old, new)| old.status != new.status)
            .count();
        assert!(changed <= 1, "{changed} steps advanced in one deterministic tick");
    }
    // three scans out and back, then the report
    assert_eq!(history.len() - 1, 7);
    assert_eq!(history.last().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn free_running_advances_everything_runnable() {
    let h = Harness::with_mode(SchedulingMode::FreeRunning).await;
    let task = h
        .submit(&[tool("port_scan", "a.example"), tool("http_probe", "a.example")])
        .await;

    let after_first = h.tick(task.id).await;
    assert_eq!(statuses(&after_first), vec![StepStatus::Waiting, StepStatus::Waiting]);
    assert!(after_first.plan.iter().all(|s| s.scan_ref.is_some()));

    let after_second = h.tick(task.id).await;
    assert_eq!(after_second.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_concurrency_never_exceeded() {
    for mode in [SchedulingMode::Deterministic, SchedulingMode::FreeRunning] {
        let h = Harness::with_mode(mode).await;
        let plan: Vec<Value> = (0..5).map(|i| tool("port_scan", &format!("host{i}.example"))).collect();
        let task = h.submit(&plan).await;
        let task_id = task.id;
        assert!(task.plan.iter().all(|s| s.agent.as_deref() == Some(RECON_AGENT)));

        // Watch the store while ticks run, not only between them.
        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let store = h.store.clone();
            let agents = h.agents.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut peak = 0;
                while !stop.load(Ordering::SeqCst) {
                    if let Some(task) = TaskStore::get(&*store, task_id).await.unwrap() {
                        assert_snapshot(&task, &agents);
                        peak = peak.max(task.plan.iter().filter(|s| s.status.is_in_flight()).count());
                    }
                    tokio::task::yield_now().await;
                }
                peak
            })
        };

        let history = h.run(task_id, 30).await;
        stop.store(true, Ordering::SeqCst);
        let peak = watcher.await.unwrap();

        assert_invariants(&history, &h.agents);
        assert!(peak <= 3, "peak in-flight {peak}");
        let max_between_ticks = history
            .iter()
            .map(|t| t.plan.iter().filter(|s| s.status.is_in_flight()).count())
            .max()
            .unwrap();
        assert!(max_between_ticks <= 3);
        if mode == SchedulingMode::FreeRunning {
            assert_eq!(max_between_ticks, 3);
        }
        assert_eq!(history.last().unwrap().status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn rate_limit_records_error_and_task_completes() {
    for mode in [SchedulingMode::Deterministic, SchedulingMode::FreeRunning] {
        let h = Harness::new(
            config(mode),
            RateLimitConfig::default().with_override("t.example", 2),
        )
        .await;
        let task = h
            .submit(&[
                tool("port_scan", "t.example"),
                tool_after("vuln_scan", "t.example", &[0]),
                tool_after("web_scan", "t.example", &[1]),
            ])
            .await;

        let history = h.run(task.id, 15).await;
        assert_invariants(&history, &h.agents);

        let last = history.last().unwrap();
        assert_eq!(last.status, TaskStatus::Completed);
        assert_eq!(
            statuses(last),
            vec![StepStatus::Done, StepStatus::Done, StepStatus::Error]
        );
        let error = last.plan[2].error.as_deref().unwrap();
        assert!(error.contains("Rate limit exceeded for t.example"), "{error}");
        assert_eq!(h.store.all_scans().await.len(), 2);
    }
}

#[tokio::test]
async fn two_cycle_deadlocks_after_timeout() {
    let h = Harness::new(
        SchedulerConfig {
            deadlock_timeout: Duration::from_millis(50),
            ..config(SchedulingMode::FreeRunning)
        },
        RateLimitConfig::default(),
    )
    .await;
    let task = h
        .submit(&[tool_after("port_scan", "c.example", &[1]), tool_after("http_probe", "c.example", &[0])])
        .await;

    let first = h.tick(task.id).await;
    assert_eq!(first.status, TaskStatus::Running);
    assert_eq!(statuses(&first), vec![StepStatus::Pending, StepStatus::Pending]);
    assert!(first.plan.iter().all(|s| s.first_seen_pending_at.is_some()));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let failed = h.tick(task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("Deadlock"));
    assert_eq!(statuses(&failed), vec![StepStatus::Pending, StepStatus::Pending]);

    // a failed task is no longer visited
    let report = h.scheduler.manual_tick().await;
    assert_eq!(report.tasks_visited, 0);
}

#[tokio::test]
async fn blocked_step_stamp_clears_when_runnable() {
    let h = Harness::with_mode(SchedulingMode::Deterministic).await;
    let task = h
        .submit(&[tool("port_scan", "slow.example"), tool_after("summarize", "slow.example", &[0])])
        .await;

    // Tick without draining the queue so the scan is still in progress.
    h.scheduler.manual_tick().await;
    let waiting = h.task(task.id).await;
    assert_eq!(waiting.plan[0].status, StepStatus::Waiting);
    assert!(waiting.plan[1].first_seen_pending_at.is_none());

    h.scheduler.manual_tick().await;
    let blocked = h.task(task.id).await;
    assert_eq!(blocked.plan[0].status, StepStatus::Waiting);
    assert!(blocked.plan[1].first_seen_pending_at.is_some());

    // Reconcile spends the budget; step 1 becomes selectable but does not run.
    h.scheduler.queue().wait_idle().await;
    let reconciled = h.tick(task.id).await;
    assert_eq!(reconciled.plan[0].status, StepStatus::Done);
    assert_eq!(reconciled.plan[1].status, StepStatus::Pending);
    assert!(reconciled.plan[1].first_seen_pending_at.is_none());
    assert_eq!(reconciled.status, TaskStatus::Running);
}

#[tokio::test]
async fn spawn_error_fails_step_and_queue_moves_on() {
    let h = Harness::with_mode(SchedulingMode::FreeRunning).await;
    let task = h
        .submit(&[
            tool("port_scan", "fail.example"),
            tool("port_scan", "ok.example"),
            tool_after("report", "ok.example", &[1]),
        ])
        .await;

    let history = h.run(task.id, 10).await;
    assert_invariants(&history, &h.agents);

    let scans = h.store.all_scans().await;
    assert_eq!(scans.len(), 2);
    let failed = scans.iter().find(|j| j.target == "fail.example").unwrap();
    assert_eq!(failed.status, ScanStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("Failed to spawn nmap"));
    let ok = scans.iter().find(|j| j.target == "ok.example").unwrap();
    assert_eq!(ok.status, ScanStatus::Completed);

    let last = history.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(
        statuses(last),
        vec![StepStatus::Error, StepStatus::Done, StepStatus::Done]
    );
    assert!(last.plan[0].error.as_deref().unwrap().contains("Failed to spawn"));
    assert_eq!(last.result.as_ref().unwrap()["target"], "ok.example");
}

#[tokio::test]
async fn legacy_actions_scan_dedupe_and_summarize() {
    let h = Harness::with_mode(SchedulingMode::FreeRunning).await;
    let first = h
        .submit(&[
            json!({ "action": "run_scan", "args": { "target": "l.example", "type": "nmap" } }),
            json!({ "action": "summarize", "args": { "target": "l.example" }, "dependsOn": [0] }),
        ])
        .await;
    let history = h.run(first.id, 10).await;
    assert_invariants(&history, &h.agents);
    let done = history.last().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.plan[0].scan_ref.is_some());
    assert!(done.result.as_ref().unwrap()["summary"].is_string());

    // the same scan again is satisfied from the completed job
    let second = h
        .submit(&[json!({ "action": "scan", "args": { "target": "l.example", "type": "port_scan" } })])
        .await;
    let after = h.tick(second.id).await;
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.plan[0].result.as_ref().unwrap()["deduplicated"], true);
    assert_eq!(h.store.all_scans().await.len(), 1);
}

#[tokio::test]
async fn await_scan_without_reference_errors() {
    let h = Harness::with_mode(SchedulingMode::FreeRunning).await;
    let task = h.submit(&[json!({ "action": "await_scan" })]).await;
    let after = h.tick(task.id).await;
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.plan[0].status, StepStatus::Error);
    assert_eq!(after.result, Some(Value::Null));
}

#[tokio::test]
async fn untagged_steps_run_without_dependency_metadata() {
    let h = Harness::with_mode(SchedulingMode::FreeRunning).await;

    // Rows persisted before agent tagging carry no agent.
    let plan = vec![
        Step::tool(0, "summarize", json!({ "target": "u.example" })),
        Step::tool(1, "port_scan", json!({ "target": "u.example" })),
        Step::tool(2, "http_probe", json!({ "target": "u.example" })).with_depends_on([0]),
    ];
    let task = Task::new("legacy", "old row", plan);
    TaskStore::create(&*h.store, &task).await.unwrap();

    let first = h.tick(task.id).await;
    assert_eq!(first.plan[0].status, StepStatus::Done);
    assert_eq!(first.plan[1].status, StepStatus::Waiting);
    assert_eq!(first.plan[2].status, StepStatus::Pending);

    let second = h.tick(task.id).await;
    assert_eq!(second.plan[1].status, StepStatus::Done);
    // dependency metadata keeps it out of the untagged path
    assert_eq!(second.plan[2].status, StepStatus::Pending);
    assert_eq!(second.status, TaskStatus::Running);
}

#[tokio::test]
async fn free_running_loop_completes_tasks() {
    let h = Harness::new(
        SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            ..config(SchedulingMode::FreeRunning)
        },
        RateLimitConfig::default(),
    )
    .await;
    let task = h
        .submit(&[tool("http_probe", "loop.example"), tool_after("report", "loop.example", &[0])])
        .await;

    let handle = h.scheduler.spawn_loop();
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = h.task(task.id).await;
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop finishes the task");
    handle.abort();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result.as_ref().unwrap()["target"], "loop.example");
}

#[tokio::test]
async fn paused_loop_does_not_tick() {
    let h = Harness::new(
        SchedulerConfig {
            tick_interval: Duration::from_millis(5),
            ..config(SchedulingMode::FreeRunning)
        },
        RateLimitConfig::default(),
    )
    .await;
    h.scheduler.pause().await;
    let task = h.submit(&[tool("summarize", "p.example")]).await;

    let handle = h.scheduler.spawn_loop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::Queued);

    h.scheduler.resume().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.task(task.id).await.status.is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("resumed loop finishes the task");
    handle.abort();
}

#[tokio::test]
async fn panicking_tool_errors_step_and_siblings_finish() {
    let h = Harness::over(
        Arc::new(MemoryStore::new()),
        config(SchedulingMode::FreeRunning),
        RateLimitConfig::default(),
        vec![Arc::new(ExplodingTool)],
    )
    .await;
    let task = h
        .submit(&[json!({ "tool": "explode", "args": {} }), tool("summarize", "x.example")])
        .await;

    let history = h.run(task.id, 5).await;
    assert_invariants(&history, &h.agents);

    let last = history.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(statuses(last), vec![StepStatus::Error, StepStatus::Done]);
    let error = last.plan[0].error.as_deref().unwrap();
    assert!(error.contains("panicked: tool blew up"), "{error}");
    assert!(last.result.as_ref().unwrap()["summary"].is_string());

    // the scheduler keeps working afterwards
    let next = h.submit(&[tool("summarize", "y.example")]).await;
    assert_eq!(h.tick(next.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn restart_fails_interrupted_work_and_tasks_finish() {
    let store = Arc::new(MemoryStore::new());
    let before = Harness::over(
        store.clone(),
        config(SchedulingMode::FreeRunning),
        RateLimitConfig::default(),
        Vec::new(),
    )
    .await;
    let scans = before
        .submit(&[tool("port_scan", "hang.example"), tool("http_probe", "hang.example")])
        .await;
    before.scheduler.manual_tick().await;
    let waiting = before.task(scans.id).await;
    assert_eq!(statuses(&waiting), vec![StepStatus::Waiting, StepStatus::Waiting]);

    // A tool step saved as running when the process stopped.
    let mut step = Step::tool(0, "summarize", json!({ "target": "hang.example" }));
    step.status = StepStatus::Running;
    let mid_tool = Task::new("tester", "mid-tool", vec![step]);
    TaskStore::create(&*store, &mid_tool).await.unwrap();
    drop(before);

    let after = Harness::over(
        store.clone(),
        config(SchedulingMode::FreeRunning),
        RateLimitConfig::default(),
        Vec::new(),
    )
    .await;
    let report = after.scheduler.recover().await.unwrap();
    assert_eq!(report.scans_failed, 2);
    assert_eq!(report.steps_recovered, 1);
    assert!(store.all_scans().await.iter().all(|j| {
        j.status == ScanStatus::Failed && j.error.as_deref() == Some(INTERRUPTED_BY_RESTART)
    }));

    let history = after.run(scans.id, 5).await;
    assert_invariants(&history, &after.agents);
    let last = history.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(statuses(last), vec![StepStatus::Error, StepStatus::Error]);
    assert!(last.plan.iter().all(|s| s.error.as_deref() == Some(INTERRUPTED_BY_RESTART)));

    let repaired = after.task(mid_tool.id).await;
    assert_eq!(repaired.plan[0].status, StepStatus::Error);
    assert_eq!(repaired.plan[0].error.as_deref(), Some(INTERRUPTED_BY_RESTART));
    assert_eq!(after.tick(mid_tool.id).await.status, TaskStatus::Completed);

    // nothing left to recover
    assert_eq!(after.scheduler.recover().await.unwrap().scans_failed, 0);
}
