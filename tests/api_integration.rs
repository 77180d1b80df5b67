//! Integration tests for the REST surface.
//!
//! Each test spins up an Axum server on a random port, backed by an
//! in-memory libSQL database and a stub scan executor, and exercises the
//! real HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use scan_orchestrator::agents::AgentRegistry;
use scan_orchestrator::api;
use scan_orchestrator::config::{RateLimitConfig, ScanQueueConfig, SchedulerConfig};
use scan_orchestrator::error::ScanError;
use scan_orchestrator::scan::{RateLimiter, ScanExecutor, ScanJob, ScanOutcome, ScanQueue};
use scan_orchestrator::scheduler::{Scheduler, SchedulerDeps};
use scan_orchestrator::store::LibSqlBackend;
use scan_orchestrator::tools::ToolRegistry;
use scan_orchestrator::tools::builtin::register_builtin_tools;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reports one open port for every scan.
struct StubExecutor;

#[async_trait]
impl ScanExecutor for StubExecutor {
    async fn execute(&self, job: &ScanJob) -> Result<ScanOutcome, ScanError> {
        Ok(ScanOutcome::from_output(job.kind, "443/tcp open https\n"))
    }
}

/// Start an Axum server on a random port in deterministic mode.
async fn start_server() -> (String, Arc<Scheduler>) {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools).await.unwrap();
    let queue = ScanQueue::new(
        db.clone(),
        Arc::new(StubExecutor),
        ScanQueueConfig {
            follow_up_enabled: false,
            ..Default::default()
        },
    );
    let rate_limiter = Arc::new(RateLimiter::new(db.clone(), RateLimitConfig::default()));

    let scheduler = Arc::new(Scheduler::new(
        SchedulerDeps {
            tasks: db.clone(),
            scans: db,
            tools,
            agents: Arc::new(AgentRegistry::with_defaults()),
            queue,
            rate_limiter,
        },
        SchedulerConfig {
            deterministic: true,
            ..Default::default()
        },
    ));
    let app = api::routes(Arc::clone(&scheduler));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), scheduler)
}

fn scan_and_report(target: &str) -> Value {
    json!({
        "owner": "alice",
        "instruction": "assess the host",
        "plan": [
            { "tool": "port_scan", "args": { "target": target } },
            { "tool": "report", "args": { "target": target }, "dependsOn": [0] }
        ]
    })
}

#[tokio::test]
async fn test_health() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_server().await;
        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "scan-orchestrator");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_submit_tick_and_complete() {
    timeout(TEST_TIMEOUT, async {
        let (base, scheduler) = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/tasks"))
            .json(&scan_and_report("203.0.113.7"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let task: Value = resp.json().await.unwrap();
        assert_eq!(task["status"], "queued");
        assert_eq!(task["plan"][0]["agent"], "recon");
        assert_eq!(task["plan"][1]["dependsOn"], json!([0]));
        let id = task["id"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for _ in 0..10 {
            let tick = client
                .post(format!("{base}/api/scheduler/tick"))
                .send()
                .await
                .unwrap();
            assert_eq!(tick.status(), 200);
            let report: Value = tick.json().await.unwrap();
            assert!(report["transitions"].as_u64().unwrap() <= 1);
            scheduler.queue().wait_idle().await;

            last = reqwest::get(format!("{base}/api/tasks/{id}"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if last["status"] == "completed" {
                break;
            }
        }

        assert_eq!(last["status"], "completed");
        assert_eq!(last["plan"][0]["status"], "done");
        assert_eq!(last["plan"][1]["status"], "done");
        assert_eq!(last["result"]["target"], "203.0.113.7");
        assert_eq!(last["result"]["openPorts"][0]["port"], 443);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_invalid_plan_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_server().await;
        let client = reqwest::Client::new();

        for body in [
            json!({ "plan": [] }),
            json!({ "plan": [{ "tool": "rm_rf", "args": {} }] }),
            json!({ "plan": [{ "tool": "port_scan", "args": {} }] }),
            json!({ "plan": [{ "tool": "verify_port", "args": { "target": "h", "port": "eighty" } }] }),
        ] {
            let resp = client
                .post(format!("{base}/api/tasks"))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 422, "body {body}");
            let err: Value = resp.json().await.unwrap();
            assert!(err["error"].is_string());
        }

        let tasks: Vec<Value> = reqwest::get(format!("{base}/api/tasks"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(tasks.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_get_task_errors() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_server().await;

        let bad = reqwest::get(format!("{base}/api/tasks/not-a-uuid")).await.unwrap();
        assert_eq!(bad.status(), 400);

        let missing = reqwest::get(format!("{base}/api/tasks/{}", uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_list_filters_by_status() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_server().await;
        let client = reqwest::Client::new();
        client
            .post(format!("{base}/api/tasks"))
            .json(&scan_and_report("198.51.100.1"))
            .send()
            .await
            .unwrap();

        let queued: Vec<Value> = reqwest::get(format!("{base}/api/tasks?status=queued"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);

        let completed: Vec<Value> = reqwest::get(format!("{base}/api/tasks?status=completed"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(completed.is_empty());

        let bad = reqwest::get(format!("{base}/api/tasks?status=sideways")).await.unwrap();
        assert_eq!(bad.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_agents_tools_and_status() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_server().await;

        let agents: Vec<Value> = reqwest::get(format!("{base}/api/agents"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(agents.len(), 4);
        assert_eq!(agents[0]["agentId"], "recon");
        assert_eq!(agents[0]["concurrencyLimit"], 3);

        let tools: Vec<Value> = reqwest::get(format!("{base}/api/tools"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tools.len(), 7);
        assert_eq!(tools[0]["id"], "http_probe");
        assert_eq!(tools[0]["parameters"]["required"], json!(["target"]));

        let status: Value = reqwest::get(format!("{base}/api/scheduler"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["mode"], "deterministic");
        assert_eq!(status["paused"], false);
        assert_eq!(status["queuedScans"], 0);
    })
    .await
    .expect("test timed out");
}
