use std::sync::{Arc, OnceLock};

use scan_orchestrator::agents::AgentRegistry;
use scan_orchestrator::api;
use scan_orchestrator::config::AppConfig;
use scan_orchestrator::scan::{ProcessExecutor, RateLimiter, ScanQueue};
use scan_orchestrator::scheduler::{Scheduler, SchedulerDeps};
use scan_orchestrator::store::LibSqlBackend;
use scan_orchestrator::tools::ToolRegistry;
use scan_orchestrator::tools::builtin::register_builtin_tools;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    init_tracing(config.server.log_dir.as_deref())?;

    eprintln!("🛰  Scan Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/tasks", config.server.port);
    eprintln!(
        "   Mode: {}",
        if config.scheduler.deterministic {
            "deterministic (tick via POST /api/scheduler/tick)"
        } else {
            "free-running"
        }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.server.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.server.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.server.db_path.display());

    // ── Scans ────────────────────────────────────────────────────────────
    let executor = Arc::new(ProcessExecutor::new(
        config.scan_queue.scan_timeout,
        config.scan_queue.max_output_bytes,
    ));
    let queue = ScanQueue::new(db.clone(), executor, config.scan_queue.clone());
    let rate_limiter = Arc::new(RateLimiter::new(db.clone(), config.rate_limit.clone()));
    eprintln!(
        "   Rate limit: {} scans per target per {}s ({} overrides)",
        config.rate_limit.default_limit,
        config.rate_limit.window.as_secs(),
        config.rate_limit.overrides.len()
    );

    // ── Tools & agents ───────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools).await?;
    eprintln!("   Tools: {} registered", tools.count());

    let agents = Arc::new(AgentRegistry::with_defaults());
    eprintln!("   Agents: {}", agents.agents().len());

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        SchedulerDeps {
            tasks: db.clone(),
            scans: db,
            tools,
            agents,
            queue,
            rate_limiter,
        },
        config.scheduler.clone(),
    ));
    match scheduler.recover().await {
        Ok(report) => eprintln!(
            "   Recovery: {} scan(s) failed, {} step(s) recovered",
            report.scans_failed, report.steps_recovered
        ),
        Err(e) => tracing::warn!(error = %e, "Startup recovery failed"),
    }
    let _loop_handle = scheduler.spawn_loop();

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::routes(Arc::clone(&scheduler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port)).await?;
    tracing::info!(port = config.server.port, "HTTP server started");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Console logging, plus a daily-rotated file when `log_dir` is set.
fn init_tracing(log_dir: Option<&std::path::Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "scan-orchestrator.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    Ok(())
}
