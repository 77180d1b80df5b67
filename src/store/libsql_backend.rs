//! libSQL backend for tasks and scan jobs.
//!
//! Supports local file and in-memory databases. Plans, results and scan
//! summaries are stored as JSON text columns.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::plan::{Step, Task, TaskFilter, TaskStatus};
use crate::scan::{ScanJob, ScanKind, ScanStatus, ScanSummary};
use crate::store::migrations;
use crate::store::traits::{ScanStore, TaskStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Apply pending migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn set_task_status(
        &self,
        op: &str,
        id: Uuid,
        status: TaskStatus,
        result: libsql::Value,
        error: libsql::Value,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, result = COALESCE(?2, result), error = COALESCE(?3, error), updated_at = ?4 WHERE id = ?5",
                params![status.as_str(), result, error, now_text(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        ensure_updated(count, "task", id)?;
        debug!(task_id = %id, status = %status, "Task status updated in DB");
        Ok(())
    }

    async fn query_scans(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ScanJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_scan(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping scan job row: {e}"),
            }
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, owner, instruction, plan, status, result, error, created_at, updated_at";

const SCAN_COLUMNS: &str = "id, kind, target, command, owner, parent_id, status, summary, raw_output, risk_score, error, created_at, updated_at";

/// Canonical write format. Fixed precision keeps lexical and time order equal.
fn to_text(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_text() -> String {
    to_text(Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn ensure_updated(count: u64, entity: &str, id: Uuid) -> Result<(), DatabaseError> {
    if count == 0 {
        return Err(DatabaseError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a libsql Row to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));
    let id_str: String = row.get(0).map_err(parse)?;
    let plan_json: String = row.get(3).map_err(parse)?;
    let status_str: String = row.get(4).map_err(parse)?;
    let result_json: Option<String> = row.get(5).ok();
    let created_str: String = row.get(7).map_err(parse)?;
    let updated_str: String = row.get(8).map_err(parse)?;

    let plan: Vec<Step> = serde_json::from_str(&plan_json)
        .map_err(|e| DatabaseError::Serialization(format!("task plan: {e}")))?;
    let status = TaskStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown task status '{status_str}'"))
    })?;

    Ok(Task {
        id: Uuid::parse_str(&id_str).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        owner: row.get(1).map_err(parse)?,
        instruction: row.get(2).map_err(parse)?,
        plan,
        status,
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(6).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a ScanJob.
fn row_to_scan(row: &libsql::Row) -> Result<ScanJob, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("scan row parse: {e}"));
    let id_str: String = row.get(0).map_err(parse)?;
    let kind_str: String = row.get(1).map_err(parse)?;
    let parent_str: Option<String> = row.get(5).ok();
    let status_str: String = row.get(6).map_err(parse)?;
    let summary_json: Option<String> = row.get(7).ok();
    let risk: Option<i64> = row.get(9).ok();
    let created_str: String = row.get(11).map_err(parse)?;
    let updated_str: String = row.get(12).map_err(parse)?;

    Ok(ScanJob {
        id: Uuid::parse_str(&id_str).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        kind: ScanKind::parse(&kind_str)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown scan kind '{kind_str}'")))?,
        target: row.get(2).map_err(parse)?,
        command: row.get(3).map_err(parse)?,
        owner: row.get(4).map_err(parse)?,
        parent_id: parent_str.and_then(|s| Uuid::parse_str(&s).ok()),
        status: ScanStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown scan status '{status_str}'"))
        })?,
        summary: summary_json.and_then(|s| serde_json::from_str::<ScanSummary>(&s).ok()),
        raw_output: row.get(8).ok(),
        risk_score: risk.map(|r| r.clamp(0, 100) as u8),
        error: row.get(10).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Task store ──────────────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn create(&self, task: &Task) -> Result<(), DatabaseError> {
        let result = match &task.result {
            Some(v) => Some(to_json(v)?),
            None => None,
        };
        self.conn()
            .execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    task.id.to_string(),
                    task.owner.clone(),
                    task.instruction.clone(),
                    to_json(&task.plan)?,
                    task.status.as_str(),
                    opt_text(result),
                    opt_text(task.error.clone()),
                    to_text(task.created_at),
                    to_text(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(task_id = %task.id, steps = task.plan.len(), "Task inserted into DB");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?
        {
            match row_to_task(&row) {
                Ok(task) if filter.matches(&task) => tasks.push(task),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
            if filter.limit.is_some_and(|limit| tasks.len() >= limit) {
                break;
            }
        }
        Ok(tasks)
    }

    async fn replace_plan(&self, id: Uuid, plan: &[Step]) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET plan = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_json(plan)?, now_text(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_plan: {e}")))?;
        ensure_updated(count, "task", id)
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.set_task_status(
            "mark_task_running",
            id,
            TaskStatus::Running,
            libsql::Value::Null,
            libsql::Value::Null,
        )
        .await
    }

    async fn mark_completed(&self, id: Uuid, result: &serde_json::Value) -> Result<(), DatabaseError> {
        self.set_task_status(
            "mark_task_completed",
            id,
            TaskStatus::Completed,
            libsql::Value::Text(to_json(result)?),
            libsql::Value::Null,
        )
        .await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        self.set_task_status(
            "mark_task_failed",
            id,
            TaskStatus::Failed,
            libsql::Value::Null,
            libsql::Value::Text(reason.to_string()),
        )
        .await
    }
}

// ── Scan store ──────────────────────────────────────────────────────

#[async_trait]
impl ScanStore for LibSqlBackend {
    async fn create(&self, job: &ScanJob) -> Result<(), DatabaseError> {
        let summary = match &job.summary {
            Some(s) => Some(to_json(s)?),
            None => None,
        };
        let risk = match job.risk_score {
            Some(r) => libsql::Value::Integer(r as i64),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO scan_jobs ({SCAN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    job.id.to_string(),
                    job.kind.as_str(),
                    job.target.clone(),
                    job.command.clone(),
                    job.owner.clone(),
                    opt_text(job.parent_id.map(|p| p.to_string())),
                    job.status.as_str(),
                    opt_text(summary),
                    opt_text(job.raw_output.clone()),
                    risk,
                    opt_text(job.error.clone()),
                    to_text(job.created_at),
                    to_text(job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_scan: {e}")))?;

        debug!(scan_id = %job.id, kind = %job.kind, target = %job.target, "Scan job inserted into DB");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScanJob>, DatabaseError> {
        let jobs = self
            .query_scans(
                "get_scan",
                &format!("SELECT {SCAN_COLUMNS} FROM scan_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scan_jobs SET status = 'running', updated_at = ?1 WHERE id = ?2",
                params![now_text(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scan_running: {e}")))?;
        ensure_updated(count, "scan_job", id)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        raw_output: &str,
        summary: &ScanSummary,
        risk_score: u8,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scan_jobs SET status = 'completed', raw_output = ?1, summary = ?2, risk_score = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    raw_output.to_string(),
                    to_json(summary)?,
                    risk_score as i64,
                    now_text(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scan_completed: {e}")))?;
        ensure_updated(count, "scan_job", id)
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scan_jobs SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
                params![reason.to_string(), now_text(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scan_failed: {e}")))?;
        ensure_updated(count, "scan_job", id)
    }

    async fn count_recent_for_target(
        &self,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM scan_jobs WHERE target = ?1 AND created_at >= ?2",
                params![target.to_string(), to_text(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_recent_scans: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_recent_scans: {e}"))),
        }
    }

    async fn recent_for_target(&self, target: &str, limit: usize) -> Result<Vec<ScanJob>, DatabaseError> {
        self.query_scans(
            "recent_scans",
            &format!(
                "SELECT {SCAN_COLUMNS} FROM scan_jobs WHERE target = ?1 ORDER BY created_at DESC LIMIT ?2"
            ),
            params![target.to_string(), limit as i64],
        )
        .await
    }

    async fn latest_of_kind(
        &self,
        target: &str,
        kind: ScanKind,
        since: DateTime<Utc>,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let jobs = self
            .query_scans(
                "latest_scan_of_kind",
                &format!(
                    "SELECT {SCAN_COLUMNS} FROM scan_jobs WHERE target = ?1 AND kind = ?2 AND created_at >= ?3 ORDER BY created_at DESC LIMIT 1"
                ),
                params![target.to_string(), kind.as_str(), to_text(since)],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }
    async fn latest_completed_of_kind(
        &self,
        target: &str,
        kind: ScanKind,
        since: DateTime<Utc>,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let jobs = self
            .query_scans(
                "latest_completed_scan_of_kind",
                &format!(
                    "SELECT {SCAN_COLUMNS} FROM scan_jobs WHERE target = ?1 AND kind = ?2 AND status = 'completed' AND created_at >= ?3 ORDER BY created_at DESC LIMIT 1"
                ),
                params![target.to_string(), kind.as_str(), to_text(since)],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_unfinished(&self) -> Result<Vec<ScanJob>, DatabaseError> {
        self.query_scans(
            "unfinished_scans",
            &format!(
                "SELECT {SCAN_COLUMNS} FROM scan_jobs WHERE status IN ('queued', 'running') ORDER BY created_at ASC"
            ),
            (),
        )
        .await
    }
}
