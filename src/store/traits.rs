//! Persistence traits consumed by the scheduler and the scan queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::plan::{Step, Task, TaskFilter};
use crate::scan::{ScanJob, ScanKind, ScanSummary};

/// Task rows. The scheduler is the only writer after creation.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task.
    async fn create(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// List tasks matching a filter, oldest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError>;

    /// Replace the full plan snapshot.
    async fn replace_plan(&self, id: Uuid, plan: &[Step]) -> Result<(), DatabaseError>;

    /// Move a queued task to running.
    async fn mark_running(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Finish a task with a synthesized result.
    async fn mark_completed(&self, id: Uuid, result: &serde_json::Value) -> Result<(), DatabaseError>;

    /// Fail a task with a reason.
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError>;
}

/// Scan job rows, owned by the scan queue.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Insert a new queued job.
    async fn create(&self, job: &ScanJob) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get(&self, id: Uuid) -> Result<Option<ScanJob>, DatabaseError>;

    async fn mark_running(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn mark_completed(
        &self,
        id: Uuid,
        raw_output: &str,
        summary: &ScanSummary,
        risk_score: u8,
    ) -> Result<(), DatabaseError>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError>;

    /// Jobs created for `target` at or after `since`, in any status.
    async fn count_recent_for_target(
        &self,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Most recent jobs for `target`, newest first.
    async fn recent_for_target(&self, target: &str, limit: usize) -> Result<Vec<ScanJob>, DatabaseError>;

    /// Newest job of `kind` for `target` created at or after `since`.
    async fn latest_of_kind(
        &self,
        target: &str,
        kind: ScanKind,
        since: DateTime<Utc>,
    ) -> Result<Option<ScanJob>, DatabaseError>;

    /// Newest `completed` job of `kind` for `target` created at or after `since`.
    async fn latest_completed_of_kind(
        &self,
        target: &str,
        kind: ScanKind,
        since: DateTime<Utc>,
    ) -> Result<Option<ScanJob>, DatabaseError>;

    /// Jobs still `queued` or `running`, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<ScanJob>, DatabaseError>;
}
