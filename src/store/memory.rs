//! In-memory store used by tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{ScanStore, TaskStore};
use crate::error::DatabaseError;
use crate::plan::{Step, Task, TaskFilter, TaskStatus};
use crate::scan::{ScanJob, ScanKind, ScanStatus, ScanSummary};

/// Both stores behind `RwLock`ed maps.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    scans: RwLock<HashMap<Uuid, ScanJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All scan jobs, oldest first.
    pub async fn all_scans(&self) -> Vec<ScanJob> {
        let mut jobs: Vec<ScanJob> = self.scans.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

fn not_found(entity: &str, id: Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, task: &Task) -> Result<(), DatabaseError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn replace_plan(&self, id: Uuid, plan: &[Step]) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| not_found("task", id))?;
        task.plan = plan.to_vec();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| not_found("task", id))?;
        task.status = TaskStatus::Running;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid, result: &serde_json::Value) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| not_found("task", id))?;
        task.status = TaskStatus::Completed;
        task.result = Some(result.clone());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| not_found("task", id))?;
        task.status = TaskStatus::Failed;
        task.error = Some(reason.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create(&self, job: &ScanJob) -> Result<(), DatabaseError> {
        self.scans.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScanJob>, DatabaseError> {
        Ok(self.scans.read().await.get(&id).cloned())
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut scans = self.scans.write().await;
        let job = scans.get_mut(&id).ok_or_else(|| not_found("scan_job", id))?;
        job.status = ScanStatus::Running;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        raw_output: &str,
        summary: &ScanSummary,
        risk_score: u8,
    ) -> Result<(), DatabaseError> {
        let mut scans = self.scans.write().await;
        let job = scans.get_mut(&id).ok_or_else(|| not_found("scan_job", id))?;
        job.status = ScanStatus::Completed;
        job.raw_output = Some(raw_output.to_string());
        job.summary = Some(summary.clone());
        job.risk_score = Some(risk_score);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        let mut scans = self.scans.write().await;
        let job = scans.get_mut(&id).ok_or_else(|| not_found("scan_job", id))?;
        job.status = ScanStatus::Failed;
        job.error = Some(reason.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn count_recent_for_target(
        &self,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        Ok(self
            .scans
            .read()
            .await
            .values()
            .filter(|j| j.target == target && j.created_at >= since)
            .count() as u64)
    }

    async fn recent_for_target(&self, target: &str, limit: usize) -> Result<Vec<ScanJob>, DatabaseError> {
        let mut jobs: Vec<ScanJob> = self
            .scans
            .read()
            .await
            .values()
            .filter(|j| j.target == target)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn latest_of_kind(
        &self,
        target: &str,
        kind: ScanKind,
        since: DateTime<Utc>,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        Ok(self
            .scans
            .read()
            .await
            .values()
            .filter(|j| j.target == target && j.kind == kind && j.created_at >= since)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn latest_completed_of_kind(
        &self,
        target: &str,
        kind: ScanKind,
        since: DateTime<Utc>,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        Ok(self
            .scans
            .read()
            .await
            .values()
            .filter(|j| {
                j.target == target
                    && j.kind == kind
                    && j.status == ScanStatus::Completed
                    && j.created_at >= since
            })
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<ScanJob>, DatabaseError> {
        let mut jobs: Vec<ScanJob> = self
            .scans
            .read()
            .await
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
