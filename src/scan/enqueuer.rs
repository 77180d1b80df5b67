//! The scan-producing surface handed to tools and legacy steps.

use std::sync::Arc;

use async_trait::async_trait;

use super::model::{ScanJob, ScanKind, ScanRequest, validate_target};
use super::queue::ScanQueue;
use super::rate_limit::RateLimiter;
use crate::error::ToolError;
use crate::store::ScanStore;

/// Enqueue scans on behalf of a step and read back recent results.
#[async_trait]
pub trait ScanEnqueuer: Send + Sync {
    /// Rate-check the target, then queue the scan.
    async fn enqueue_scan(&self, request: ScanRequest) -> Result<ScanJob, ToolError>;

    /// Most recent jobs for a target, newest first.
    async fn recent_scans(&self, target: &str, limit: usize) -> Result<Vec<ScanJob>, ToolError>;

    /// A completed job of `kind` for `target` fresh enough to stand in for a
    /// new scan.
    async fn reusable_scan(&self, target: &str, kind: ScanKind) -> Result<Option<ScanJob>, ToolError>;
}

/// [`ScanEnqueuer`] backed by the serial queue and the sliding-window limiter.
pub struct RateLimitedEnqueuer {
    queue: Arc<ScanQueue>,
    limiter: Arc<RateLimiter>,
    scans: Arc<dyn ScanStore>,
}

impl RateLimitedEnqueuer {
    pub fn new(queue: Arc<ScanQueue>, limiter: Arc<RateLimiter>, scans: Arc<dyn ScanStore>) -> Self {
        Self {
            queue,
            limiter,
            scans,
        }
    }
}

#[async_trait]
impl ScanEnqueuer for RateLimitedEnqueuer {
    async fn enqueue_scan(&self, request: ScanRequest) -> Result<ScanJob, ToolError> {
        let target = validate_target(&request.target)?;
        self.limiter.check(target).await?.into_result(target)?;
        Ok(self.queue.enqueue(request).await?)
    }

    async fn recent_scans(&self, target: &str, limit: usize) -> Result<Vec<ScanJob>, ToolError> {
        let target = validate_target(target)?;
        Ok(self.scans.recent_for_target(target, limit).await?)
    }

    /// Only jobs inside the rate-limit window count as fresh.
    async fn reusable_scan(&self, target: &str, kind: ScanKind) -> Result<Option<ScanJob>, ToolError> {
        let target = validate_target(target)?;
        Ok(self
            .scans
            .latest_completed_of_kind(target, kind, self.limiter.window_start())
            .await?)
    }
}
