//! Per-target sliding-window rate limiter.
//!
//! The window is derived from the scan store itself, so jobs created by any
//! path (tools, legacy steps, automatic follow-ups) count toward it.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::RateLimitConfig;
use crate::error::{DatabaseError, RateLimitError};
use crate::store::ScanStore;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Jobs for the target inside the window.
    pub recent: u64,
    /// Effective ceiling. `<= 0` means unlimited.
    pub limit: i64,
}

impl RateDecision {
    /// Convert a refusal into the error recorded on the step.
    pub fn into_result(self, target: &str) -> Result<Self, RateLimitError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitError {
                target: target.to_string(),
                recent: self.recent,
                limit: self.limit,
            })
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn ScanStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn ScanStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Effective limit for a target: override first, then the global default.
    pub fn limit_for(&self, target: &str) -> i64 {
        self.config
            .overrides
            .get(target)
            .copied()
            .unwrap_or(self.config.default_limit)
    }

    /// Count recent jobs for `target` and decide whether another may start.
    pub async fn check(&self, target: &str) -> Result<RateDecision, DatabaseError> {
        let limit = self.limit_for(target);
        let recent = self
            .store
            .count_recent_for_target(target, self.window_start())
            .await?;
        let allowed = limit <= 0 || recent < limit as u64;

        if !allowed {
            tracing::debug!(target = %target, recent, limit, "Rate limit reached");
        }
        Ok(RateDecision {
            allowed,
            recent,
            limit,
        })
    }

    /// Start of the sliding window ending now.
    pub fn window_start(&self) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.config.window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
