//! Scan jobs: model, serial queue, process executor, output parsing and the
//! per-target rate limiter.

pub mod enqueuer;
pub mod executor;
pub mod model;
pub mod parse;
pub mod queue;
pub mod rate_limit;

pub use enqueuer::{RateLimitedEnqueuer, ScanEnqueuer};
pub use executor::{ProcessExecutor, ScanExecutor, ScanOutcome};
pub use model::{
    Finding, OpenPort, ScanJob, ScanKind, ScanRequest, ScanStatus, ScanSummary, Severity,
    validate_target,
};
pub use parse::{parse_output, risk_score};
pub use queue::{INTERRUPTED_BY_RESTART, ScanQueue};
pub use rate_limit::{RateDecision, RateLimiter};
