//! Scan Orchestrator: a tick-based, multi-agent scheduler for security-scan plans.

pub mod agents;
pub mod api;
pub mod config;
pub mod error;
pub mod plan;
pub mod scan;
pub mod scheduler;
pub mod store;
pub mod tools;
