//! Tick-based task scheduler.

pub mod legacy;
pub mod processor;
pub mod service;
pub mod state;

pub use processor::{TaskProcessor, TickReport};
pub use service::{RecoveryReport, Scheduler, SchedulerDeps, SchedulerStatus};
pub use state::{SchedulerState, SchedulingMode, TransitionBudget};
