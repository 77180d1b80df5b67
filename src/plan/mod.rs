//! Plans: the task and step model plus the sanitizer for submitted plans.

pub mod model;
pub mod sanitize;

pub use model::{LegacyAction, Step, StepCounts, StepStatus, Task, TaskFilter, TaskStatus};
pub use sanitize::{MAX_PLAN_STEPS, plan_to_json, sanitize_plan};
