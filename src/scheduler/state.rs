//! Scheduling mode and per-task transition budget.

use serde::{Deserialize, Serialize};

/// How ticks are driven and how far a task may advance per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Interval-driven loop, unbounded advancement per tick.
    FreeRunning,
    /// Manually ticked, one step advanced per task per tick.
    Deterministic,
}

/// Scheduler flags passed into every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub mode: SchedulingMode,
    /// The free-running loop skips ticks while set. Manual ticks still run.
    pub paused: bool,
}

impl SchedulerState {
    pub fn new(mode: SchedulingMode) -> Self {
        Self {
            mode,
            paused: false,
        }
    }

    pub fn free_running() -> Self {
        Self::new(SchedulingMode::FreeRunning)
    }

    pub fn deterministic() -> Self {
        Self::new(SchedulingMode::Deterministic)
    }

    /// Whether the interval loop should run a tick.
    pub fn loop_should_tick(&self) -> bool {
        !self.paused && self.mode == SchedulingMode::FreeRunning
    }
}

/// Steps one task may still advance during the current tick.
///
/// A reconciled waiting step or an executed pending step spends one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBudget {
    remaining: Option<usize>,
}

impl TransitionBudget {
    /// Deterministic: `max(1, override)`. Free-running: the override when it
    /// is at least 1, otherwise unbounded.
    pub fn for_mode(mode: SchedulingMode, override_cap: Option<i64>) -> Self {
        let cap = override_cap.filter(|&n| n >= 1).map(|n| n as usize);
        let remaining = match mode {
            SchedulingMode::Deterministic => Some(cap.unwrap_or(1)),
            SchedulingMode::FreeRunning => cap,
        };
        Self { remaining }
    }

    pub fn unbounded() -> Self {
        Self { remaining: None }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Take one unit. Returns `false` when nothing is left.
    pub fn try_spend(&mut self) -> bool {
        match self.remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}
