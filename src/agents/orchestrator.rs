//! Dependency-aware, concurrency-bounded step selection.
//!
//! Per-agent counters are derived from the plan snapshot on every call and
//! never stored.

use std::collections::HashMap;
use std::sync::Arc;

use super::registry::AgentRegistry;
use crate::plan::{Step, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

#[derive(Clone)]
pub struct Orchestrator {
    agents: Arc<AgentRegistry>,
}

impl Orchestrator {
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Tag every step with its owning agent.
    pub fn assign_agents(&self, plan: &mut [Step]) {
        for step in plan.iter_mut() {
            step.agent = Some(self.agents.owner_of(step).to_string());
        }
    }

    /// Every dependency of `step` is `done`. Unknown indexes never are.
    pub fn dependencies_met(&self, step: &Step, plan: &[Step]) -> bool {
        step.depends_on
            .iter()
            .all(|&d| plan.get(d).is_some_and(|dep| dep.status == StepStatus::Done))
    }

    /// Pending steps whose every dependency is `done`, in index order.
    pub fn runnable(&self, plan: &[Step]) -> Vec<usize> {
        plan.iter()
            .filter(|s| s.status == StepStatus::Pending && self.dependencies_met(s, plan))
            .map(|s| s.index)
            .collect()
    }

    /// Steps of `agent` currently running or waiting.
    pub fn in_flight(&self, plan: &[Step], agent: &str) -> usize {
        plan.iter()
            .filter(|s| s.status.is_in_flight() && s.agent.as_deref() == Some(agent))
            .count()
    }

    /// Whether the step's agent has room for one more in-flight step.
    pub fn can_run(&self, step: &Step, plan: &[Step]) -> bool {
        let Some(agent) = step.agent.as_deref() else {
            return false;
        };
        self.in_flight(plan, agent) < self.agents.limit_of(agent)
    }

    /// Runnable steps admitted under each agent's ceiling, in index order.
    ///
    /// Steps admitted earlier in the same selection count toward the ceiling.
    pub fn select(&self, plan: &[Step]) -> Vec<usize> {
        let mut admitted: HashMap<&str, usize> = HashMap::new();
        let mut selected = Vec::new();

        for index in self.runnable(plan) {
            let step = &plan[index];
            let Some(agent) = step.agent.as_deref() else {
                continue;
            };
            let used = self.in_flight(plan, agent) + admitted.get(agent).copied().unwrap_or(0);
            if used < self.agents.limit_of(agent) {
                *admitted.entry(agent).or_default() += 1;
                selected.push(index);
            }
        }
        selected
    }

    /// Secondary selection for rows persisted before agent tagging.
    ///
    /// Pending steps with no agent and no dependencies, in index order, with
    /// no concurrency gating. Weaker ordering than [`Orchestrator::select`].
    pub fn legacy_candidates(&self, plan: &[Step]) -> Vec<usize> {
        plan.iter()
            .filter(|s| s.status == StepStatus::Pending && s.agent.is_none() && s.depends_on.is_empty())
            .map(|s| s.index)
            .collect()
    }

    /// First dependency cycle found, as a path ending where it started.
    pub fn find_cycle(&self, plan: &[Step]) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; plan.len()];
        let mut path = Vec::new();
        for start in 0..plan.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = visit(plan, start, &mut marks, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }
}

fn visit(plan: &[Step], node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
    marks[node] = Mark::Visiting;
    path.push(node);

    for &dep in &plan[node].depends_on {
        if dep >= plan.len() {
            continue;
        }
        match marks[dep] {
            Mark::Unvisited => {
                if let Some(cycle) = visit(plan, dep, marks, path) {
                    return Some(cycle);
                }
            }
            Mark::Visiting => {
                let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
            Mark::Done => {}
        }
    }

    path.pop();
    marks[node] = Mark::Done;
    None
}
