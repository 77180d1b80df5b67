//! Static agent registry: ownership rules and concurrency ceilings.
//!
//! Steps are classified by an ordered list of `(rule, agent)` pairs. The first
//! matching rule wins; a step matching none belongs to the baseline agent.

use serde::Serialize;

use crate::error::RegistryError;
use crate::plan::{LegacyAction, Step};
use crate::scan::ScanKind;

pub const RECON_AGENT: &str = "recon";
pub const VULN_AGENT: &str = "vuln";
pub const VALIDATION_AGENT: &str = "validation";
pub const REPORTING_AGENT: &str = "reporting";

/// A named ownership and concurrency domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub description: String,
    /// Maximum steps of this agent in `running` or `waiting` per task.
    pub concurrency_limit: usize,
}

impl Agent {
    pub fn new(id: impl Into<String>, description: impl Into<String>, concurrency_limit: usize) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            concurrency_limit,
        }
    }
}

/// Step classification predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipRule {
    /// Tool-bearing steps whose tool id is listed.
    Tools(Vec<String>),
    /// Legacy steps whose action is listed.
    Actions(Vec<LegacyAction>),
    /// Legacy `run_scan` steps whose `args.type` is one of these kinds.
    ScanKinds(Vec<ScanKind>),
    /// Everything.
    Any,
}

impl OwnershipRule {
    pub fn tools(ids: &[&str]) -> Self {
        Self::Tools(ids.iter().map(|s| s.to_string()).collect())
    }

    pub fn matches(&self, step: &Step) -> bool {
        match self {
            Self::Tools(ids) => step.tool.as_ref().is_some_and(|t| ids.contains(t)),
            Self::Actions(actions) => step.action.is_some_and(|a| actions.contains(&a)),
            Self::ScanKinds(kinds) => {
                step.action == Some(LegacyAction::RunScan)
                    && step
                        .args
                        .get("type")
                        .and_then(|v| v.as_str())
                        .and_then(ScanKind::parse)
                        .is_some_and(|k| kinds.contains(&k))
            }
            Self::Any => true,
        }
    }
}

/// One row of the agent manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifestEntry {
    pub agent_id: String,
    pub description: String,
    pub concurrency_limit: usize,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
    rules: Vec<(OwnershipRule, String)>,
    baseline: String,
}

impl AgentRegistry {
    /// Empty registry whose unclassified steps go to `baseline`.
    pub fn new(baseline: impl Into<String>) -> Self {
        Self {
            agents: Vec::new(),
            rules: Vec::new(),
            baseline: baseline.into(),
        }
    }

    /// Discovery, vulnerability, validation and reporting agents.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(RECON_AGENT);
        let defaults = [
            Agent::new(RECON_AGENT, "Discovery: port scans and HTTP probes", 3),
            Agent::new(VULN_AGENT, "Vulnerability scanning: nuclei and nikto", 2),
            Agent::new(VALIDATION_AGENT, "Confirms individual findings with targeted probes", 1),
            Agent::new(REPORTING_AGENT, "Summaries and reports over completed scans", 1),
        ];
        for agent in defaults {
            // Ids above are distinct.
            let _ = registry.register(agent);
        }

        registry.add_rule(OwnershipRule::tools(&["port_scan", "http_probe"]), RECON_AGENT);
        registry.add_rule(OwnershipRule::tools(&["vuln_scan", "web_scan"]), VULN_AGENT);
        registry.add_rule(OwnershipRule::tools(&["verify_port"]), VALIDATION_AGENT);
        registry.add_rule(OwnershipRule::tools(&["summarize", "report"]), REPORTING_AGENT);
        registry.add_rule(OwnershipRule::Actions(vec![LegacyAction::Summarize]), REPORTING_AGENT);
        registry.add_rule(
            OwnershipRule::ScanKinds(vec![ScanKind::VulnScan, ScanKind::WebScan]),
            VULN_AGENT,
        );
        registry.add_rule(OwnershipRule::ScanKinds(vec![ScanKind::ServiceProbe]), VALIDATION_AGENT);
        registry
    }

    /// Add an agent. Ids are unique.
    pub fn register(&mut self, agent: Agent) -> Result<(), RegistryError> {
        if self.agents.iter().any(|a| a.id == agent.id) {
            return Err(RegistryError::DuplicateAgent(agent.id));
        }
        self.agents.push(agent);
        Ok(())
    }

    /// Append an ownership rule; earlier rules take priority.
    pub fn add_rule(&mut self, rule: OwnershipRule, agent_id: impl Into<String>) {
        self.rules.push((rule, agent_id.into()));
    }

    /// Replace an agent's concurrency ceiling.
    pub fn with_limit(mut self, agent_id: &str, limit: usize) -> Self {
        if let Some(agent) = self.agents.iter_mut().find(|a| a.id == agent_id) {
            agent.concurrency_limit = limit;
        }
        self
    }

    /// Owning agent of a step.
    pub fn owner_of(&self, step: &Step) -> &str {
        self.rules
            .iter()
            .find(|(rule, _)| rule.matches(step))
            .map(|(_, agent)| agent.as_str())
            .unwrap_or(self.baseline.as_str())
    }

    /// Concurrency ceiling of an agent. Unknown agents get 0.
    pub fn limit_of(&self, agent_id: &str) -> usize {
        self.get(agent_id).map(|a| a.concurrency_limit).unwrap_or(0)
    }

    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn manifest(&self) -> Vec<AgentManifestEntry> {
        self.agents
            .iter()
            .map(|a| AgentManifestEntry {
                agent_id: a.id.clone(),
                description: a.description.clone(),
                concurrency_limit: a.concurrency_limit,
            })
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
