//! Agents: step ownership, concurrency ceilings and runnable-set selection.

pub mod orchestrator;
pub mod registry;

pub use orchestrator::Orchestrator;
pub use registry::{
    Agent, AgentManifestEntry, AgentRegistry, OwnershipRule, RECON_AGENT, REPORTING_AGENT,
    VALIDATION_AGENT, VULN_AGENT,
};
