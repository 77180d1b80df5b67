//! Scan-producing tools. Each one queues a job and leaves the step waiting.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{ToolError, ValidationError};
use crate::scan::{ScanKind, ScanRequest};
use crate::tools::tool::{ArgKind, ArgSpec, Tool, ToolContext, ToolOutcome, require_str};

const TARGET_ARGS: &[ArgSpec] = &[ArgSpec::required(
    "target",
    ArgKind::String,
    "Hostname, IP address or CIDR range to scan",
)];

/// Queues one scan kind against `args.target`.
pub struct ScanTool {
    id: &'static str,
    kind: ScanKind,
    description: &'static str,
}

impl ScanTool {
    pub fn port_scan() -> Self {
        Self {
            id: "port_scan",
            kind: ScanKind::PortScan,
            description: "Discover open TCP ports on a target (nmap fast scan). \
                          Open ports trigger an automatic service probe.",
        }
    }

    pub fn http_probe() -> Self {
        Self {
            id: "http_probe",
            kind: ScanKind::HttpProbe,
            description: "Send an HTTP HEAD request and record the status line and server banner.",
        }
    }

    pub fn vuln_scan() -> Self {
        Self {
            id: "vuln_scan",
            kind: ScanKind::VulnScan,
            description: "Run template-based vulnerability checks against a target (nuclei).",
        }
    }

    pub fn web_scan() -> Self {
        Self {
            id: "web_scan",
            kind: ScanKind::WebScan,
            description: "Scan a web server for misconfigurations and known issues (nikto).",
        }
    }
}

#[async_trait]
impl Tool for ScanTool {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        self.description
    }

    fn args(&self) -> &[ArgSpec] {
        TARGET_ARGS
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
        let target = require_str(self.id, args, "target")?;
        let job = ctx
            .scans
            .enqueue_scan(ScanRequest::new(self.kind, target, ctx.owner))
            .await?;
        Ok(ToolOutcome::Enqueued(job.id))
    }
}

const VERIFY_ARGS: &[ArgSpec] = &[
    ArgSpec::required("target", ArgKind::String, "Host the port belongs to"),
    ArgSpec::required("port", ArgKind::Integer, "Port to confirm, 1-65535"),
];

/// Confirms a single reported port with a targeted service probe.
pub struct VerifyPortTool;

#[async_trait]
impl Tool for VerifyPortTool {
    fn id(&self) -> &str {
        "verify_port"
    }

    fn description(&self) -> &str {
        "Confirm that a reported port is open and identify its service version."
    }

    fn args(&self) -> &[ArgSpec] {
        VERIFY_ARGS
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext<'_>) -> Result<ToolOutcome, ToolError> {
        let target = require_str(self.id(), args, "target")?;
        let port = args
            .get("port")
            .and_then(Value::as_u64)
            .filter(|p| (1..=65535).contains(p))
            .ok_or_else(|| ValidationError::WrongType {
                tool: self.id().to_string(),
                arg: "port".to_string(),
                expected: "port number 1-65535".to_string(),
            })? as u16;

        let job = ctx
            .scans
            .enqueue_scan(ScanRequest::new(ScanKind::ServiceProbe, target, ctx.owner).with_ports(vec![port]))
            .await?;
        Ok(ToolOutcome::Enqueued(job.id))
    }
}
