//! Scan job types.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Hostnames, IPv4/IPv6 literals, CIDR ranges and bare URLs.
static TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-:/\[\]_]{0,252}$").expect("valid target regex")
});

/// External tool a scan job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Fast TCP port discovery (nmap).
    PortScan,
    /// Version detection on specific ports (nmap -sV).
    ServiceProbe,
    /// Template-based vulnerability scan (nuclei).
    VulnScan,
    /// Web server scan (nikto).
    WebScan,
    /// HTTP HEAD request (curl).
    HttpProbe,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortScan => "port_scan",
            Self::ServiceProbe => "service_probe",
            Self::VulnScan => "vuln_scan",
            Self::WebScan => "web_scan",
            Self::HttpProbe => "http_probe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "port_scan" | "nmap" => Some(Self::PortScan),
            "service_probe" => Some(Self::ServiceProbe),
            "vuln_scan" | "nuclei" => Some(Self::VulnScan),
            "web_scan" | "nikto" => Some(Self::WebScan),
            "http_probe" => Some(Self::HttpProbe),
            _ => None,
        }
    }

    /// Discovery scans may trigger a follow-up probe.
    pub fn is_discovery(&self) -> bool {
        matches!(self, Self::PortScan)
    }

    /// Argument vector for the external process. `target` must be validated.
    pub fn argv(&self, target: &str, ports: &[u16]) -> Vec<String> {
        let mut argv: Vec<String> = match self {
            Self::PortScan => vec!["nmap", "-Pn", "-T4", "-F"],
            Self::ServiceProbe => vec!["nmap", "-Pn", "-sV"],
            Self::VulnScan => vec!["nuclei", "-silent", "-nc", "-u"],
            Self::WebScan => vec!["nikto", "-nointeractive", "-h"],
            Self::HttpProbe => vec!["curl", "-sS", "-I", "--max-time", "15"],
        }
        .into_iter()
        .map(String::from)
        .collect();

        match self {
            Self::ServiceProbe if !ports.is_empty() => {
                argv.push("-p".into());
                argv.push(
                    ports
                        .iter()
                        .map(u16::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                );
            }
            Self::ServiceProbe => {
                argv.push("--top-ports".into());
                argv.push("20".into());
            }
            _ => {}
        }

        if *self == Self::HttpProbe && !target.contains("://") {
            argv.push(format!("http://{target}"));
        } else {
            argv.push(target.to_string());
        }
        argv
    }
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject targets that could be read as flags or shell syntax.
pub fn validate_target(target: &str) -> Result<&str, ValidationError> {
    let trimmed = target.trim();
    if TARGET_RE.is_match(trimmed) {
        Ok(trimmed)
    } else {
        Err(ValidationError::InvalidTarget {
            target: target.chars().take(100).collect(),
        })
    }
}

/// Status of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "informational" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub title: String,
}

/// Structured result parsed from a scan's raw output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// One-line description.
    pub headline: String,
    #[serde(default)]
    pub open_ports: Vec<OpenPort>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ScanSummary {
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// What a tool or legacy step asks the queue to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub kind: ScanKind,
    pub target: String,
    pub owner: String,
    /// Ports for a targeted probe; ignored by other kinds.
    pub ports: Vec<u16>,
    /// Job that triggered this one, for automatic follow-ups.
    pub parent_id: Option<Uuid>,
}

impl ScanRequest {
    pub fn new(kind: ScanKind, target: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            owner: owner.into(),
            ports: Vec::new(),
            parent_id: None,
        }
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }
}

/// An asynchronous external-tool invocation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub id: Uuid,
    pub kind: ScanKind,
    pub target: String,
    /// Space-joined argv, for display and auditing.
    pub command: String,
    pub owner: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub status: ScanStatus,
    #[serde(default)]
    pub summary: Option<ScanSummary>,
    #[serde(default, skip_serializing)]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub risk_score: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    /// Build a queued job from a request, validating the target.
    pub fn from_request(request: ScanRequest) -> Result<Self, ValidationError> {
        let target = validate_target(&request.target)?.to_string();
        let command = request.kind.argv(&target, &request.ports).join(" ");
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            kind: request.kind,
            target,
            command,
            owner: request.owner,
            parent_id: request.parent_id,
            status: ScanStatus::Queued,
            summary: None,
            raw_output: None,
            risk_score: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Argument vector to spawn.
    pub fn argv(&self) -> Vec<String> {
        self.command.split_whitespace().map(String::from).collect()
    }
}
