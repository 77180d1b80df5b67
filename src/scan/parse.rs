//! Raw scan output parsing and coarse risk scoring.

use std::sync::LazyLock;

use regex::Regex;

use super::model::{Finding, OpenPort, ScanKind, ScanSummary, Severity};

/// `22/tcp   open  ssh     OpenSSH 8.9p1`
static NMAP_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\d{1,5})/(tcp|udp)\s+open\s+(\S+)(?:[ \t]+(.+?))?\s*$")
        .expect("valid nmap regex")
});

/// `[template-id] [http] [high] https://host/path`
static NUCLEI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\[([^\]]+)\].*?\[(info|low|medium|high|critical|unknown)\]\s*(\S*)")
        .expect("valid nuclei regex")
});

static HTTP_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^HTTP/[\d.]+\s+(\d{3})[^\r\n]*").expect("valid status regex"));

/// Ports whose exposure alone raises the score.
const RISKY_PORTS: &[u16] = &[21, 23, 445, 1433, 3306, 3389, 5432, 5900, 6379, 27017];

/// Nikto lines that are metadata rather than findings.
const NIKTO_META_PREFIXES: &[&str] = &[
    "+ Target",
    "+ Start Time",
    "+ End Time",
    "+ Server:",
    "+ 1 host(s) tested",
    "+ SSL Info",
];

/// Parse raw output into a summary according to the scan kind.
pub fn parse_output(kind: ScanKind, raw: &str) -> ScanSummary {
    match kind {
        ScanKind::PortScan | ScanKind::ServiceProbe => parse_nmap(raw),
        ScanKind::VulnScan => parse_nuclei(raw),
        ScanKind::WebScan => parse_nikto(raw),
        ScanKind::HttpProbe => parse_http_head(raw),
    }
}

fn parse_nmap(raw: &str) -> ScanSummary {
    let open_ports: Vec<OpenPort> = NMAP_PORT_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            Some(OpenPort {
                port: caps[1].parse().ok()?,
                protocol: caps[2].to_string(),
                service: caps[3].to_string(),
                version: caps.get(4).map(|m| m.as_str().trim().to_string()),
            })
        })
        .collect();

    let headline = if open_ports.is_empty() {
        "no open ports found".to_string()
    } else {
        format!(
            "{} open port(s): {}",
            open_ports.len(),
            open_ports
                .iter()
                .map(|p| format!("{}/{} {}", p.port, p.protocol, p.service))
                .collect::<Vec<_>>()
                .join(", ")
        )
    };

    ScanSummary {
        headline,
        open_ports,
        findings: Vec::new(),
    }
}

fn parse_nuclei(raw: &str) -> ScanSummary {
    let findings: Vec<Finding> = NUCLEI_RE
        .captures_iter(raw)
        .map(|caps| Finding {
            severity: Severity::parse(&caps[2]).unwrap_or(Severity::Info),
            title: if caps[3].is_empty() {
                caps[1].to_string()
            } else {
                format!("{} at {}", &caps[1], &caps[3])
            },
        })
        .collect();

    ScanSummary {
        headline: severity_headline(&findings),
        open_ports: Vec::new(),
        findings,
    }
}

fn parse_nikto(raw: &str) -> ScanSummary {
    let findings: Vec<Finding> = raw
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("+ "))
        .filter(|line| !NIKTO_META_PREFIXES.iter().any(|p| line.starts_with(p)))
        .map(|line| Finding {
            severity: if line.contains("OSVDB") || line.contains("CVE-") {
                Severity::Medium
            } else {
                Severity::Low
            },
            title: line.trim_start_matches("+ ").to_string(),
        })
        .collect();

    ScanSummary {
        headline: severity_headline(&findings),
        open_ports: Vec::new(),
        findings,
    }
}

fn parse_http_head(raw: &str) -> ScanSummary {
    let status_line = HTTP_STATUS_RE
        .find(raw)
        .map(|m| m.as_str().trim().to_string());
    let server = raw.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("server")
            .then(|| value.trim().to_string())
    });

    let mut findings = Vec::new();
    if let Some(ref server) = server {
        findings.push(Finding {
            severity: Severity::Info,
            title: format!("server banner: {server}"),
        });
    }

    ScanSummary {
        headline: status_line.unwrap_or_else(|| "no HTTP response".to_string()),
        open_ports: Vec::new(),
        findings,
    }
}

fn severity_headline(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "no findings".to_string();
    }
    let count = |sev: Severity| findings.iter().filter(|f| f.severity == sev).count();
    format!(
        "{} finding(s): {} critical, {} high, {} medium, {} low, {} info",
        findings.len(),
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low),
        count(Severity::Info),
    )
}

/// Coarse 0–100 risk score.
pub fn risk_score(summary: &ScanSummary) -> u8 {
    let severity_base: u32 = match summary.max_severity() {
        Some(Severity::Critical) => 90,
        Some(Severity::High) => 70,
        Some(Severity::Medium) => 45,
        Some(Severity::Low) => 20,
        Some(Severity::Info) => 5,
        None => 0,
    };
    let exposure = (summary.open_ports.len() as u32 * 2).min(20);
    let risky = summary
        .open_ports
        .iter()
        .filter(|p| RISKY_PORTS.contains(&p.port))
        .count() as u32;
    let score = severity_base + exposure + (risky * 10).min(30);
    score.min(100) as u8
}
