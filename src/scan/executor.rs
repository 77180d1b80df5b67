//! Scan executors: the pluggable "run this job" seam of the queue.
//!
//! The default [`ProcessExecutor`] spawns the job's argv directly (no shell),
//! caps captured output, and kills the process when the timeout expires.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::model::{ScanJob, ScanKind, ScanSummary};
use super::parse::{parse_output, risk_score};
use crate::error::ScanError;

/// Result of a successfully executed scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub raw_output: String,
    pub summary: ScanSummary,
    pub risk_score: u8,
}

impl ScanOutcome {
    /// Parse raw output for `kind` and score it.
    pub fn from_output(kind: ScanKind, raw_output: impl Into<String>) -> Self {
        let raw_output = raw_output.into();
        let summary = parse_output(kind, &raw_output);
        let risk_score = risk_score(&summary);
        Self {
            raw_output,
            summary,
            risk_score,
        }
    }
}

/// Runs one scan job to completion.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    async fn execute(&self, job: &ScanJob) -> Result<ScanOutcome, ScanError>;
}

/// Spawns the external scanner process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessExecutor {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }

    async fn run(&self, argv: &[String]) -> Result<String, ScanError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ScanError::Spawn {
                program: String::new(),
                reason: "empty command".to_string(),
            });
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.max_output_bytes;

        let io = async {
            let (out, err) = tokio::join!(read_capped(stdout, cap), read_capped(stderr, cap));
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out?, err?))
        };
        let result = tokio::time::timeout(self.timeout, io).await;

        match result {
            Ok(Ok((status, (stdout, out_truncated), (stderr, _)))) => {
                let stdout = String::from_utf8_lossy(&stdout).to_string();
                let stderr = String::from_utf8_lossy(&stderr).to_string();
                if !status.success() {
                    return Err(ScanError::ExitStatus {
                        program: program.clone(),
                        code: status.code().unwrap_or(-1),
                        stderr: stderr.chars().take(500).collect(),
                    });
                }
                if out_truncated {
                    tracing::debug!(program = %program, cap, "Scan output truncated");
                    Ok(format!("{stdout}\n... [output truncated at {cap} bytes]"))
                } else {
                    Ok(stdout)
                }
            }
            Ok(Err(e)) => Err(ScanError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(ScanError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl ScanExecutor for ProcessExecutor {
    async fn execute(&self, job: &ScanJob) -> Result<ScanOutcome, ScanError> {
        let raw = self.run(&job.argv()).await?;
        Ok(ScanOutcome::from_output(job.kind, raw))
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes. Returns whether bytes
/// were discarded.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };

    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((buf, truncated))
}
