//! Test execution adapter.
//!
//! Shells out to a configurable test command, enforces a caller-supplied
//! timeout, and reaps the child on expiry. The summary line is parsed into
//! a structured report.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{ApexError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestReport {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub duration_s: f64,
    pub timed_out: bool,
}

impl TestReport {
    pub fn pass_rate(&self) -> f64 {
        let total = self.passed + self.failed + self.errors;
        if total == 0 {
            0.0
        } else {
            f64::from(self.passed) / f64::from(total)
        }
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the suite (optionally a selection) under `timeout`.
    async fn run(&self, selection: &[String], timeout: Duration) -> Result<TestReport>;
}

/// Runner that shells out to a test command (e.g. `pytest -q` or
/// `cargo test`) in a working directory.
pub struct CommandTestRunner {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandTestRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: workdir.into(),
        }
    }

    /// Parse a `2 passed, 1 failed, 3 errors in 0.12s` style summary out of
    /// the final output lines.
    fn parse_summary(stdout: &str, fallback_duration: f64) -> TestReport {
        let count = |label: &str| -> u32 {
            let pattern = Regex::new(&format!(r"(\d+)\s+{}\b", label)).expect("static regex");
            stdout
                .lines()
                .rev()
                .find_map(|line| pattern.captures(line))
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or(0)
        };

        let duration = Regex::new(r"in\s+([0-9.]+)s")
            .expect("static regex")
            .captures_iter(stdout)
            .last()
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(fallback_duration);

        TestReport {
            passed: count("passed"),
            failed: count("failed"),
            errors: count("errors?"),
            duration_s: duration,
            timed_out: false,
        }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, selection: &[String], timeout: Duration) -> Result<TestReport> {
        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(selection)
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ApexError::TestRunner(format!("spawn {}: {}", self.program, e)))?;

        let stdout = child.stdout.take();

        let output = tokio::time::timeout(timeout, async {
            let mut buf = String::new();
            if let Some(mut stdout) = stdout {
                use tokio::io::AsyncReadExt;
                stdout.read_to_string(&mut buf).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((buf, status))
        })
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        match output {
            Ok(Ok((stdout, _status))) => Ok(Self::parse_summary(&stdout, elapsed)),
            Ok(Err(e)) => Err(ApexError::TestRunner(e.to_string())),
            Err(_) => {
                // Deadline hit: kill and reap so no orphan survives.
                warn!(program = %self.program, "test run timed out; killing child");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed-out test child");
                }
                Ok(TestReport {
                    duration_s: elapsed,
                    timed_out: true,
                    ..TestReport::default()
                })
            }
        }
    }
}
