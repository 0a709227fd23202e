//! External scraper invocation
//!
//! The scraper is an opaque program: it receives the task URL as its last
//! argument (plus `SCRAPER_TASK_*` environment variables) and writes the raw
//! batch to stdout, either JSON or text with embedded JSON blocks.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

use crate::models::Task;

/// Characters of stderr kept in failure messages
const STDERR_EXCERPT: usize = 500;

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("scraper command is empty")]
    EmptyCommand,

    #[error("scraper binary not found: {0}")]
    NotFound(String),

    #[error("failed to start scraper: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("scraper timed out after {0}s")]
    Timeout(u64),

    #[error("scraper exited with {code}: {stderr}")]
    Failed { code: String, stderr: String },

    #[error("scraper produced no output")]
    EmptyOutput,
}

impl ScraperError {
    /// Faults of this host rather than of the task; the worker enters ERROR
    pub fn is_local_fault(&self) -> bool {
        match self {
            Self::EmptyCommand | Self::NotFound(_) => true,
            Self::Spawn(e) => e.kind() == ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

/// Captured scraper run
#[derive(Debug, Clone)]
pub struct ScraperOutput {
    pub stdout: String,
    pub elapsed: Duration,
}

impl ScraperOutput {
    /// Raw batch for submission: parsed JSON when stdout is JSON, else text
    pub fn into_raw(self) -> Value {
        serde_json::from_str(self.stdout.trim()).unwrap_or(Value::String(self.stdout))
    }
}

/// A parsed `SCRAPER_COMMAND` with its timeout
#[derive(Debug, Clone)]
pub struct ScraperCommand {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ScraperCommand {
    /// Split on whitespace; the first word is the program
    pub fn parse(command: &str, timeout: Option<Duration>) -> Result<Self, ScraperError> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next().ok_or(ScraperError::EmptyCommand)?;
        Ok(Self {
            program,
            args: words.collect(),
            timeout,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the scraper for a task, killing it when the timeout expires
    pub async fn run(&self, task: &Task) -> Result<ScraperOutput, ScraperError> {
        let started = Instant::now();

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(&task.url)
            .env("SCRAPER_TASK_ID", task.id.to_string())
            .env("SCRAPER_TASK_URL", &task.url)
            .env("SCRAPER_TASK_KIND", task.kind.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ScraperError::NotFound(self.program.clone()),
                _ => ScraperError::Spawn(e),
            })?;

        let output = match self.timeout {
            // Dropping the wait future drops the child, which kills it
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ScraperError::Timeout(limit.as_secs()))?,
            None => child.wait_with_output().await,
        }
        .map_err(ScraperError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(ScraperError::Failed {
                code: output
                    .status
                    .code()
                    .map(|c| format!("status {c}"))
                    .unwrap_or_else(|| "signal".to_string()),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Err(ScraperError::EmptyOutput);
        }

        Ok(ScraperOutput {
            stdout,
            elapsed: started.elapsed(),
        })
    }
}
