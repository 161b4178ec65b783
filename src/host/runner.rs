//! External process execution
//!
//! Every OS-level side effect goes through a [`CommandRunner`] with a fixed
//! argument vector. Nothing here ever passes text through a shell.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// stdout followed by stderr
    pub output: String,
}

impl CommandOutput {
    /// A successful run with the given output
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            output: output.into(),
        }
    }

    /// A failed run with the given exit code and output
    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            success: false,
            output: output.into(),
        }
    }

    /// Last `max_chars` characters of the combined output
    pub fn tail(&self, max_chars: usize) -> &str {
        tail_chars(&self.output, max_chars)
    }
}

/// Last `max_chars` characters of `s`, on a char boundary
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    match s.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Runs pre-approved argument vectors on the host
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion, failing if it outlives `timeout`
    async fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<CommandOutput>;
}

/// Runs commands as child processes of the agent
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command line");
        };

        debug!("Running {} {:?}", program, args);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child)
                .await
                .map_err(|_| anyhow!("{} timed out after {}s", program, limit.as_secs()))?,
            None => child.await,
        }
        .map_err(|e| anyhow!("failed to spawn {}: {}", program, e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            exit_code: output.status.code(),
            success: output.status.success(),
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_process_runner_captures_both_streams() {
        let out = ProcessRunner
            .run(&argv(&["sh", "-c", "echo out; echo err 1>&2"]), None)
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn test_process_runner_reports_exit_code() {
        let out = ProcessRunner
            .run(&argv(&["sh", "-c", "exit 3"]), None)
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_process_runner_timeout() {
        let result = ProcessRunner
            .run(&argv(&["sleep", "5"]), Some(Duration::from_millis(100)))
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        assert!(ProcessRunner.run(&[], None).await.is_err());
    }
}
