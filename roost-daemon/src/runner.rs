//! Command runner - executes external commands to completion or streams
//! their output line-by-line.
//!
//! Every other provisioning component builds on this. A command that
//! cannot be started at all (binary not on PATH) is a different failure
//! kind from one that ran and exited non-zero; the latter is not an error
//! here but a `RunOutput` with `success == false` and a captured stderr
//! tail for diagnostics.

use async_trait::async_trait;
use roost_core::LogStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::defaults::STDERR_TAIL_LINES;

/// Errors that can occur before a command produces an exit status
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A command line plus its environment overlay.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables layered over the daemon's own environment
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// One-line rendering for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Result of running a command to completion
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// Last lines of stderr, bounded for error reporting
    pub stderr_tail: String,
}

impl RunOutput {
    /// Diagnostic message for a failed run: exit code plus the stderr tail.
    pub fn failure_detail(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        if self.stderr_tail.is_empty() {
            format!("exit code {code}")
        } else {
            format!("exit code {code}: {}", self.stderr_tail)
        }
    }
}

/// One line of live output from a streaming run
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: LogStream,
    pub text: String,
}

/// Executes external commands.
///
/// Seam for tests: provisioning components hold a `dyn CommandRunner` so
/// unit tests can substitute recording fakes for real process spawns.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output (bounded operations such as
    /// version checks).
    async fn run(&self, spec: &CommandSpec) -> Result<RunOutput, RunnerError>;

    /// Run while forwarding each output line as it is produced (unbounded
    /// operations such as package installs, which may take minutes and
    /// must show progress rather than appear hung).
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<RunOutput, RunnerError>;
}

/// Real implementation over `tokio::process`.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<RunOutput, RunnerError> {
        tracing::debug!(command = %spec.display(), "Running command");

        let output = spec
            .build()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| map_spawn_error(&spec.program, e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(RunOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr_tail: tail_lines(&stderr, STDERR_TAIL_LINES),
        })
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<RunOutput, RunnerError> {
        tracing::debug!(command = %spec.display(), "Running command (streaming)");

        let mut child = spec
            .build()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| map_spawn_error(&spec.program, e))?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, LogStream::Stdout, lines.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, LogStream::Stderr, lines.clone())));

        let status = child.wait().await.map_err(|e| RunnerError::Io {
            program: spec.program.clone(),
            source: e,
        })?;

        let mut stdout = String::new();
        if let Some(task) = stdout_task
            && let Ok(collected) = task.await
        {
            stdout = collected.join("\n");
        }
        let mut stderr_lines = Vec::new();
        if let Some(task) = stderr_task
            && let Ok(collected) = task.await
        {
            stderr_lines = collected;
        }

        let keep = stderr_lines.len().saturating_sub(STDERR_TAIL_LINES);
        Ok(RunOutput {
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr_tail: stderr_lines[keep..].join("\n"),
        })
    }
}

/// Forward lines to the sender as they arrive, returning everything read.
async fn forward_lines<R>(
    reader: R,
    stream: LogStream,
    lines: mpsc::Sender<OutputLine>,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        let _ = lines
            .send(OutputLine {
                stream,
                text: line.clone(),
            })
            .await;
        collected.push(line);
    }
    collected
}

fn map_spawn_error(program: &str, e: std::io::Error) -> RunnerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RunnerError::NotFound(program.to_string())
    } else {
        RunnerError::Io {
            program: program.to_string(),
            source: e,
        }
    }
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let keep = lines.len().saturating_sub(max_lines);
    lines[keep..].join("\n").trim().to_string()
}
