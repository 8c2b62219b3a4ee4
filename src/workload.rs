//! The command run under the service.
//!
//! The child's stdout and stderr are captured and logged line by line. A
//! shutdown notification kills the child.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Program run when no command is given.
#[cfg(windows)]
pub const DEFAULT_PROGRAM: &str = "cmd";
#[cfg(not(windows))]
pub const DEFAULT_PROGRAM: &str = "sh";

/// Receives each captured output line along with its stream name.
pub type LineSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// How the workload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadExit {
    /// The process exited by itself
    Exited(Option<i32>),
    /// The process was killed on shutdown
    Killed,
}

impl WorkloadExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkloadExit::Exited(Some(0)) | WorkloadExit::Killed)
    }
}

/// A command line to execute.
#[derive(Clone)]
pub struct Workload {
    program: String,
    args: Vec<String>,
    sink: Option<LineSink>,
}

impl Workload {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            sink: None,
        }
    }

    /// Build from a trailing command line; an empty one runs [`DEFAULT_PROGRAM`].
    pub fn from_command_line(command: &[String]) -> Self {
        match command.split_first() {
            Some((program, args)) => Self::new(program.clone(), args.to_vec()),
            None => Self::new(DEFAULT_PROGRAM, Vec::new()),
        }
    }

    /// Also forward every output line to `sink`.
    pub fn with_sink(mut self, sink: LineSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Run the command to completion, or until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<WorkloadExit> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        info!(program = %self.program, pid = ?child.id(), "Workload started");

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.forward(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.forward(stderr, "stderr"));
        }

        let exit = tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for workload")?;
                WorkloadExit::Exited(status.code())
            }
            _ = shutdown.notified() => {
                debug!(program = %self.program, "Shutdown requested, killing workload");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill workload");
                }
                WorkloadExit::Killed
            }
        };

        for reader in readers {
            let _ = reader.await;
        }

        info!(program = %self.program, exit = ?exit, "Workload finished");
        Ok(exit)
    }

    fn forward<R>(&self, stream: R, name: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let program = self.program.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        info!(program = %program, stream = name, "{}", line);
                        if let Some(sink) = &sink {
                            sink(name, &line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(stream = name, error = %e, "Failed to read workload output");
                        break;
                    }
                }
            }
        })
    }
}
