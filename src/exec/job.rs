//! Thin handles around one external-tool invocation.
//!
//! A [`JobSpec`] describes the command and its output sinks; spawning it
//! yields a [`ProcessJob`] that the pool polls without blocking. Single
//! linear steps that do not go through the pool use [`run_checked`], the
//! spawn-and-wait equivalent with the same exit-code contract.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

/// Specification of one external-process invocation.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Redirect stdout to this file; inherited when `None`.
    pub stdout: Option<PathBuf>,
    /// Redirect stderr to this file; inherited when `None`.
    pub stderr: Option<PathBuf>,
    /// Queue position within the batch, used to order merged outputs.
    pub index: usize,
}

impl JobSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stdout: None,
            stderr: None,
            index: 0,
        }
    }

    pub fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout = Some(path);
        self
    }

    pub fn stderr_to(mut self, path: PathBuf) -> Self {
        self.stderr = Some(path);
        self
    }

    pub fn at_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Render the command for logs and error reports.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Spawn the process with its sinks attached.
    pub fn spawn(self) -> Result<ProcessJob> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(path) = &self.stdout {
            let sink = File::create(path)
                .with_context(|| format!("failed to create output sink {}", path.display()))?;
            command.stdout(Stdio::from(sink));
        }
        if let Some(path) = &self.stderr {
            let sink = File::create(path)
                .with_context(|| format!("failed to create error sink {}", path.display()))?;
            command.stderr(Stdio::from(sink));
        }
        let child = command
            .spawn()
            .with_context(|| format!("failed to launch `{}`", self.command_line()))?;
        Ok(ProcessJob { spec: self, child })
    }
}

/// A spawned external process tied to its spec.
#[derive(Debug)]
pub struct ProcessJob {
    spec: JobSpec,
    child: Child,
}

impl ProcessJob {
    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Non-blocking termination check: `Some(status)` once the process has
    /// exited, `None` while it is still running.
    pub fn poll(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .with_context(|| format!("failed to poll `{}`", self.spec.command_line()))
    }

    /// Kill and reap the process. Errors are ignored: the child may already
    /// have exited by the time the signal lands.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn a job and block until it exits, failing on a non-zero status.
pub fn run_checked(spec: JobSpec) -> Result<()> {
    let line = spec.command_line();
    tracing::debug!("running: {}", line);
    let stderr = spec.stderr.clone();
    let mut job = spec.spawn()?;
    let status = job
        .child
        .wait()
        .with_context(|| format!("failed to wait for `{}`", line))?;
    if !status.success() {
        match stderr {
            Some(path) => bail!(
                "`{}` exited with {} (stderr: {})",
                line,
                status,
                path.display()
            ),
            None => bail!("`{}` exited with {}", line, status),
        }
    }
    Ok(())
}
