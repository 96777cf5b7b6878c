//! Fixed-capacity scheduler for batches of external jobs.
//!
//! The pool keeps up to `capacity` processes in flight, launching pending
//! jobs FIFO as slots open and checking for terminations with a cooperative
//! poll-and-sleep cycle. Completion order is unconstrained; callers that
//! merge job outputs must sort by [`JobSpec::index`], never by finish time.
//!
//! Any non-zero exit is fatal to the batch: no further jobs are launched,
//! every in-flight sibling is killed and reaped, and the failing command is
//! reported with its exit code and captured stderr location. There are no
//! retries; partial output from these tools is not trustworthy.
//!
//! The pool is also externally cancellable: raising its [`cancel
//! flag`](WorkerPool::cancel_flag) makes the next poll cycle kill and reap
//! every in-flight job before returning an error, so an interrupted run
//! leaves no orphaned children behind.

use crate::exec::job::{JobSpec, ProcessJob};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A job in the batch exited with a non-zero status.
#[derive(Debug, Error)]
#[error("job {index} failed: `{command}` exited with code {}{}", code_display(.code), stderr_display(.stderr))]
pub struct JobFailure {
    /// Queue position of the failing job within its batch.
    pub index: usize,
    /// The command line that failed.
    pub command: String,
    /// Exit code, if the process exited normally (None if killed by signal).
    pub code: Option<i32>,
    /// Where the job's stderr was captured, if it was redirected.
    pub stderr: Option<PathBuf>,
}

fn code_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<signal>".to_string(),
    }
}

fn stderr_display(stderr: &Option<PathBuf>) -> String {
    match stderr {
        Some(path) => format!(" (stderr: {})", path.display()),
        None => String::new(),
    }
}

/// Bounded pool of concurrently running external processes.
pub struct WorkerPool {
    capacity: usize,
    poll_interval: Duration,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            poll_interval,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that aborts the running batch when set, typically from a
    /// signal handler.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run every job to successful completion, at most `capacity` at a time.
    ///
    /// Returns only once all jobs have been launched and exited 0, or fails
    /// fast on the first non-zero exit. The returned error downcasts to
    /// [`JobFailure`] when a job itself failed (as opposed to a launch or
    /// poll error, or an external cancellation).
    pub fn run(&self, jobs: Vec<JobSpec>) -> Result<()> {
        let total = jobs.len();
        tracing::debug!("pool: {} jobs, capacity {}", total, self.capacity);

        let mut pending = jobs.into_iter();
        let mut next = pending.next();
        let mut slots: Vec<Option<ProcessJob>> = Vec::new();
        slots.resize_with(self.capacity, || None);
        let mut completed = 0usize;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                let in_flight = slots.iter().filter(|s| s.is_some()).count();
                abort_in_flight(&mut slots);
                bail!(
                    "interrupted: aborted {} in-flight jobs, {} never launched",
                    in_flight,
                    total - completed - in_flight
                );
            }

            let mut any_running = false;

            for i in 0..slots.len() {
                // Reap the occupant, putting it back if still running.
                if let Some(mut job) = slots[i].take() {
                    match job.poll() {
                        Ok(None) => {
                            slots[i] = Some(job);
                            any_running = true;
                            continue;
                        }
                        Ok(Some(status)) if status.success() => {
                            completed += 1;
                            tracing::debug!(
                                "pool: job {} finished ({}/{})",
                                job.spec().index,
                                completed,
                                total
                            );
                        }
                        Ok(Some(status)) => {
                            let failure = JobFailure {
                                index: job.spec().index,
                                command: job.spec().command_line(),
                                code: status.code(),
                                stderr: job.spec().stderr.clone(),
                            };
                            abort_in_flight(&mut slots);
                            return Err(failure.into());
                        }
                        Err(err) => {
                            job.kill();
                            abort_in_flight(&mut slots);
                            return Err(err);
                        }
                    }
                }

                // Slot is open: launch the next pending job, if any.
                if let Some(spec) = next.take() {
                    tracing::debug!("pool: launching job {}: {}", spec.index, spec.command_line());
                    match spec.spawn() {
                        Ok(job) => {
                            slots[i] = Some(job);
                            any_running = true;
                        }
                        Err(err) => {
                            abort_in_flight(&mut slots);
                            return Err(err);
                        }
                    }
                    next = pending.next();
                }
            }

            if !any_running && next.is_none() {
                return Ok(());
            }

            std::thread::sleep(self.poll_interval);
        }
    }
}

/// Kill and reap every job still occupying a slot.
fn abort_in_flight(slots: &mut [Option<ProcessJob>]) {
    for slot in slots.iter_mut() {
        if let Some(job) = slot.as_mut() {
            tracing::warn!("pool: killing in-flight job {}", job.spec().index);
            job.kill();
        }
        *slot = None;
    }
}
