//! External-process execution: job handles and the bounded worker pool.

mod job;
mod pool;

pub use job::{run_checked, JobSpec, ProcessJob};
pub use pool::{JobFailure, WorkerPool};
