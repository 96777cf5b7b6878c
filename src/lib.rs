//! scdemux
//!
//! Orchestrator for single-cell genotype demultiplexing: a checkpointed,
//! resumable chain of external command-line tools (read extraction,
//! realignment, sorting, variant calling, allele counting, clustering,
//! doublet classification, genotype consensus) run with bounded process
//! parallelism over a region-sharded reference.
//!
//! # Architecture
//!
//! - **planner**: splits reference sequences into near-equal-weight chunks
//! - **exec**: child-process handles and the fixed-capacity worker pool
//! - **checkpoint**: durable per-stage completion markers for resumption
//! - **pipeline**: the linear stage machine tying it all together
//!
//! # Usage
//!
//! ```no_run
//! use scdemux::{run_pipeline, Config};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(&config)?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod exec;
pub mod pipeline;
pub mod planner;
pub mod reference;

pub use checkpoint::{CheckpointStore, Stage};
pub use config::Config;
pub use exec::{JobFailure, JobSpec, WorkerPool};
pub use pipeline::{Pipeline, PipelineSummary};
pub use planner::{plan_chunks, Chunk, Interval};

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;

/// Run the full pipeline with the given configuration.
///
/// Installs an interrupt handler for the lifetime of the process: SIGINT or
/// SIGTERM aborts the current batch, killing and reaping every in-flight
/// child before the error propagates out. Embedders that manage signals
/// themselves should construct a [`Pipeline`] directly and wire its
/// [`cancel_flag`](Pipeline::cancel_flag) instead.
pub fn run_pipeline(config: &Config) -> Result<PipelineSummary> {
    config.validate()?;
    tracing::info!("starting demultiplexing pipeline");
    let pipeline = Pipeline::new(config);

    let cancel = pipeline.cancel_flag();
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    pipeline.run()
}
