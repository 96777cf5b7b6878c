//! The checkpointed multi-stage state machine driving the workflow.
//!
//! Stages run strictly in order: shard, align, sort, call-variants,
//! extract-allele-matrix, cluster, classify-doublets, consensus. Before a
//! stage runs its checkpoint is consulted; a present checkpoint substitutes
//! the recorded artifacts for the stage's computation, so a restarted run
//! re-executes nothing that already completed. A stage's checkpoint is
//! committed only after every job it submitted exited 0 and its merge and
//! cleanup finished, so no job from one stage can outlive its stage.

mod stages;

use crate::checkpoint::{CheckpointStore, Stage};
use crate::config::Config;
use crate::exec::WorkerPool;
use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Mutable per-run state: the working directory and artifact locations
/// discovered as stages complete or are restored from checkpoints.
#[derive(Debug)]
pub struct RunContext {
    /// Working directory for all artifacts
    pub dir: PathBuf,

    /// The alignment file downstream stages consume (the input alignment
    /// until the sort stage replaces it)
    pub alignment: PathBuf,

    /// Final variant call set once the call-variants stage completes
    pub variant_set: Option<PathBuf>,

    /// Reference-supporting count matrix
    pub ref_matrix: Option<PathBuf>,

    /// Alternate-supporting count matrix
    pub alt_matrix: Option<PathBuf>,
}

impl RunContext {
    fn new(dir: PathBuf, alignment: PathBuf) -> Self {
        Self {
            dir,
            alignment,
            variant_set: None,
            ref_matrix: None,
            alt_matrix: None,
        }
    }

    /// Path of a named artifact inside the working directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Counters from one orchestrator run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Stages whose producers actually ran
    pub stages_executed: usize,

    /// Stages short-circuited by an existing checkpoint
    pub stages_skipped: usize,
}

impl fmt::Display for PipelineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Executed: {}, Skipped: {}",
            self.stages_executed, self.stages_skipped
        )
    }
}

/// Top-level pipeline orchestrator.
pub struct Pipeline<'a> {
    config: &'a Config,
    checkpoints: CheckpointStore,
    pool: WorkerPool,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config) -> Self {
        let checkpoints = CheckpointStore::new(&config.output.dir);
        let pool = WorkerPool::new(
            config.processing.threads,
            Duration::from_millis(config.processing.poll_interval_ms),
        );
        Self {
            config,
            checkpoints,
            pool,
        }
    }

    /// Shared flag that aborts the worker pool's running batch when set.
    /// Wire it to an interrupt handler so a terminated run kills its
    /// children instead of orphaning them.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.pool.cancel_flag()
    }

    /// Drive every stage to completion, resuming from checkpoints.
    pub fn run(&self) -> Result<PipelineSummary> {
        let dir = &self.config.output.dir;
        if dir.is_dir() {
            tracing::info!("resuming pipeline in existing directory {}", dir.display());
        } else {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        }

        let mut ctx = RunContext::new(dir.clone(), self.config.input.alignment.clone());
        let mut summary = PipelineSummary::default();

        if self.config.input.skip_remap {
            tracing::info!(
                "skip_remap set: calling variants directly on {}",
                ctx.alignment.display()
            );
        } else {
            let fastqs = self.gated(Stage::Shard, &mut summary, || self.shard(&ctx))?;
            let unsorted = self.gated(Stage::Align, &mut summary, || self.align(&ctx, &fastqs))?;
            let unsorted = first(Stage::Align, &unsorted)?;
            let sorted = self.gated(Stage::Sort, &mut summary, || self.sort(&ctx, unsorted))?;
            ctx.alignment = first(Stage::Sort, &sorted)?.clone();
        }

        let vcfs = self.gated(Stage::CallVariants, &mut summary, || {
            self.call_variants(&ctx)
        })?;
        ctx.variant_set = Some(first(Stage::CallVariants, &vcfs)?.clone());

        let matrices = self.gated(Stage::ExtractAlleleMatrix, &mut summary, || {
            self.extract_allele_matrix(&ctx)
        })?;
        ctx.ref_matrix = Some(first(Stage::ExtractAlleleMatrix, &matrices)?.clone());
        ctx.alt_matrix = Some(
            matrices
                .get(1)
                .with_context(|| "alleles checkpoint is missing the alternate matrix")?
                .clone(),
        );

        let clusters = self.gated(Stage::Cluster, &mut summary, || self.cluster(&ctx))?;
        let clusters = first(Stage::Cluster, &clusters)?;

        let assignments = self.gated(Stage::ClassifyDoublets, &mut summary, || {
            self.classify_doublets(&ctx, clusters)
        })?;
        let assignments = first(Stage::ClassifyDoublets, &assignments)?;

        self.gated(Stage::Consensus, &mut summary, || {
            self.consensus(&ctx, assignments)
        })?;

        tracing::info!("pipeline complete: {}", summary);
        Ok(summary)
    }

    /// Run `produce` unless `stage` is already checkpointed, committing its
    /// artifacts on success.
    fn gated<F>(&self, stage: Stage, summary: &mut PipelineSummary, produce: F) -> Result<Vec<PathBuf>>
    where
        F: FnOnce() -> Result<Vec<PathBuf>>,
    {
        if self.checkpoints.exists(stage) {
            tracing::info!("stage {}: checkpoint found, skipping", stage);
            summary.stages_skipped += 1;
            return self.checkpoints.load(stage);
        }
        tracing::info!("stage {}: starting", stage);
        let artifacts = produce().with_context(|| format!("stage {} failed", stage))?;
        self.checkpoints.commit(stage, &artifacts)?;
        summary.stages_executed += 1;
        Ok(artifacts)
    }

    /// Delete intermediates once their consumer succeeded, unless the run
    /// is configured to keep them.
    fn remove_intermediates(&self, files: &[PathBuf]) {
        if self.config.processing.keep_intermediates {
            return;
        }
        for file in files {
            if let Err(err) = std::fs::remove_file(file) {
                tracing::warn!("failed to remove intermediate {}: {}", file.display(), err);
            }
        }
    }
}

/// The first artifact a stage recorded; its absence means a truncated or
/// hand-edited checkpoint.
fn first<'p>(stage: Stage, artifacts: &'p [PathBuf]) -> Result<&'p PathBuf> {
    artifacts
        .first()
        .with_context(|| format!("{} checkpoint records no artifacts", stage))
}
