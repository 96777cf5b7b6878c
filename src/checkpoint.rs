//! Durable per-stage completion markers.
//!
//! Each stage writes a marker file listing its output artifact paths, one
//! per line, once every job in the stage has exited 0 and any merge step has
//! finished. Markers are published by rename, so one is either absent or
//! complete. Marker presence alone gates re-execution on restart: contents
//! are never re-validated against the filesystem, so an operator who deletes
//! an artifact without deleting its marker gets undefined downstream
//! behavior.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// The pipeline's stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Shard,
    Align,
    Sort,
    CallVariants,
    ExtractAlleleMatrix,
    Cluster,
    ClassifyDoublets,
    Consensus,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 8] = [
        Stage::Shard,
        Stage::Align,
        Stage::Sort,
        Stage::CallVariants,
        Stage::ExtractAlleleMatrix,
        Stage::Cluster,
        Stage::ClassifyDoublets,
        Stage::Consensus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Shard => "shard",
            Stage::Align => "align",
            Stage::Sort => "sort",
            Stage::CallVariants => "variants",
            Stage::ExtractAlleleMatrix => "alleles",
            Stage::Cluster => "cluster",
            Stage::ClassifyDoublets => "doublets",
            Stage::Consensus => "consensus",
        }
    }

    fn marker(&self) -> String {
        format!("{}.done", self.name())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Checkpoint markers for one working directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn marker_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(stage.marker())
    }

    /// Whether `stage` already completed in a previous run.
    pub fn exists(&self, stage: Stage) -> bool {
        self.marker_path(stage).is_file()
    }

    /// Read back the artifact paths a completed stage recorded.
    pub fn load(&self, stage: Stage) -> Result<Vec<PathBuf>> {
        let path = self.marker_path(stage);
        let file = File::open(&path)
            .with_context(|| format!("failed to open checkpoint {}", path.display()))?;
        let mut artifacts = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if !line.is_empty() {
                artifacts.push(PathBuf::from(line));
            }
        }
        Ok(artifacts)
    }

    /// Durably record that `stage` completed with the given artifacts.
    ///
    /// Must only be called after every job of the stage exited 0 and its
    /// merge/cleanup finished. The marker is written to a `.tmp` sibling,
    /// fsynced, then renamed into place, so it becomes visible only whole:
    /// a crash mid-commit leaves a `.tmp` leftover that `exists` ignores,
    /// never a truncated marker a resumed run would trust.
    pub fn commit(&self, stage: Stage, artifacts: &[PathBuf]) -> Result<()> {
        let path = self.marker_path(stage);
        let tmp = self.dir.join(format!("{}.tmp", stage.marker()));
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create checkpoint {}", tmp.display()))?;
        for artifact in artifacts {
            writeln!(file, "{}", artifact.display())
                .with_context(|| format!("failed to write checkpoint {}", tmp.display()))?;
        }
        file.flush()?;
        file.sync_all()
            .with_context(|| format!("failed to sync checkpoint {}", tmp.display()))?;
        drop(file);
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to publish checkpoint {}", path.display()))?;
        tracing::info!("stage {} committed ({} artifacts)", stage, artifacts.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exists_false_before_commit() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        for stage in Stage::ALL {
            assert!(!store.exists(stage));
        }
    }

    #[test]
    fn test_commit_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let a = dir.path().join("ref.mtx");
        let b = dir.path().join("alt.mtx");

        store
            .commit(Stage::ExtractAlleleMatrix, &[a.clone(), b.clone()])
            .unwrap();

        assert!(store.exists(Stage::ExtractAlleleMatrix));
        let loaded = store.load(Stage::ExtractAlleleMatrix).unwrap();
        assert_eq!(loaded, vec![a, b]);
    }

    #[test]
    fn test_commit_with_no_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.commit(Stage::Sort, &[]).unwrap();
        assert!(store.exists(Stage::Sort));
        assert!(store.load(Stage::Sort).unwrap().is_empty());
    }

    #[test]
    fn test_interrupted_commit_leftover_is_not_a_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        // What a crash between create and rename would leave behind.
        std::fs::write(dir.path().join("shard.done.tmp"), "shard_0.fq\n").unwrap();

        assert!(!store.exists(Stage::Shard));
        assert!(store.load(Stage::Shard).is_err());
    }

    #[test]
    fn test_commit_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store
            .commit(Stage::Align, &[dir.path().join("aligned_unsorted.bam")])
            .unwrap();
        assert!(store.exists(Stage::Align));
        assert!(!dir.path().join("align.done.tmp").exists());
    }

    #[test]
    fn test_stages_have_distinct_markers() {
        let markers: std::collections::HashSet<String> =
            Stage::ALL.iter().map(|s| s.marker()).collect();
        assert_eq!(markers.len(), Stage::ALL.len());
    }

    #[test]
    fn test_load_missing_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load(Stage::Cluster).is_err());
    }
}
