//! Reference sequence metadata loaded from a FASTA index (`.fai`).
//!
//! The `.fai` format is a tab-separated table with the sequence name in the
//! first column and its length in the second; remaining columns are byte
//! offsets we do not need. Sequence order in the file is the canonical order
//! used for sharding, so it must be preserved.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One reference sequence: name and length in bases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceInfo {
    pub name: String,
    pub length: u64,
}

/// Read an ordered list of sequences from a FASTA index file.
pub fn read_fai(path: &Path) -> Result<Vec<SequenceInfo>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open FASTA index {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut sequences = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let name = fields
            .next()
            .filter(|s| !s.is_empty())
            .with_context(|| format!("{}:{}: missing sequence name", path.display(), lineno + 1))?;
        let length: u64 = fields
            .next()
            .with_context(|| format!("{}:{}: missing sequence length", path.display(), lineno + 1))?
            .parse()
            .with_context(|| format!("{}:{}: invalid sequence length", path.display(), lineno + 1))?;
        sequences.push(SequenceInfo {
            name: name.to_string(),
            length,
        });
    }

    Ok(sequences)
}
