//! Region sharding: partitions reference sequences into near-equal-weight
//! contiguous chunks, one chunk per parallel external job.
//!
//! The planner walks sequences in input order and accumulates half-open
//! intervals into the current chunk until its weight reaches
//! `ceil(total / target)`; a sequence crossing the boundary is split in two.
//! The result covers every eligible base exactly once, in order, so a merge
//! step can recombine per-chunk outputs by queue index and obtain the same
//! order as a whole-genome run.

use crate::reference::SequenceInfo;
use std::fmt;

/// A half-open coordinate range `[start, end)` within one named sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub seq: String,
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(seq: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            seq: seq.into(),
            start,
            end,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Format as a `name:start-end` region argument for external tools.
    pub fn region_arg(&self) -> String {
        format!("{}:{}-{}", self.seq, self.start, self.end)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.seq, self.start, self.end)
    }
}

/// An ordered group of intervals forming one unit of parallel work.
///
/// `index` is the chunk's queue position; merges of per-chunk outputs must
/// sort by it, never by job completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub intervals: Vec<Interval>,
}

impl Chunk {
    /// Total bases covered by this chunk.
    pub fn weight(&self) -> u64 {
        self.intervals.iter().map(Interval::len).sum()
    }
}

/// Partition `sequences` into at most `target` chunks of near-equal weight.
///
/// Sequences shorter than `min_len` are excluded entirely (they are too
/// short to be worth a dedicated caller invocation). If leftover intervals
/// remain after `target` chunks have been closed they are appended to the
/// last chunk; otherwise they form their own final chunk, which may be
/// smaller than the rest.
pub fn plan_chunks(sequences: &[SequenceInfo], target: usize, min_len: u64) -> Vec<Chunk> {
    let eligible: Vec<&SequenceInfo> = sequences
        .iter()
        .filter(|s| s.length >= min_len && s.length > 0)
        .collect();
    let total: u64 = eligible.iter().map(|s| s.length).sum();
    if total == 0 || target == 0 {
        return Vec::new();
    }
    let step = total.div_ceil(target as u64);
    plan_with_step(&eligible, target, step)
}

fn plan_with_step(sequences: &[&SequenceInfo], target: usize, step: u64) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<Interval> = Vec::new();
    let mut acc = 0u64;

    for seq in sequences {
        let mut pos = 0u64;
        while pos < seq.length {
            let remaining = seq.length - pos;
            if acc + remaining < step {
                current.push(Interval::new(seq.name.clone(), pos, seq.length));
                acc += remaining;
                pos = seq.length;
            } else {
                // Split the crossing sequence at the chunk boundary.
                let take = step - acc;
                current.push(Interval::new(seq.name.clone(), pos, pos + take));
                chunks.push(Chunk {
                    index: chunks.len(),
                    intervals: std::mem::take(&mut current),
                });
                acc = 0;
                pos += take;
            }
        }
    }

    if !current.is_empty() {
        if chunks.len() == target {
            // Chunk budget exhausted: fold the remainder into the last chunk.
            if let Some(last) = chunks.last_mut() {
                last.intervals.append(&mut current);
            }
        } else {
            chunks.push(Chunk {
                index: chunks.len(),
                intervals: current,
            });
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(lengths: &[(&str, u64)]) -> Vec<SequenceInfo> {
        lengths
            .iter()
            .map(|(name, length)| SequenceInfo {
                name: name.to_string(),
                length: *length,
            })
            .collect()
    }

    /// Every eligible base appears exactly once, in input order.
    fn assert_full_coverage(sequences: &[SequenceInfo], chunks: &[Chunk], min_len: u64) {
        let flat: Vec<&Interval> = chunks.iter().flat_map(|c| &c.intervals).collect();
        let mut i = 0;
        for seq in sequences.iter().filter(|s| s.length >= min_len && s.length > 0) {
            let mut pos = 0u64;
            while pos < seq.length {
                let iv = flat.get(i).expect("coverage gap: ran out of intervals");
                assert_eq!(iv.seq, seq.name);
                assert_eq!(iv.start, pos, "gap or overlap within {}", seq.name);
                assert!(iv.end <= seq.length);
                assert!(iv.end > iv.start);
                pos = iv.end;
                i += 1;
            }
            assert_eq!(pos, seq.length, "sequence {} not fully covered", seq.name);
        }
        assert_eq!(i, flat.len(), "extra intervals beyond input space");
    }

    #[test]
    fn test_three_way_split_across_sequences() {
        // lengths [1000, 1000, 3000], target 3 -> step = ceil(5000/3) = 1667
        let sequences = seqs(&[("seq0", 1000), ("seq1", 1000), ("seq2", 3000)]);
        let chunks = plan_chunks(&sequences, 3, 0);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks[0].intervals,
            vec![
                Interval::new("seq0", 0, 1000),
                Interval::new("seq1", 0, 667),
            ]
        );
        assert_eq!(
            chunks[1].intervals,
            vec![
                Interval::new("seq1", 667, 1000),
                Interval::new("seq2", 0, 1334),
            ]
        );
        assert_eq!(chunks[2].intervals, vec![Interval::new("seq2", 1334, 3000)]);
        assert_eq!(chunks[0].weight(), 1667);
        assert_eq!(chunks[1].weight(), 1667);
        assert_eq!(chunks[2].weight(), 1666);
        assert_full_coverage(&sequences, &chunks, 0);
    }

    #[test]
    fn test_coverage_and_balance() {
        let sequences = seqs(&[
            ("chr1", 248_956_422),
            ("chr2", 242_193_529),
            ("chr3", 198_295_559),
            ("chrM", 16_569),
        ]);
        for target in [1, 2, 7, 16, 64] {
            let chunks = plan_chunks(&sequences, target, 0);
            assert!(chunks.len() <= target);
            assert_full_coverage(&sequences, &chunks, 0);

            let total: u64 = sequences.iter().map(|s| s.length).sum();
            let step = total.div_ceil(target as u64);
            // All chunks except the final remainder weigh exactly one step.
            for chunk in &chunks[..chunks.len() - 1] {
                assert_eq!(chunk.weight(), step);
            }
            assert!(chunks.last().unwrap().weight() <= step);
        }
    }

    #[test]
    fn test_determinism() {
        let sequences = seqs(&[("a", 12345), ("b", 999), ("c", 54321)]);
        let first = plan_chunks(&sequences, 8, 0);
        let second = plan_chunks(&sequences, 8, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_queue_indices_are_sequential() {
        let sequences = seqs(&[("a", 5000), ("b", 5000)]);
        let chunks = plan_chunks(&sequences, 4, 0);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn test_fewer_bases_than_target() {
        let sequences = seqs(&[("tiny", 5)]);
        let chunks = plan_chunks(&sequences, 10, 0);
        assert!(chunks.len() <= 10);
        assert_full_coverage(&sequences, &chunks, 0);
    }

    #[test]
    fn test_min_len_excludes_short_sequences() {
        let sequences = seqs(&[("chr1", 1_000_000), ("scaffold", 1000), ("chr2", 1_000_000)]);
        let chunks = plan_chunks(&sequences, 4, 250_000);
        for chunk in &chunks {
            for iv in &chunk.intervals {
                assert_ne!(iv.seq, "scaffold");
            }
        }
        assert_full_coverage(&sequences, &chunks, 250_000);
    }

    #[test]
    fn test_no_eligible_sequences() {
        let sequences = seqs(&[("short", 100)]);
        assert!(plan_chunks(&sequences, 4, 250_000).is_empty());
        assert!(plan_chunks(&[], 4, 0).is_empty());
    }

    #[test]
    fn test_remainder_kept_as_own_chunk() {
        // step = ceil(5000/3) = 1667: two full chunks close, the 1666-base
        // remainder stays separate because the chunk budget is not exhausted.
        let sequences = seqs(&[("s", 5000)]);
        let chunks = plan_chunks(&sequences, 3, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].weight(), 1666);
    }

    #[test]
    fn test_remainder_merged_when_budget_exhausted() {
        // Force a small step so leftover work remains after `target` chunks
        // have closed; it must fold into the last chunk.
        let info = seqs(&[("s", 10)]);
        let eligible: Vec<&SequenceInfo> = info.iter().collect();
        let chunks = plan_with_step(&eligible, 2, 3);
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[1].intervals,
            vec![Interval::new("s", 3, 6), Interval::new("s", 6, 10)]
        );
        assert_full_coverage(&info, &chunks, 0);
    }

    #[test]
    fn test_region_arg_format() {
        let iv = Interval::new("chr7", 1200, 4800);
        assert_eq!(iv.region_arg(), "chr7:1200-4800");
    }
}
