//! Chunker parameter recommendation.
//!
//! Sweeps a ladder of candidate average sizes over a directory tree,
//! chunks everything once per candidate, and scores the outcomes under the
//! caller's policy.

use super::{chunk_file, ChunkerOptions};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

/// Candidate average chunk sizes, in bytes.
const CANDIDATE_AVGS: [u32; 6] = [
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
];

/// What the caller wants the chunker tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkerPolicy {
    /// Tight size distribution close to the target average.
    #[default]
    Balanced,
    /// Maximum duplicate-chunk ratio.
    Dedupe,
    /// Fewest chunks (cheapest hashing / fewest store round trips).
    Throughput,
    /// Fewest chunks; alias policy kept distinct for callers that mean
    /// "small chunk tables" rather than raw speed.
    ChunkCount,
}

/// Observed statistics for one candidate triple.
#[derive(Debug, Clone)]
pub struct CandidateStats {
    pub options: ChunkerOptions,
    pub total_chunks: u64,
    pub unique_chunks: u64,
    pub raw_size: u64,
    pub deduped_size: u64,
    pub observed_avg: f64,
    pub stddev: f64,
}

impl CandidateStats {
    pub fn dedupe_ratio(&self) -> f64 {
        if self.unique_chunks == 0 {
            1.0
        } else {
            self.total_chunks as f64 / self.unique_chunks as f64
        }
    }
}

/// Result of a recommendation sweep.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub policy: ChunkerPolicy,
    pub best: CandidateStats,
    pub candidates: Vec<CandidateStats>,
}

/// Nearest power of two in log space.
fn round_pow2(value: f64) -> u32 {
    let exp = value.log2().round().max(0.0) as u32;
    1u32 << exp.min(30)
}

/// Derive the sweep triple for one candidate average.
fn candidate_options(avg: u32) -> Result<ChunkerOptions> {
    let min = round_pow2(0.15 * f64::from(avg));
    let max = round_pow2(6.0 * f64::from(avg));
    ChunkerOptions::new(min, avg, max)
}

/// Chunk every file under `dir` with each candidate triple and return the
/// best per `policy`, with the full sweep attached.
pub fn recommend(
    dir: &Path,
    policy: ChunkerPolicy,
    cancel: &CancelToken,
) -> Result<Recommendation> {
    let files: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    if files.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no files to sample under {}",
            dir.display()
        )));
    }

    let mut candidates = Vec::with_capacity(CANDIDATE_AVGS.len());
    for avg in CANDIDATE_AVGS {
        cancel.check()?;
        let options = candidate_options(avg)?;
        let mut lengths: Vec<u64> = Vec::new();
        let mut seen: HashMap<Hash32, u64> = HashMap::new();
        let mut raw_size = 0u64;

        for path in &files {
            cancel.check()?;
            let map = chunk_file(path, &options, cancel)?;
            raw_size += map.total_size;
            for entry in &map.entries {
                lengths.push(u64::from(entry.length));
                seen.entry(entry.checksum)
                    .or_insert(u64::from(entry.length));
            }
        }

        let total_chunks = lengths.len() as u64;
        if total_chunks == 0 {
            continue;
        }
        let observed_avg = raw_size as f64 / total_chunks as f64;
        let variance = lengths
            .iter()
            .map(|&l| {
                let d = l as f64 - observed_avg;
                d * d
            })
            .sum::<f64>()
            / total_chunks as f64;

        candidates.push(CandidateStats {
            options,
            total_chunks,
            unique_chunks: seen.len() as u64,
            raw_size,
            deduped_size: seen.values().sum(),
            observed_avg,
            stddev: variance.sqrt(),
        });
    }

    if candidates.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no chunkable bytes under {}",
            dir.display()
        )));
    }

    let best = candidates
        .iter()
        .min_by(|a, b| {
            score(a, policy)
                .partial_cmp(&score(b, policy))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("candidates is non-empty")
        .clone();

    tracing::debug!(
        policy = ?policy,
        min = best.options.min_size,
        avg = best.options.avg_size,
        max = best.options.max_size,
        chunks = best.total_chunks,
        "chunker recommendation"
    );

    Ok(Recommendation {
        policy,
        best,
        candidates,
    })
}

/// Lower is better, for every policy.
fn score(stats: &CandidateStats, policy: ChunkerPolicy) -> f64 {
    match policy {
        ChunkerPolicy::Dedupe => -stats.dedupe_ratio(),
        ChunkerPolicy::Balanced => {
            stats.stddev + (f64::from(stats.options.avg_size) - stats.observed_avg).abs()
        }
        ChunkerPolicy::Throughput | ChunkerPolicy::ChunkCount => stats.total_chunks as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_triples_are_valid() {
        for avg in CANDIDATE_AVGS {
            let o = candidate_options(avg).unwrap();
            assert!(o.min_size <= o.avg_size && o.avg_size <= o.max_size);
            assert!(o.avg_size.is_power_of_two());
        }
    }

    #[test]
    fn round_pow2_rounds_in_log_space() {
        assert_eq!(round_pow2(4915.2), 4096); // 0.15 * 32 KiB
        assert_eq!(round_pow2(196608.0), 262144); // 6 * 32 KiB
        assert_eq!(round_pow2(1.0), 1);
    }

    #[test]
    fn sweep_picks_a_candidate() {
        let dir = tempfile::tempdir().unwrap();
        // Two files with shared content so dedupe has something to find.
        let mut shared = vec![0u8; 200 * 1024];
        let mut state = 11u64;
        for b in shared.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = state as u8;
        }
        std::fs::write(dir.path().join("a.bin"), &shared).unwrap();
        let mut b_file = shared.clone();
        b_file.extend_from_slice(&shared[..50 * 1024]);
        std::fs::write(dir.path().join("b.bin"), &b_file).unwrap();

        let rec = recommend(dir.path(), ChunkerPolicy::Dedupe, &CancelToken::new()).unwrap();
        assert_eq!(rec.candidates.len(), CANDIDATE_AVGS.len());
        assert!(rec.best.total_chunks > 0);
        assert!(rec.best.dedupe_ratio() >= 1.0);
    }

    #[test]
    fn empty_directory_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(recommend(dir.path(), ChunkerPolicy::Balanced, &CancelToken::new()).is_err());
    }
}
