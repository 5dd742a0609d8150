//! Candidate keyframe pair selection.
//!
//! Every strategy yields `(index_a, index_b)` pairs plus a flag telling the
//! orchestrator whether the pair is trusted from odometry or needs RANSAC
//! verification.

use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::features::descriptor_distance;
use crate::types::Keyframe;

const TIGHT_EUCLIDEAN_DIST: f64 = 0.05;
const LOOSE_EUCLIDEAN_DIST: f64 = 0.10;

fn default_ring_neighbors() -> usize {
    3
}

fn default_simplified_ring_neighbors() -> usize {
    1
}

fn default_k_nearest() -> usize {
    15
}

fn default_max_candidates() -> usize {
    15
}

fn default_min_correspondences() -> usize {
    15
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PairStrategy {
    /// Consecutive pairs from odometry, every pair of manually added
    /// keyframes verified.
    BruteForceManual,
    /// Each keyframe against its next `neighbors` keyframes, wrapping around.
    Ring {
        #[serde(default = "default_ring_neighbors")]
        neighbors: usize,
    },
    /// As `Ring`, but true time-consecutive pairs come from odometry.
    SimplifiedRing {
        #[serde(default = "default_simplified_ring_neighbors")]
        neighbors: usize,
    },
    /// Candidates ranked by descriptor votes in a global index.
    IndexedCandidate {
        /// Nearest descriptors retrieved per query descriptor.
        #[serde(default = "default_k_nearest")]
        k_nearest: usize,
        /// Candidates verified per keyframe.
        #[serde(default = "default_max_candidates")]
        max_candidates: usize,
        /// Minimum vote count for a candidate to be verified.
        #[serde(default = "default_min_correspondences")]
        min_correspondences: usize,
    },
}

impl Default for PairStrategy {
    fn default() -> Self {
        Self::BruteForceManual
    }
}

impl PairStrategy {
    pub fn ring() -> Self {
        Self::Ring { neighbors: default_ring_neighbors() }
    }

    pub fn simplified_ring() -> Self {
        Self::SimplifiedRing { neighbors: default_simplified_ring_neighbors() }
    }

    pub fn indexed_candidate() -> Self {
        Self::IndexedCandidate {
            k_nearest: default_k_nearest(),
            max_candidates: default_max_candidates(),
            min_correspondences: default_min_correspondences(),
        }
    }

    /// Inlier distance the strategy was tuned with.
    pub fn default_max_euclidean_dist(&self) -> f64 {
        match self {
            Self::BruteForceManual | Self::SimplifiedRing { .. } => TIGHT_EUCLIDEAN_DIST,
            Self::Ring { .. } | Self::IndexedCandidate { .. } => LOOSE_EUCLIDEAN_DIST,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match *self {
            Self::Ring { neighbors } | Self::SimplifiedRing { neighbors } if neighbors == 0 => {
                Err("strategy.neighbors must be at least 1".to_string())
            }
            Self::IndexedCandidate { k_nearest, max_candidates, .. } if k_nearest == 0 || max_candidates == 0 => {
                Err("strategy.k_nearest and strategy.max_candidates must be at least 1".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// A pair of keyframe indices to associate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePair {
    pub index_a: usize,
    pub index_b: usize,
    /// Take the relative pose from the keyframe poses, skip RANSAC.
    pub odometry_only: bool,
}

impl CandidatePair {
    fn odometry(index_a: usize, index_b: usize) -> Self {
        Self { index_a, index_b, odometry_only: true }
    }

    fn verified(index_a: usize, index_b: usize) -> Self {
        Self { index_a, index_b, odometry_only: false }
    }
}

#[derive(Debug, Clone)]
pub struct PairSelector {
    strategy: PairStrategy,
}

impl PairSelector {
    pub fn new(strategy: PairStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &PairStrategy {
        &self.strategy
    }

    /// Enumerate candidate pairs in a deterministic order.
    pub fn select(&self, keyframes: &[Keyframe]) -> Vec<CandidatePair> {
        let count = keyframes.len();
        if count < 2 {
            return Vec::new();
        }

        match self.strategy {
            PairStrategy::BruteForceManual => {
                let manual: Vec<bool> = keyframes.iter().map(|kf| kf.manually_added).collect();
                brute_force_manual(&manual)
            }
            PairStrategy::Ring { neighbors } => ring(count, neighbors, false),
            PairStrategy::SimplifiedRing { neighbors } => ring(count, neighbors, true),
            PairStrategy::IndexedCandidate { k_nearest, max_candidates, min_correspondences } => {
                let index = DescriptorIndex::build(keyframes);
                (0..count)
                    .flat_map(|kf_idx| {
                        index
                            .rank_candidates(kf_idx, k_nearest, max_candidates, min_correspondences)
                            .into_iter()
                            .map(move |(index_b, _)| CandidatePair::verified(kf_idx, index_b))
                    })
                    .collect()
            }
        }
    }
}

/// Consecutive odometry pairs followed by every pair of flagged keyframes.
fn brute_force_manual(manually_added: &[bool]) -> Vec<CandidatePair> {
    let consecutive = (0..manually_added.len().saturating_sub(1)).map(|i| CandidatePair::odometry(i, i + 1));

    let manual_indices: Vec<usize> = manually_added
        .iter()
        .enumerate()
        .filter(|&(_, &flag)| flag)
        .map(|(i, _)| i)
        .collect();
    tracing::debug!(?manual_indices, "manual keyframes");

    let manual = manual_indices
        .into_iter()
        .tuple_combinations()
        .map(|(a, b)| CandidatePair::verified(a, b));

    consecutive.chain(manual).collect()
}

/// Ring topology with wrap-around; offsets landing on the keyframe itself
/// are skipped.
fn ring(count: usize, neighbors: usize, consecutive_from_odometry: bool) -> Vec<CandidatePair> {
    let mut pairs = Vec::with_capacity(count * neighbors);
    for index_a in 0..count {
        for n in 1..=neighbors {
            let index_b = (index_a + n) % count;
            if index_b == index_a {
                continue;
            }
            if consecutive_from_odometry && index_b == index_a + 1 {
                pairs.push(CandidatePair::odometry(index_a, index_b));
            } else {
                pairs.push(CandidatePair::verified(index_a, index_b));
            }
        }
    }
    pairs
}

/// Flat index of every descriptor of every keyframe.
pub struct DescriptorIndex<'a> {
    entries: Vec<(usize, &'a [f32])>,
    per_keyframe: Vec<Vec<&'a [f32]>>,
}

impl<'a> DescriptorIndex<'a> {
    pub fn build(keyframes: &'a [Keyframe]) -> Self {
        let per_keyframe: Vec<Vec<&[f32]>> = keyframes
            .iter()
            .map(|kf| kf.descriptors.iter().map(Vec::as_slice).collect())
            .collect();
        let entries = per_keyframe
            .iter()
            .enumerate()
            .flat_map(|(kf_idx, descs)| descs.iter().map(move |d| (kf_idx, *d)))
            .collect();
        Self { entries, per_keyframe }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Owners of the `k` nearest indexed descriptors.
    fn nearest_owners(&self, query: &[f32], k: usize) -> Vec<usize> {
        let mut dists: Vec<(f32, usize)> = self
            .entries
            .iter()
            .map(|(owner, d)| (descriptor_distance(query, d), *owner))
            .collect();
        let k = k.min(dists.len());
        if k == 0 {
            return Vec::new();
        }
        if k < dists.len() {
            dists.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
            dists.truncate(k);
        }
        dists.into_iter().map(|(_, owner)| owner).collect()
    }

    /// Per-keyframe vote counts from the k-nearest descriptors of every
    /// descriptor in keyframe `kf_idx`.
    pub fn votes(&self, kf_idx: usize, k: usize) -> Vec<usize> {
        let queries = &self.per_keyframe[kf_idx];
        queries
            .par_iter()
            .map(|q| self.nearest_owners(q, k))
            .fold(
                || vec![0usize; self.per_keyframe.len()],
                |mut bins, owners| {
                    for owner in owners {
                        bins[owner] += 1;
                    }
                    bins
                },
            )
            .reduce(
                || vec![0usize; self.per_keyframe.len()],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            )
    }

    /// Later keyframes with at least `min_votes` votes, highest first (ties
    /// favour the higher index), at most `max_candidates`.
    pub fn rank_candidates(
        &self,
        kf_idx: usize,
        k: usize,
        max_candidates: usize,
        min_votes: usize,
    ) -> Vec<(usize, usize)> {
        let mut bins: Vec<(usize, usize)> = self
            .votes(kf_idx, k)
            .into_iter()
            .enumerate()
            .map(|(idx, votes)| (votes, idx))
            .collect();
        bins.sort_unstable_by(|a, b| b.cmp(a));

        let candidates: Vec<(usize, usize)> = bins
            .into_iter()
            .filter(|&(votes, idx)| idx > kf_idx && votes >= min_votes)
            .take(max_candidates)
            .map(|(votes, idx)| (idx, votes))
            .collect();
        tracing::debug!(kf_idx, ?candidates, "indexed candidates");
        candidates
    }
}
