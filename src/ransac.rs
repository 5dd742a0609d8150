//! RANSAC rigid-transform estimation between two keyframes.
//!
//! Candidate correspondences are drawn three at a time; every candidate that
//! agrees with the current model joins the inlier set immediately and the
//! model is refit before the next candidate is tested.

use nalgebra::{Isometry3, Point3};
use rand::Rng;
use thiserror::Error;

use crate::config::RansacConfig;
use crate::features::FeatureBackend;
use crate::geometry::RigidAccumulator;
use crate::types::{Correspondence, Keyframe};

/// Smallest sample that determines a rigid motion.
pub const MIN_SAMPLE_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RansacParams {
    pub max_euclidean_dist_sq: f64,
    pub max_descriptor_dist: f32,
    pub target_inlier_ratio: f64,
    pub max_iterations: usize,
    pub min_inlier_count: usize,
}

impl RansacParams {
    pub fn from_config(config: &RansacConfig, max_euclidean_dist: f64) -> Self {
        Self {
            max_euclidean_dist_sq: max_euclidean_dist * max_euclidean_dist,
            max_descriptor_dist: config.max_descriptor_dist,
            target_inlier_ratio: config.target_inlier_ratio,
            max_iterations: config.max_iterations,
            min_inlier_count: config.min_inlier_count,
        }
    }
}

impl Default for RansacParams {
    fn default() -> Self {
        Self::from_config(&RansacConfig::default(), 0.05)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimateError {
    #[error("only {found} of {matches} matches are usable candidates, need {required}")]
    InsufficientCandidates {
        found: usize,
        required: usize,
        matches: usize,
    },

    #[error("best model has {inliers} inliers out of {candidates} candidates, need {required}")]
    BelowInlierThreshold {
        inliers: usize,
        required: usize,
        candidates: usize,
        matches: usize,
    },
}

/// Bookkeeping for one RANSAC iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationStats {
    pub iteration: usize,
    /// Inliers of this iteration's model, sample included.
    pub inliers: usize,
    /// Best inlier count seen up to and including this iteration.
    pub best_inliers: usize,
}

/// Result of the geometric RANSAC loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RansacOutcome {
    /// Maps B points onto A points. `None` when no model could be fit.
    pub transform: Option<Isometry3<f64>>,
    /// Indices into the input point lists, in acceptance order.
    pub inliers: Vec<usize>,
    pub iterations: usize,
    pub history: Vec<IterationStats>,
}

impl RansacOutcome {
    fn empty() -> Self {
        Self {
            transform: None,
            inliers: Vec::new(),
            iterations: 0,
            history: Vec::new(),
        }
    }
}

/// A verified keyframe pair.
#[derive(Debug, Clone)]
pub struct PairwiseEstimate {
    /// Pose of b in a's frame, i.e. maps b's keypoint positions onto a's.
    pub a_to_b: Isometry3<f64>,
    pub inliers: Vec<Correspondence>,
    pub candidate_count: usize,
    pub match_count: usize,
    pub iterations: usize,
}

/// RANSAC over corresponding points, `points_a[i] ≈ T · points_b[i]`.
///
/// Returns without iterating when fewer than [`MIN_SAMPLE_SIZE`] pairs are
/// given. Ties in inlier count keep the earliest model.
pub fn estimate_from_points<R: Rng + ?Sized>(
    points_a: &[Point3<f64>],
    points_b: &[Point3<f64>],
    params: &RansacParams,
    rng: &mut R,
) -> RansacOutcome {
    let size = points_a.len().min(points_b.len());
    if size < MIN_SAMPLE_SIZE {
        return RansacOutcome::empty();
    }

    let mut outcome = RansacOutcome::empty();
    let mut best_count = 0;

    for iteration in 0..params.max_iterations {
        outcome.iterations = iteration + 1;
        let sample = sample_distinct(rng, size, MIN_SAMPLE_SIZE);

        let mut acc = RigidAccumulator::new();
        let mut in_set = vec![false; size];
        let mut inliers = Vec::with_capacity(size);
        for &idx in &sample {
            acc.add(&points_b[idx], &points_a[idx]);
            in_set[idx] = true;
            inliers.push(idx);
        }

        let Some(mut transform) = acc.solve() else {
            outcome.history.push(IterationStats { iteration, inliers: 0, best_inliers: best_count });
            continue;
        };

        for m_idx in 0..size {
            if in_set[m_idx] {
                continue;
            }
            let dist_sq = (transform * points_b[m_idx] - points_a[m_idx]).norm_squared();
            if dist_sq < params.max_euclidean_dist_sq {
                acc.add(&points_b[m_idx], &points_a[m_idx]);
                in_set[m_idx] = true;
                inliers.push(m_idx);

                if let Some(refit) = acc.solve() {
                    transform = refit;
                }
            }
        }

        let n_inliers = inliers.len();
        if n_inliers > best_count {
            best_count = n_inliers;
            outcome.transform = Some(transform);
            outcome.inliers = inliers;
        }
        outcome.history.push(IterationStats { iteration, inliers: n_inliers, best_inliers: best_count });

        let inlier_ratio = n_inliers as f64 / size as f64;
        if inlier_ratio > params.target_inlier_ratio {
            break;
        }
    }

    outcome
}

/// `k` distinct indices in `0..n` by rejection sampling. Requires `k <= n`.
fn sample_distinct<R: Rng + ?Sized>(rng: &mut R, n: usize, k: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(k);
    while out.len() < k {
        let candidate = rng.gen_range(0..n);
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

/// Feature-level RANSAC between two prepared keyframes.
pub struct RobustPairwiseEstimator<'a, B: FeatureBackend + ?Sized> {
    backend: &'a B,
    params: RansacParams,
}

impl<'a, B: FeatureBackend + ?Sized> RobustPairwiseEstimator<'a, B> {
    pub fn new(backend: &'a B, params: RansacParams) -> Self {
        Self { backend, params }
    }

    pub fn params(&self) -> &RansacParams {
        &self.params
    }

    /// Estimate the pose of `frame_b` relative to `frame_a` from their
    /// prepared features.
    pub fn estimate<R: Rng + ?Sized>(
        &self,
        frame_a: &Keyframe,
        frame_b: &Keyframe,
        rng: &mut R,
    ) -> Result<PairwiseEstimate, EstimateError> {
        // all matches from b to a
        let all_matches = self.backend.match_nearest(&frame_b.descriptors, &frame_a.descriptors);

        let candidates: Vec<Correspondence> = all_matches
            .iter()
            .filter(|m| {
                m.distance < self.params.max_descriptor_dist
                    && position_is_valid(frame_a, m.train_idx)
                    && position_is_valid(frame_b, m.query_idx)
            })
            .copied()
            .collect();

        if candidates.len() < MIN_SAMPLE_SIZE {
            return Err(EstimateError::InsufficientCandidates {
                found: candidates.len(),
                required: MIN_SAMPLE_SIZE,
                matches: all_matches.len(),
            });
        }

        let points_a: Vec<_> = candidates
            .iter()
            .map(|m| frame_a.keypoint_positions[m.train_idx].mean)
            .collect();
        let points_b: Vec<_> = candidates
            .iter()
            .map(|m| frame_b.keypoint_positions[m.query_idx].mean)
            .collect();

        let outcome = estimate_from_points(&points_a, &points_b, &self.params, rng);
        let below = || EstimateError::BelowInlierThreshold {
            inliers: outcome.inliers.len(),
            required: self.params.min_inlier_count,
            candidates: candidates.len(),
            matches: all_matches.len(),
        };

        match outcome.transform {
            Some(a_to_b) if outcome.inliers.len() >= self.params.min_inlier_count => Ok(PairwiseEstimate {
                a_to_b,
                inliers: outcome.inliers.iter().map(|&i| candidates[i]).collect(),
                candidate_count: candidates.len(),
                match_count: all_matches.len(),
                iterations: outcome.iterations,
            }),
            _ => Err(below()),
        }
    }
}

fn position_is_valid(frame: &Keyframe, idx: usize) -> bool {
    frame.keypoint_positions.get(idx).is_some_and(|p| p.valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DepthImage, Descriptor, Intrinsics, Keypoint, KeypointPosition, RgbImage};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn truth() -> Isometry3<f64> {
        Isometry3::new(Vector3::new(0.3, -0.1, 0.2), Vector3::new(0.05, 0.2, -0.1))
    }

    /// `inliers` exact pairs under `truth()` followed by `outliers` pairs
    /// displaced by at least 0.5 m.
    fn synthetic_points(inliers: usize, outliers: usize, seed: u64) -> (Vec<Point3<f64>>, Vec<Point3<f64>>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let t = truth();
        let mut a = Vec::new();
        let mut b = Vec::new();
        for i in 0..inliers + outliers {
            let p_b = Point3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(0.5..4.0));
            let mut p_a = t * p_b;
            if i >= inliers {
                let dir = Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
                let dir = if dir.norm() < 1e-3 { Vector3::x() } else { dir.normalize() };
                p_a += dir * rng.gen_range(0.5..1.5);
            }
            a.push(p_a);
            b.push(p_b);
        }
        (a, b)
    }

    #[test]
    fn recovers_transform_with_ten_percent_outliers() {
        let (a, b) = synthetic_points(90, 10, 1);
        let params = RansacParams { max_iterations: 2000, target_inlier_ratio: 0.75, ..Default::default() };
        let mut rng = StdRng::seed_from_u64(7);

        let outcome = estimate_from_points(&a, &b, &params, &mut rng);
        let transform = outcome.transform.unwrap();
        assert_relative_eq!(transform, truth(), epsilon = 1e-6);
        assert!(outcome.inliers.len() >= 90);
        assert!(outcome.inliers.iter().all(|&i| i < 90));
    }

    #[test]
    fn too_few_points_skip_the_loop() {
        let (a, b) = synthetic_points(2, 0, 3);
        let mut rng = StdRng::seed_from_u64(0);
        let outcome = estimate_from_points(&a, &b, &RansacParams::default(), &mut rng);

        assert_eq!(outcome.iterations, 0);
        assert!(outcome.transform.is_none());
        assert!(outcome.history.is_empty());
    }

    #[test]
    fn best_count_never_decreases() {
        // Half outliers and an unreachable ratio force the full iteration budget.
        let (a, b) = synthetic_points(30, 30, 5);
        let params = RansacParams { max_iterations: 200, target_inlier_ratio: 1.0, ..Default::default() };
        let mut rng = StdRng::seed_from_u64(11);

        let outcome = estimate_from_points(&a, &b, &params, &mut rng);
        assert_eq!(outcome.iterations, 200);
        assert_eq!(outcome.history.len(), 200);
        for pair in outcome.history.windows(2) {
            assert!(pair[1].best_inliers >= pair[0].best_inliers);
        }
        for stats in &outcome.history {
            assert!(stats.inliers == 0 || stats.inliers >= MIN_SAMPLE_SIZE);
            assert!(stats.inliers <= stats.best_inliers);
        }
        assert_eq!(outcome.history.last().unwrap().best_inliers, outcome.inliers.len());
    }

    #[test]
    fn every_pass_keeps_all_exact_pairs() {
        // exact pairs: each refit pass must end holding all of them
        let (a, b) = synthetic_points(40, 0, 9);
        let params = RansacParams { max_iterations: 20, target_inlier_ratio: 1.0, ..Default::default() };
        let mut rng = StdRng::seed_from_u64(3);

        let outcome = estimate_from_points(&a, &b, &params, &mut rng);
        assert_eq!(outcome.history.len(), 20);
        assert!(outcome.history.iter().all(|s| s.inliers == 40 && s.best_inliers == 40));

        let mut members = outcome.inliers.clone();
        members.sort_unstable();
        assert_eq!(members, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn early_stop_once_ratio_is_reached() {
        let (a, b) = synthetic_points(50, 0, 9);
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = estimate_from_points(&a, &b, &RansacParams::default(), &mut rng);

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.inliers.len(), 50);
    }

    #[test]
    fn same_seed_same_result() {
        let (a, b) = synthetic_points(40, 20, 4);
        let params = RansacParams { max_iterations: 300, ..Default::default() };

        let first = estimate_from_points(&a, &b, &params, &mut StdRng::seed_from_u64(99));
        let second = estimate_from_points(&a, &b, &params, &mut StdRng::seed_from_u64(99));
        assert_eq!(first, second);
    }

    #[test]
    fn sampled_indices_are_distinct() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let mut s = sample_distinct(&mut rng, 3, 3);
            s.sort_unstable();
            assert_eq!(s, vec![0, 1, 2]);
        }
    }

    struct MatchOnly;

    impl FeatureBackend for MatchOnly {
        fn detect(&self, _image: &RgbImage, _threshold: f64) -> Vec<Keypoint> {
            Vec::new()
        }

        fn describe(&self, _image: &RgbImage, _keypoints: &[Keypoint]) -> Vec<Descriptor> {
            Vec::new()
        }
    }

    fn frame(positions: Vec<KeypointPosition>, descriptors: Vec<Descriptor>) -> Keyframe {
        let intr = Intrinsics { width: 1, height: 1, fx: 1.0, fy: 1.0, ppx: 0.0, ppy: 0.0 };
        let mut kf = Keyframe::new(
            Isometry3::identity(),
            RgbImage::zeros((1, 1, 3)),
            DepthImage::new(1, 1, 0.0, vec![1.0]),
            intr,
        );
        let keypoints = (0..positions.len()).map(|i| Keypoint::new(i as f32, 0.0, 1.0)).collect();
        kf.set_features(keypoints, descriptors, positions);
        kf
    }

    fn valid(mean: Point3<f64>) -> KeypointPosition {
        KeypointPosition { mean, covariance: Matrix3::identity() * 1e-6, valid: true }
    }

    /// Thirty matched features; five of b's have no depth and three of b's
    /// descriptors are too far from their match.
    fn frame_pair() -> (Keyframe, Keyframe) {
        let (a, b) = synthetic_points(30, 0, 21);
        let desc_a: Vec<Descriptor> = (0..30).map(|i| vec![i as f32 * 100.0]).collect();
        let desc_b: Vec<Descriptor> = (0..30)
            .map(|i| {
                let offset = if (10..13).contains(&i) { 40.0 } else { 0.5 };
                vec![i as f32 * 100.0 + offset]
            })
            .collect();

        let pos_a = a.into_iter().map(valid).collect();
        let pos_b = b
            .into_iter()
            .enumerate()
            .map(|(i, p)| if i < 5 { KeypointPosition::invalid() } else { valid(p) })
            .collect();
        (frame(pos_a, desc_a), frame(pos_b, desc_b))
    }

    #[test]
    fn estimate_filters_candidates_and_recovers_pose() {
        let (kf_a, kf_b) = frame_pair();
        let estimator = RobustPairwiseEstimator::new(&MatchOnly, RansacParams::default());

        let est = estimator.estimate(&kf_a, &kf_b, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(est.match_count, 30);
        assert_eq!(est.candidate_count, 22);
        assert_eq!(est.inliers.len(), 22);
        assert!(est.inliers.iter().all(|m| m.query_idx == m.train_idx && m.query_idx >= 5));
        assert!(est.inliers.iter().all(|m| !(10..13).contains(&m.query_idx)));
        assert_relative_eq!(est.a_to_b, truth(), epsilon = 1e-6);
    }

    #[test]
    fn estimate_reports_below_threshold() {
        let (kf_a, kf_b) = frame_pair();
        let params = RansacParams { min_inlier_count: 25, ..Default::default() };
        let estimator = RobustPairwiseEstimator::new(&MatchOnly, params);

        let err = estimator.estimate(&kf_a, &kf_b, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert_eq!(
            err,
            EstimateError::BelowInlierThreshold { inliers: 22, required: 25, candidates: 22, matches: 30 }
        );
    }

    #[test]
    fn estimate_without_candidates_fails_fast() {
        let (kf_a, mut kf_b) = frame_pair();
        for p in kf_b.keypoint_positions.iter_mut().skip(2) {
            p.valid = false;
        }
        let estimator = RobustPairwiseEstimator::new(&MatchOnly, RansacParams::default());

        let err = estimator.estimate(&kf_a, &kf_b, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert_eq!(err, EstimateError::InsufficientCandidates { found: 0, required: 3, matches: 30 });
    }
}
