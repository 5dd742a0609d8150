//! Dense refinement of operator-confirmed keyframe pairs.
//!
//! The core prepares both clouds (range filter along the optical axis, then
//! voxel-grid down-sampling) and hands them to a [`DenseAligner`] together
//! with the pair's current relative pose as the initial guess.

use std::collections::BTreeMap;
use std::time::Instant;

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use nalgebra::{Isometry3, Point3};
use thiserror::Error;

use crate::config::DenseConfig;
use crate::geometry::RigidAccumulator;
use crate::types::{relative_pose, Keyframe};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DenseAlignError {
    #[error("cloud has {found} points, need {required}")]
    NotEnoughPoints { found: usize, required: usize },

    #[error("only {found} correspondences within range, need {required}")]
    NotEnoughCorrespondences { found: usize, required: usize },

    #[error("alignment ended with rmse {rmse:.4} m")]
    Diverged { rmse: f64 },

    #[error("correspondences do not constrain a rigid motion")]
    Degenerate,
}

/// Refines the pose of `source` relative to `target`.
///
/// `initial_guess` maps source points into the target's frame; the result
/// is the refined version of that transform.
pub trait DenseAligner: Sync {
    fn align(
        &self,
        source: &[Point3<f64>],
        target: &[Point3<f64>],
        initial_guess: &Isometry3<f64>,
    ) -> Result<Isometry3<f64>, DenseAlignError>;
}

/// Keep points with `0 < z <= max_range` in the sensor frame.
pub fn range_filter(points: &[[f32; 3]], max_range: f32) -> Vec<[f32; 3]> {
    points
        .iter()
        .filter(|p| p[2] > 0.0 && p[2] <= max_range)
        .copied()
        .collect()
}

/// Replace all points of each occupied voxel by their centroid.
///
/// Output is ordered by voxel key, so it does not depend on input order.
pub fn voxel_downsample(points: &[[f32; 3]], leaf: f32) -> Vec<Point3<f64>> {
    let leaf = leaf as f64;
    let mut voxels: BTreeMap<(i64, i64, i64), ([f64; 3], usize)> = BTreeMap::new();
    for p in points {
        let (x, y, z) = (p[0] as f64, p[1] as f64, p[2] as f64);
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            continue;
        }
        let key = (
            (x / leaf).floor() as i64,
            (y / leaf).floor() as i64,
            (z / leaf).floor() as i64,
        );
        let entry = voxels.entry(key).or_insert(([0.0; 3], 0));
        entry.0[0] += x;
        entry.0[1] += y;
        entry.0[2] += z;
        entry.1 += 1;
    }
    voxels
        .into_values()
        .map(|(sum, n)| {
            let n = n as f64;
            Point3::new(sum[0] / n, sum[1] / n, sum[2] / n)
        })
        .collect()
}

/// Range-filtered, down-sampled copy of a keyframe's dense cloud.
pub fn prepare_cloud(keyframe: &Keyframe, config: &DenseConfig) -> Vec<Point3<f64>> {
    let in_range = range_filter(keyframe.point_cloud(), config.max_range);
    voxel_downsample(&in_range, config.voxel_size)
}

/// Refine the relative pose of `b` with respect to `a`.
pub fn refine_pair<D: DenseAligner + ?Sized>(
    aligner: &D,
    keyframe_a: &Keyframe,
    keyframe_b: &Keyframe,
    config: &DenseConfig,
) -> Result<Isometry3<f64>, DenseAlignError> {
    let target = prepare_cloud(keyframe_a, config);
    let source = prepare_cloud(keyframe_b, config);
    let initial_guess = relative_pose(keyframe_a, keyframe_b);
    tracing::debug!(source = source.len(), target = target.len(), "dense alignment input");
    aligner.align(&source, &target, &initial_guess)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IcpConfig {
    pub max_iterations: usize,
    pub max_correspondence_distance: f64,
    pub translation_epsilon: f64,
    pub rotation_epsilon: f64,
    pub min_correspondences: usize,
    pub max_rmse: f64,
}

impl From<&DenseConfig> for IcpConfig {
    fn from(c: &DenseConfig) -> Self {
        Self {
            max_iterations: c.max_iterations,
            max_correspondence_distance: c.max_correspondence_distance,
            translation_epsilon: c.translation_epsilon,
            rotation_epsilon: c.rotation_epsilon,
            min_correspondences: c.min_correspondences,
            max_rmse: c.max_rmse,
        }
    }
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self::from(&DenseConfig::default())
    }
}

/// Point-to-point ICP over a k-d tree of the target cloud.
#[derive(Debug, Clone, Default)]
pub struct IcpAligner {
    config: IcpConfig,
}

impl IcpAligner {
    pub fn new(config: IcpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    /// Squared-distance-gated correspondences under `transform`, accumulated
    /// as (transformed source, target) pairs.
    fn correspondences(
        &self,
        source: &[Point3<f64>],
        target: &[Point3<f64>],
        tree: &ImmutableKdTree<f64, 3>,
        transform: &Isometry3<f64>,
    ) -> (RigidAccumulator, f64) {
        let max_dist_sq = self.config.max_correspondence_distance.powi(2);
        let mut acc = RigidAccumulator::new();
        let mut sum_sq = 0.0;
        for s in source {
            let p = transform * s;
            let nearest = tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y, p.z]);
            if nearest.distance <= max_dist_sq {
                acc.add(&p, &target[nearest.item as usize]);
                sum_sq += nearest.distance;
            }
        }
        (acc, sum_sq)
    }
}

impl DenseAligner for IcpAligner {
    fn align(
        &self,
        source: &[Point3<f64>],
        target: &[Point3<f64>],
        initial_guess: &Isometry3<f64>,
    ) -> Result<Isometry3<f64>, DenseAlignError> {
        let required = self.config.min_correspondences.max(3);
        for cloud in [source, target] {
            if cloud.len() < required {
                return Err(DenseAlignError::NotEnoughPoints { found: cloud.len(), required });
            }
        }

        let t0 = Instant::now();
        // bulk-built so flat or quantised clouds with repeated coordinates are fine
        let coords: Vec<[f64; 3]> = target.iter().map(|p| [p.x, p.y, p.z]).collect();
        let tree: ImmutableKdTree<f64, 3> = ImmutableKdTree::new_from_slice(&coords);

        let mut transform = *initial_guess;
        let mut iterations = 0;
        for _ in 0..self.config.max_iterations {
            iterations += 1;
            let (acc, _) = self.correspondences(source, target, &tree, &transform);
            if acc.len() < required {
                return Err(DenseAlignError::NotEnoughCorrespondences { found: acc.len(), required });
            }
            let delta = acc.solve().ok_or(DenseAlignError::Degenerate)?;
            transform = delta * transform;

            if delta.translation.vector.norm() < self.config.translation_epsilon
                && delta.rotation.angle() < self.config.rotation_epsilon
            {
                break;
            }
        }

        let (acc, sum_sq) = self.correspondences(source, target, &tree, &transform);
        if acc.len() < required {
            return Err(DenseAlignError::NotEnoughCorrespondences { found: acc.len(), required });
        }
        let rmse = (sum_sq / acc.len() as f64).sqrt();
        tracing::debug!(iterations, rmse, "ICP in {:?}", t0.elapsed());

        if !rmse.is_finite() || rmse > self.config.max_rmse {
            return Err(DenseAlignError::Diverged { rmse });
        }
        Ok(transform)
    }
}
