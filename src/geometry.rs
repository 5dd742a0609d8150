//! Closed-form least-squares rigid motion between corresponding 3D points.
//!
//! The estimate maps source points onto target points (`t ≈ R·s + t₀`) and
//! uses the SVD of the cross-covariance with a reflection guard.

use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Running first and second moments of a correspondence set.
///
/// Adding a pair is O(1) so a transform can be refit after every accepted
/// inlier without revisiting the whole set.
#[derive(Debug, Clone)]
pub struct RigidAccumulator {
    count: usize,
    sum_source: Vector3<f64>,
    sum_target: Vector3<f64>,
    // Σ target · sourceᵀ
    sum_cross: Matrix3<f64>,
}

impl Default for RigidAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            sum_source: Vector3::zeros(),
            sum_target: Vector3::zeros(),
            sum_cross: Matrix3::zeros(),
        }
    }
}

impl RigidAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, source: &Point3<f64>, target: &Point3<f64>) {
        self.count += 1;
        self.sum_source += source.coords;
        self.sum_target += target.coords;
        self.sum_cross += target.coords * source.coords.transpose();
    }

    /// Best rigid transform for the accumulated pairs, or `None` with fewer
    /// than three pairs or a failed decomposition.
    pub fn solve(&self) -> Option<Isometry3<f64>> {
        if self.count < 3 {
            return None;
        }
        let n = self.count as f64;
        let centroid_source = self.sum_source / n;
        let centroid_target = self.sum_target / n;

        // H = Σ (t - c_t)(s - c_s)ᵀ
        let h = self.sum_cross - n * centroid_target * centroid_source.transpose();
        if !h.iter().all(|v| v.is_finite()) {
            return None;
        }

        let svd = h.svd(true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;

        let mut rotation = u * v_t;
        if rotation.determinant() < 0.0 {
            // Flip the axis of the weakest singular direction.
            let weakest = svd.singular_values.imin();
            let mut u_fixed = u;
            for i in 0..3 {
                u_fixed[(i, weakest)] = -u_fixed[(i, weakest)];
            }
            rotation = u_fixed * v_t;
        }

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation));
        let translation = centroid_target - rotation * centroid_source;

        Some(Isometry3::from_parts(Translation3::from(translation), rotation))
    }
}

/// Rigid transform mapping `source[i]` onto `target[i]` in the least-squares
/// sense.
pub fn estimate_rigid_transform(source: &[Point3<f64>], target: &[Point3<f64>]) -> Option<Isometry3<f64>> {
    if source.len() != target.len() {
        return None;
    }
    let mut acc = RigidAccumulator::new();
    for (s, t) in source.iter().zip(target) {
        acc.add(s, t);
    }
    acc.solve()
}
