use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;

use crate::types::{DepthImage, Extrinsics, Intrinsics, Keypoint, KeypointPosition};

/// Axial noise coefficient of a structured-light depth sensor, `σ_z = k·z²`.
const DEPTH_NOISE_COEFF: f64 = 1.425e-3;
/// Variance of a uniformly quantised pixel coordinate.
const PIXEL_VARIANCE: f64 = 1.0 / 12.0;

/// Returns a depth map in RGB resolution.  Missing pixels are `f32::NAN`.
pub fn align_depth_to_color(
    depth: &DepthImage,
    d_intr: &Intrinsics,
    c_intr: &Intrinsics,
    extr: &Extrinsics,
) -> DepthImage {
    let mut out = vec![f32::NAN; c_intr.width * c_intr.height];

    for v in 0..depth.height {
        for u in 0..depth.width {
            let d = depth.data[v * depth.width + u];
            if !d.is_finite() || d <= 0.0 { continue; }

            // 1. de-project
            let x = (u as f32 - d_intr.ppx) * d / d_intr.fx;
            let y = (v as f32 - d_intr.ppy) * d / d_intr.fy;

            // 2. transform
            let p_c = extr.rotation * Vector3::new(x, y, d) + extr.translation;
            if p_c.z <= 0.0 { continue; }

            // 3. project
            let u_c = ((p_c.x / p_c.z) * c_intr.fx + c_intr.ppx).round() as isize;
            let v_c = ((p_c.y / p_c.z) * c_intr.fy + c_intr.ppy).round() as isize;

            if u_c >= 0 && u_c < c_intr.width as isize &&
               v_c >= 0 && v_c < c_intr.height as isize {
                let idx = v_c as usize * c_intr.width + u_c as usize;
                // keep nearest sample to handle occlusion
                if !out[idx].is_finite() || p_c.z < out[idx] {
                    out[idx] = p_c.z;
                }
            }
        }
    }
    DepthImage {
        width: c_intr.width,
        height: c_intr.height,
        data: out,
        timestamp: depth.timestamp,
    }
}

/// Convert a 2‑D depth map into a Vec of 3‑D points in the camera frame.
pub fn depth_to_points(depth: &DepthImage, intr: &Intrinsics) -> Vec<[f32; 3]> {
    let fx = intr.fx;
    let fy = intr.fy;
    let cx = intr.ppx;
    let cy = intr.ppy;
    (0..depth.height)
        .into_par_iter()
        .flat_map_iter(|v| {
            (0..depth.width).filter_map(move |u| {
                let d = depth.data[v * depth.width + u];
                if d.is_finite() && d > 0.0 {
                    let x = (u as f32 - cx) * d / fx;
                    let y = (v as f32 - cy) * d / fy;
                    Some([x, y, d])
                } else {
                    None
                }
            })
        })
        .collect()
}

/// Limits applied when deciding whether a keypoint's depth can be trusted.
#[derive(Debug, Clone, Copy)]
pub struct DepthValidity {
    pub max_depth: f64,
    pub max_stdev_z: f64,
}

/// Standard deviation of a depth reading at range `z`.
pub fn depth_stdev(z: f64) -> f64 {
    DEPTH_NOISE_COEFF * z * z
}

/// Look up the 3D distribution behind a keypoint.
///
/// The mean is the back-projected depth at the rounded pixel. The covariance
/// propagates pixel quantisation and axial depth noise through the pinhole
/// model.
pub fn keypoint_position(
    depth: &DepthImage,
    intr: &Intrinsics,
    kp: &Keypoint,
    limits: &DepthValidity,
) -> KeypointPosition {
    if !(kp.x.is_finite() && kp.y.is_finite()) {
        return KeypointPosition::invalid();
    }
    let (u, v) = (kp.x.round(), kp.y.round());
    if u < 0.0 || v < 0.0 {
        return KeypointPosition::invalid();
    }
    let Some(d) = depth.at(u as usize, v as usize) else {
        return KeypointPosition::invalid();
    };
    if !d.is_finite() || d <= 0.0 {
        return KeypointPosition::invalid();
    }

    let z = d as f64;
    let sigma_z = depth_stdev(z);
    if z > limits.max_depth || sigma_z > limits.max_stdev_z {
        return KeypointPosition::invalid();
    }

    let fx = intr.fx as f64;
    let fy = intr.fy as f64;
    let du = u as f64 - intr.ppx as f64;
    let dv = v as f64 - intr.ppy as f64;
    let mean = Point3::new(du * z / fx, dv * z / fy, z);

    // J = d(x, y, z) / d(u, v, z)
    let jacobian = Matrix3::new(
        z / fx, 0.0, du / fx,
        0.0, z / fy, dv / fy,
        0.0, 0.0, 1.0,
    );
    let input_cov = Matrix3::from_diagonal(&Vector3::new(
        PIXEL_VARIANCE,
        PIXEL_VARIANCE,
        sigma_z * sigma_z,
    ));
    let covariance = jacobian * input_cov * jacobian.transpose();

    KeypointPosition {
        mean,
        covariance,
        valid: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics(width: usize, height: usize) -> Intrinsics {
        Intrinsics { width, height, fx: 500.0, fy: 500.0, ppx: width as f32 / 2.0, ppy: height as f32 / 2.0 }
    }

    fn limits() -> DepthValidity {
        DepthValidity { max_depth: 5.5, max_stdev_z: 0.03 }
    }

    #[test]
    fn back_projects_valid_pixels_only() {
        let intr = intrinsics(4, 2);
        let mut data = vec![1.0; 8];
        data[1] = f32::NAN;
        data[6] = 0.0;
        let depth = DepthImage::new(4, 2, 0.0, data);

        let cloud = depth_to_points(&depth, &intr);
        assert_eq!(cloud.len(), 6);
        assert!(cloud.iter().all(|p| p[2] == 1.0));
    }

    #[test]
    fn keypoint_at_principal_point_lies_on_axis() {
        let intr = intrinsics(10, 10);
        let depth = DepthImage::new(10, 10, 0.0, vec![2.0; 100]);
        let pos = keypoint_position(&depth, &intr, &Keypoint::new(5.0, 5.0, 1.0), &limits());

        assert!(pos.valid);
        assert_relative_eq!(pos.mean, Point3::new(0.0, 0.0, 2.0), epsilon = 1e-9);
        let sigma = depth_stdev(2.0);
        assert_relative_eq!(pos.covariance[(2, 2)], sigma * sigma, epsilon = 1e-12);
    }

    #[test]
    fn rejects_missing_far_and_outside_depth() {
        let intr = intrinsics(4, 4);
        let mut data = vec![1.0; 16];
        data[0] = f32::NAN;
        data[1] = 6.0;
        let depth = DepthImage::new(4, 4, 0.0, data);

        let missing = keypoint_position(&depth, &intr, &Keypoint::new(0.0, 0.0, 1.0), &limits());
        let far = keypoint_position(&depth, &intr, &Keypoint::new(1.0, 0.0, 1.0), &limits());
        let outside = keypoint_position(&depth, &intr, &Keypoint::new(9.0, 1.0, 1.0), &limits());
        assert!(!missing.valid);
        assert!(!far.valid);
        assert!(!outside.valid);
    }

    #[test]
    fn noisy_depth_is_invalid() {
        let intr = intrinsics(2, 2);
        // σ_z(5) ≈ 0.036 > 0.03
        let depth = DepthImage::new(2, 2, 0.0, vec![5.0; 4]);
        let pos = keypoint_position(&depth, &intr, &Keypoint::new(1.0, 1.0, 1.0), &limits());
        assert!(!pos.valid);
    }

    #[test]
    fn non_finite_keypoint_is_invalid() {
        let intr = intrinsics(4, 4);
        let depth = DepthImage::new(4, 4, 0.0, vec![1.0; 16]);
        for kp in [Keypoint::new(f32::NAN, 1.0, 1.0), Keypoint::new(1.0, f32::INFINITY, 1.0)] {
            assert!(!keypoint_position(&depth, &intr, &kp, &limits()).valid);
        }
    }

    #[test]
    fn identity_extrinsics_preserve_depth() {
        let intr = intrinsics(6, 4);
        let depth = DepthImage::new(6, 4, 1.5, vec![1.25; 24]);
        let extr = Extrinsics { rotation: Matrix3::identity(), translation: Vector3::zeros() };

        let aligned = align_depth_to_color(&depth, &intr, &intr, &extr);
        assert_eq!(aligned.data.len(), 24);
        assert_eq!(aligned.timestamp, 1.5);
        assert!(aligned.data.iter().all(|&d| (d - 1.25).abs() < 1e-6));
    }
}
