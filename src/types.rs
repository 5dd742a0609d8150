use std::sync::OnceLock;

use nalgebra::{Isometry3, Matrix3, Point3, Vector3};
use ndarray::{Array2, Array3};

use crate::reproject::{align_depth_to_color, depth_to_points};

/// Colour image, `rows x cols x 3` (RGB8).
pub type RgbImage = Array3<u8>;

/// Feature descriptor vector (SURF-style floats).
pub type Descriptor = Vec<f32>;

/// Pinhole camera model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub width: usize,
    pub height: usize,
    pub fx: f32,
    pub fy: f32,
    pub ppx: f32,
    pub ppy: f32,
}

/// Rigid transform from the depth sensor to the colour sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Extrinsics {
    pub rotation: Matrix3<f32>,
    pub translation: Vector3<f32>,
}

/// Metric depth map. Missing pixels are `NaN` or non-positive.
#[derive(Debug, Clone)]
pub struct DepthImage {
    pub width: usize,
    pub height: usize,
    pub timestamp: f64,
    pub data: Vec<f32>, // distances in meters
}

impl DepthImage {
    pub fn new(width: usize, height: usize, timestamp: f64, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self { width, height, timestamp, data }
    }

    pub fn from_array(depth: &Array2<f32>, timestamp: f64) -> Self {
        let (height, width) = depth.dim();
        Self {
            width,
            height,
            timestamp,
            data: depth.iter().copied().collect(),
        }
    }

    /// Depth at integer pixel `(u, v)`, or `None` when outside the image.
    pub fn at(&self, u: usize, v: usize) -> Option<f32> {
        if u < self.width && v < self.height {
            Some(self.data[v * self.width + u])
        } else {
            None
        }
    }
}

/// A detected 2D interest point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Detector response; stronger features have larger values.
    pub response: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, response: f32) -> Self {
        Self { x, y, response }
    }
}

/// 3D position of a keypoint in the sensor frame together with its
/// uncertainty. `valid` is false when depth was missing or unreliable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeypointPosition {
    pub mean: Point3<f64>,
    pub covariance: Matrix3<f64>,
    pub valid: bool,
}

impl KeypointPosition {
    pub fn invalid() -> Self {
        Self {
            mean: Point3::origin(),
            covariance: Matrix3::zeros(),
            valid: false,
        }
    }
}

/// Tentative feature match between keyframe b (query) and keyframe a (train).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index into b's keypoints.
    pub query_idx: usize,
    /// Index into a's keypoints.
    pub train_idx: usize,
    /// Distance in descriptor space.
    pub distance: f32,
}

/// A posed RGB-D snapshot.
///
/// Keyframes are created and posed upstream. The feature fields are
/// (re)written by [`crate::features::FeaturePreparer`] and read-only
/// afterwards. The dense cloud is built on first access.
#[derive(Debug)]
pub struct Keyframe {
    pub pose: Isometry3<f64>,
    pub image: RgbImage,
    /// Depth registered to `image`.
    pub depth: DepthImage,
    pub intrinsics: Intrinsics,
    pub manually_added: bool,

    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    pub keypoint_positions: Vec<KeypointPosition>,

    cloud: OnceLock<Vec<[f32; 3]>>,
}

impl Keyframe {
    pub fn new(
        pose: Isometry3<f64>,
        image: RgbImage,
        depth: DepthImage,
        intrinsics: Intrinsics,
    ) -> Self {
        Self {
            pose,
            image,
            depth,
            intrinsics,
            manually_added: false,
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            keypoint_positions: Vec::new(),
            cloud: OnceLock::new(),
        }
    }

    /// Build a keyframe from a depth map that is still in the depth sensor's
    /// frame, registering it to the colour camera first.
    pub fn from_unregistered_depth(
        pose: Isometry3<f64>,
        image: RgbImage,
        depth: &DepthImage,
        depth_intrinsics: &Intrinsics,
        color_intrinsics: Intrinsics,
        extrinsics: &Extrinsics,
    ) -> Self {
        let registered = align_depth_to_color(depth, depth_intrinsics, &color_intrinsics, extrinsics);
        Self::new(pose, image, registered, color_intrinsics)
    }

    pub fn with_manually_added(mut self, manually_added: bool) -> Self {
        self.manually_added = manually_added;
        self
    }

    /// Dense cloud in the sensor frame, back-projected from `depth`.
    pub fn point_cloud(&self) -> &[[f32; 3]] {
        self.cloud
            .get_or_init(|| depth_to_points(&self.depth, &self.intrinsics))
    }

    /// Number of keypoints with a usable 3D position.
    pub fn valid_keypoint_count(&self) -> usize {
        self.keypoint_positions.iter().filter(|p| p.valid).count()
    }

    /// Overwrite the feature fields.
    pub(crate) fn set_features(
        &mut self,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor>,
        keypoint_positions: Vec<KeypointPosition>,
    ) {
        self.keypoints = keypoints;
        self.descriptors = descriptors;
        self.keypoint_positions = keypoint_positions;
    }
}

/// Which kind of evidence produced an [`Association`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Chained keyframe poses of time-consecutive frames.
    Odometry,
    /// Feature RANSAC with at least the configured inlier count.
    Ransac,
    /// Operator-requested dense refinement.
    DenseRefinement,
}

/// A pose-graph edge between two keyframes.
///
/// `a_to_b` is the pose of keyframe b expressed in keyframe a's frame: it
/// maps points from b's sensor frame into a's, and for consistent poses
/// equals `pose_a⁻¹ · pose_b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub index_a: usize,
    pub index_b: usize,
    pub a_to_b: Isometry3<f64>,
    pub inliers: Vec<Correspondence>,
    pub kind: AssociationKind,
}

impl Association {
    /// Edge taken directly from the chained poses of two keyframes.
    pub fn from_odometry(index_a: usize, index_b: usize, keyframes: &[Keyframe]) -> Self {
        let a_to_b = relative_pose(&keyframes[index_a], &keyframes[index_b]);
        Self {
            index_a,
            index_b,
            a_to_b,
            inliers: Vec::new(),
            kind: AssociationKind::Odometry,
        }
    }
}

/// `pose_a⁻¹ · pose_b`.
pub fn relative_pose(a: &Keyframe, b: &Keyframe) -> Isometry3<f64> {
    a.pose.inverse() * b.pose
}
