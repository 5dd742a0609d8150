//! Adaptive feature preparation.
//!
//! Scene texture varies between keyframes, so the detector threshold is
//! lowered until enough keypoints are found or a floor is reached.

use rayon::prelude::*;
use thiserror::Error;

use crate::config::FeatureConfig;
use crate::reproject::{keypoint_position, DepthValidity};
use crate::types::{Correspondence, Descriptor, Keyframe, Keypoint, RgbImage};

/// Keypoint detection, description and descriptor matching.
///
/// `Sync` so that matching can run from parallel pair evaluation.
pub trait FeatureBackend: Sync {
    /// Keypoints whose detector response is at least `threshold`.
    fn detect(&self, image: &RgbImage, threshold: f64) -> Vec<Keypoint>;

    /// One descriptor per keypoint, in the same order.
    fn describe(&self, image: &RgbImage, keypoints: &[Keypoint]) -> Vec<Descriptor>;

    /// Nearest reference descriptor (L2) for every query descriptor.
    fn match_nearest(&self, query: &[Descriptor], reference: &[Descriptor]) -> Vec<Correspondence> {
        if reference.is_empty() {
            return Vec::new();
        }
        query
            .par_iter()
            .enumerate()
            .filter_map(|(query_idx, q)| {
                reference
                    .iter()
                    .enumerate()
                    .map(|(train_idx, r)| (train_idx, descriptor_distance(q, r)))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(train_idx, distance)| Correspondence { query_idx, train_idx, distance })
            })
            .collect()
    }
}

/// Euclidean distance between two descriptors.
pub fn descriptor_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("backend returned {descriptors} descriptors for {keypoints} keypoints")]
    DescriptorCountMismatch { keypoints: usize, descriptors: usize },
}

/// Summary of one keyframe's preparation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedFeatures {
    /// Threshold of the detection that was kept.
    pub threshold: f64,
    pub keypoints: usize,
    pub valid_positions: usize,
    pub detection_passes: usize,
}

pub struct FeaturePreparer<'a, B: FeatureBackend + ?Sized> {
    backend: &'a B,
    config: FeatureConfig,
}

impl<'a, B: FeatureBackend + ?Sized> FeaturePreparer<'a, B> {
    pub fn new(backend: &'a B, config: FeatureConfig) -> Self {
        Self { backend, config }
    }

    /// Detect, describe and locate the keyframe's features, replacing any
    /// previous ones.
    pub fn prepare(&self, keyframe: &mut Keyframe) -> Result<PreparedFeatures, FeatureError> {
        let (keypoints, threshold, detection_passes) = self.detect_adaptive(&keyframe.image);

        let descriptors = self.backend.describe(&keyframe.image, &keypoints);
        if descriptors.len() != keypoints.len() {
            return Err(FeatureError::DescriptorCountMismatch {
                keypoints: keypoints.len(),
                descriptors: descriptors.len(),
            });
        }

        let limits = DepthValidity {
            max_depth: self.config.max_keypoint_depth,
            max_stdev_z: self.config.max_keypoint_depth_stdev,
        };
        let positions: Vec<_> = keypoints
            .iter()
            .map(|kp| keypoint_position(&keyframe.depth, &keyframe.intrinsics, kp, &limits))
            .collect();

        let prepared = PreparedFeatures {
            threshold,
            keypoints: keypoints.len(),
            valid_positions: positions.iter().filter(|p| p.valid).count(),
            detection_passes,
        };
        keyframe.set_features(keypoints, descriptors, positions);
        Ok(prepared)
    }

    /// Prepare every keyframe once, in index order.
    pub fn prepare_all(&self, keyframes: &mut [Keyframe]) -> Result<Vec<PreparedFeatures>, FeatureError> {
        keyframes
            .iter_mut()
            .enumerate()
            .map(|(kf_idx, keyframe)| {
                let prepared = self.prepare(keyframe)?;
                tracing::debug!(
                    kf_idx,
                    keypoints = prepared.keypoints,
                    valid = prepared.valid_positions,
                    threshold = prepared.threshold,
                    "features prepared"
                );
                Ok(prepared)
            })
            .collect()
    }

    fn detect_adaptive(&self, image: &RgbImage) -> (Vec<Keypoint>, f64, usize) {
        let mut threshold = self.config.initial_detector_threshold;
        let mut accepted = threshold;
        let mut keypoints = Vec::new();
        let mut passes = 0;

        // a non-positive floor still ends once halving reaches zero
        while threshold >= self.config.min_detector_threshold && threshold > 0.0 {
            keypoints = self.backend.detect(image, threshold);
            accepted = threshold;
            passes += 1;
            tracing::debug!(count = keypoints.len(), threshold, "detection pass");

            if keypoints.len() < self.config.target_keypoint_count {
                threshold /= 2.0;
            } else {
                break;
            }
        }

        (keypoints, accepted, passes)
    }
}
