//! Loop detector configuration.
//!
//! All sections have defaults, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! seed = 7
//! parallel = false
//!
//! [strategy]
//! kind = "ring"
//! neighbors = 3
//!
//! [features]
//! initial_detector_threshold = 400.0
//! min_detector_threshold = 25.0
//! target_keypoint_count = 200
//!
//! [ransac]
//! max_iterations = 2000
//! max_descriptor_dist = 10.0
//! target_inlier_ratio = 0.75
//! min_inlier_count = 20
//! # max_euclidean_dist = 0.05   # defaults per strategy
//!
//! [dense]
//! voxel_size = 0.02
//! max_range = 5.0
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pairs::PairStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Adaptive detection and keypoint depth limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Detector response threshold of the first pass.
    pub initial_detector_threshold: f64,
    /// The threshold is halved while it stays at or above this floor.
    pub min_detector_threshold: f64,
    /// Detection stops lowering the threshold once this many keypoints are found.
    pub target_keypoint_count: usize,
    /// Keypoints farther than this (meters) get no 3D position.
    pub max_keypoint_depth: f64,
    /// Keypoints whose axial depth noise exceeds this (meters) get no 3D position.
    pub max_keypoint_depth_stdev: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            initial_detector_threshold: 400.0,
            min_detector_threshold: 25.0,
            target_keypoint_count: 200,
            max_keypoint_depth: 5.5,
            max_keypoint_depth_stdev: 0.03,
        }
    }
}

/// RANSAC verification of candidate pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    pub max_iterations: usize,
    /// Inlier distance (meters). `None` uses the pair strategy's default.
    pub max_euclidean_dist: Option<f64>,
    pub max_descriptor_dist: f32,
    /// Stop early once this fraction of candidates are inliers.
    pub target_inlier_ratio: f64,
    pub min_inlier_count: usize,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            max_euclidean_dist: None,
            max_descriptor_dist: 10.0,
            target_inlier_ratio: 0.75,
            min_inlier_count: 20,
        }
    }
}

/// Dense refinement of operator-confirmed pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseConfig {
    /// Voxel leaf size for down-sampling (meters).
    pub voxel_size: f32,
    /// Points beyond this depth along the optical axis are dropped (meters).
    pub max_range: f32,
    pub max_iterations: usize,
    /// Correspondences farther apart than this are ignored (meters).
    pub max_correspondence_distance: f64,
    pub translation_epsilon: f64,
    pub rotation_epsilon: f64,
    pub min_correspondences: usize,
    /// Alignments ending above this RMSE are rejected (meters).
    pub max_rmse: f64,
}

impl Default for DenseConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.02,
            max_range: 5.0,
            max_iterations: 20,
            max_correspondence_distance: 0.40,
            translation_epsilon: 5e-4,
            rotation_epsilon: 2e-3,
            min_correspondences: 10,
            max_rmse: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    pub strategy: PairStrategy,
    pub features: FeatureConfig,
    pub ransac: RansacConfig,
    pub dense: DenseConfig,
    /// Seed of the sampling streams. Drawn from entropy when absent.
    pub seed: Option<u64>,
    /// Evaluate candidate pairs on the rayon pool.
    pub parallel: bool,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            strategy: PairStrategy::default(),
            features: FeatureConfig::default(),
            ransac: RansacConfig::default(),
            dense: DenseConfig::default(),
            seed: None,
            parallel: false,
        }
    }
}

impl LoopDetectorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Inlier distance for the active strategy.
    pub fn max_euclidean_dist(&self) -> f64 {
        self.ransac
            .max_euclidean_dist
            .unwrap_or_else(|| self.strategy.default_max_euclidean_dist())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.features;
        if !(f.min_detector_threshold > 0.0) {
            return Err(invalid("features.min_detector_threshold must be positive"));
        }
        if f.initial_detector_threshold < f.min_detector_threshold {
            return Err(invalid("features.initial_detector_threshold is below the floor"));
        }

        let r = &self.ransac;
        if r.max_iterations == 0 {
            return Err(invalid("ransac.max_iterations must be at least 1"));
        }
        if !(r.target_inlier_ratio > 0.0 && r.target_inlier_ratio <= 1.0) {
            return Err(invalid("ransac.target_inlier_ratio must be in (0, 1]"));
        }
        if !(self.max_euclidean_dist() > 0.0) {
            return Err(invalid("ransac.max_euclidean_dist must be positive"));
        }
        if r.min_inlier_count < 3 {
            return Err(invalid("ransac.min_inlier_count must be at least 3"));
        }

        let d = &self.dense;
        if !(d.voxel_size > 0.0) || !(d.max_range > 0.0) {
            return Err(invalid("dense.voxel_size and dense.max_range must be positive"));
        }

        self.strategy.validate().map_err(ConfigError::Invalid)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
