//! Loop detection between posed RGB-D keyframes.
//!
//! Features are prepared on every keyframe, candidate pairs are picked by a
//! [`PairStrategy`], and each pair is either trusted from odometry or
//! verified with feature RANSAC. Operator-confirmed pairs can be refined by
//! dense alignment.
//!
//! ```no_run
//! # use rgbd_loop_detector::{FeatureBackend, Keyframe, LoopDetector, LoopDetectorConfig};
//! # fn demo<B: FeatureBackend>(backend: B, keyframes: &mut [Keyframe]) -> anyhow::Result<()> {
//! let config = LoopDetectorConfig::load("loop_detector.toml")?;
//! let detector = LoopDetector::new(backend, config);
//! for edge in detector.run(keyframes)? {
//!     println!("{} -> {}: {:?}", edge.index_a, edge.index_b, edge.kind);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dense;
pub mod detector;
pub mod diagnostics;
pub mod features;
pub mod geometry;
pub mod pairs;
pub mod ransac;
pub mod reproject;
pub mod types;

pub use config::{ConfigError, DenseConfig, FeatureConfig, LoopDetectorConfig, RansacConfig};
pub use dense::{DenseAlignError, DenseAligner, IcpAligner, IcpConfig};
pub use detector::LoopDetector;
pub use diagnostics::{DiagnosticEvent, DiagnosticsSink, RecordingSink, TracingSink};
pub use features::{FeatureBackend, FeatureError, FeaturePreparer, PreparedFeatures};
pub use pairs::{CandidatePair, PairSelector, PairStrategy};
pub use ransac::{EstimateError, PairwiseEstimate, RansacParams, RobustPairwiseEstimator};
pub use types::{
    Association, AssociationKind, Correspondence, DepthImage, Descriptor, Extrinsics, Intrinsics,
    Keyframe, Keypoint, KeypointPosition, RgbImage,
};
