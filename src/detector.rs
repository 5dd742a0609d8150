//! Keyframe loop detection: feature preparation, pair selection and
//! per-pair verification.

use std::time::Instant;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::LoopDetectorConfig;
use crate::dense::{refine_pair, DenseAlignError, DenseAligner, IcpAligner, IcpConfig};
use crate::diagnostics::DiagnosticsSink;
use crate::features::{FeatureBackend, FeaturePreparer, PreparedFeatures};
use crate::pairs::{CandidatePair, PairSelector};
use crate::ransac::{RansacParams, RobustPairwiseEstimator};
use crate::types::{Association, AssociationKind, Keyframe};

/// Per-pair seed from the run seed and the pair's position in the
/// candidate list.
fn pair_seed(base: u64, ordinal: usize) -> u64 {
    base ^ (ordinal as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub struct LoopDetector<B: FeatureBackend, D: DenseAligner = IcpAligner> {
    backend: B,
    aligner: D,
    config: LoopDetectorConfig,
    sink: Option<Box<dyn DiagnosticsSink>>,
}

impl<B: FeatureBackend> LoopDetector<B, IcpAligner> {
    /// Detector with the bundled ICP aligner configured from `config.dense`.
    pub fn new(backend: B, config: LoopDetectorConfig) -> Self {
        let aligner = IcpAligner::new(IcpConfig::from(&config.dense));
        Self::with_aligner(backend, aligner, config)
    }
}

impl<B: FeatureBackend, D: DenseAligner> LoopDetector<B, D> {
    pub fn with_aligner(backend: B, aligner: D, config: LoopDetectorConfig) -> Self {
        Self { backend, aligner, config, sink: None }
    }

    pub fn with_sink(mut self, sink: impl DiagnosticsSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Prepare features for every keyframe and verify every candidate pair.
    ///
    /// Only an invalid configuration or a misbehaving feature backend fails
    /// the run. Pairs that cannot be verified are left out of the result.
    pub fn run(&self, keyframes: &mut [Keyframe]) -> anyhow::Result<Vec<Association>> {
        self.config.validate().context("invalid loop detector configuration")?;

        let t0 = Instant::now();
        info!(
            keyframes = keyframes.len(),
            strategy = ?self.config.strategy,
            "generating keyframe associations"
        );

        self.prepare_features(keyframes)?;
        let associations = self.associate(keyframes);

        info!(
            "{} associations ({} odometry, {} ransac) in {:?}",
            associations.len(),
            associations.iter().filter(|a| a.kind == AssociationKind::Odometry).count(),
            associations.iter().filter(|a| a.kind == AssociationKind::Ransac).count(),
            t0.elapsed()
        );
        Ok(associations)
    }

    /// Detect, describe and locate features on every keyframe.
    pub fn prepare_features(&self, keyframes: &mut [Keyframe]) -> anyhow::Result<Vec<PreparedFeatures>> {
        let t0 = Instant::now();
        let preparer = FeaturePreparer::new(&self.backend, self.config.features);
        let prepared = preparer
            .prepare_all(keyframes)
            .context("feature preparation failed")?;

        if let Some(sink) = &self.sink {
            for (kf_idx, (keyframe, summary)) in keyframes.iter().zip(&prepared).enumerate() {
                sink.keypoints_prepared(kf_idx, keyframe, summary);
            }
        }
        debug!("prepared {} keyframes in {:?}", prepared.len(), t0.elapsed());
        Ok(prepared)
    }

    /// Select candidate pairs on prepared keyframes and verify each one.
    /// Output follows the order in which pairs were selected.
    pub fn associate(&self, keyframes: &[Keyframe]) -> Vec<Association> {
        let pairs = PairSelector::new(self.config.strategy.clone()).select(keyframes);
        debug!(pairs = pairs.len(), "candidate pairs selected");

        let params = RansacParams::from_config(&self.config.ransac, self.config.max_euclidean_dist());
        let estimator = RobustPairwiseEstimator::new(&self.backend, params);
        let base_seed = self.config.seed.unwrap_or_else(rand::random);

        let evaluate = |(ordinal, pair): (usize, &CandidatePair)| {
            self.evaluate_pair(&estimator, keyframes, pair, pair_seed(base_seed, ordinal))
        };

        let results: Vec<Option<Association>> = if self.config.parallel {
            pairs.par_iter().enumerate().map(evaluate).collect()
        } else {
            pairs.iter().enumerate().map(evaluate).collect()
        };
        results.into_iter().flatten().collect()
    }

    fn evaluate_pair(
        &self,
        estimator: &RobustPairwiseEstimator<'_, B>,
        keyframes: &[Keyframe],
        pair: &CandidatePair,
        seed: u64,
    ) -> Option<Association> {
        let (a, b) = (pair.index_a, pair.index_b);
        let (kf_a, kf_b) = (&keyframes[a], &keyframes[b]);

        if pair.odometry_only {
            let association = Association::from_odometry(a, b, keyframes);
            self.notify(|sink| sink.pair_verified(kf_a, kf_b, &association));
            return Some(association);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        match estimator.estimate(kf_a, kf_b, &mut rng) {
            Ok(estimate) => {
                info!(
                    "[RANSAC {} -> {}] OK   ({} / {})",
                    a,
                    b,
                    estimate.inliers.len(),
                    estimate.match_count
                );
                let association = Association {
                    index_a: a,
                    index_b: b,
                    a_to_b: estimate.a_to_b,
                    inliers: estimate.inliers,
                    kind: AssociationKind::Ransac,
                };
                self.notify(|sink| sink.pair_verified(kf_a, kf_b, &association));
                Some(association)
            }
            Err(err) => {
                info!("[RANSAC {} -> {}] FAIL ({})", a, b, err);
                self.notify(|sink| sink.pair_rejected(a, b, kf_a, kf_b, &err));
                None
            }
        }
    }

    /// Operator-requested edge between two prepared keyframes, refined by
    /// dense alignment from their current relative pose.
    pub fn add_manual_association(
        &self,
        keyframes: &[Keyframe],
        index_a: usize,
        index_b: usize,
    ) -> Result<Association, DenseAlignError> {
        let (kf_a, kf_b) = (&keyframes[index_a], &keyframes[index_b]);
        let t0 = Instant::now();

        match refine_pair(&self.aligner, kf_a, kf_b, &self.config.dense) {
            Ok(a_to_b) => {
                info!("[DENSE {} -> {}] OK in {:?}", index_a, index_b, t0.elapsed());
                let association = Association {
                    index_a,
                    index_b,
                    a_to_b,
                    inliers: Vec::new(),
                    kind: AssociationKind::DenseRefinement,
                };
                self.notify(|sink| sink.pair_verified(kf_a, kf_b, &association));
                Ok(association)
            }
            Err(err) => {
                warn!("[DENSE {} -> {}] FAIL ({})", index_a, index_b, err);
                self.notify(|sink| sink.dense_refinement_failed(index_a, index_b, &err));
                Err(err)
            }
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn DiagnosticsSink)) {
        if let Some(sink) = &self.sink {
            f(sink.as_ref());
        }
    }
}
