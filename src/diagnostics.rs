use std::sync::Mutex;

use crate::dense::DenseAlignError;
use crate::features::PreparedFeatures;
use crate::ransac::EstimateError;
use crate::types::{Association, Keyframe};

/// Observer of loop detection events, e.g. for dumping keypoint or match
/// images. Every method defaults to doing nothing.
pub trait DiagnosticsSink: Send + Sync {
    fn keypoints_prepared(&self, _kf_idx: usize, _keyframe: &Keyframe, _prepared: &PreparedFeatures) {}

    fn pair_verified(&self, _keyframe_a: &Keyframe, _keyframe_b: &Keyframe, _association: &Association) {}

    fn pair_rejected(
        &self,
        _index_a: usize,
        _index_b: usize,
        _keyframe_a: &Keyframe,
        _keyframe_b: &Keyframe,
        _error: &EstimateError,
    ) {
    }

    fn dense_refinement_failed(&self, _index_a: usize, _index_b: usize, _error: &DenseAlignError) {}
}

/// Emits every event as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn keypoints_prepared(&self, kf_idx: usize, _keyframe: &Keyframe, prepared: &PreparedFeatures) {
        tracing::debug!(
            kf_idx,
            keypoints = prepared.keypoints,
            valid = prepared.valid_positions,
            threshold = prepared.threshold,
            passes = prepared.detection_passes,
            "keypoints"
        );
    }

    fn pair_verified(&self, _keyframe_a: &Keyframe, _keyframe_b: &Keyframe, association: &Association) {
        tracing::debug!(
            a = association.index_a,
            b = association.index_b,
            kind = ?association.kind,
            inliers = association.inliers.len(),
            "pair verified"
        );
    }

    fn pair_rejected(
        &self,
        index_a: usize,
        index_b: usize,
        _keyframe_a: &Keyframe,
        _keyframe_b: &Keyframe,
        error: &EstimateError,
    ) {
        tracing::debug!(a = index_a, b = index_b, %error, "pair rejected");
    }

    fn dense_refinement_failed(&self, index_a: usize, index_b: usize, error: &DenseAlignError) {
        tracing::debug!(a = index_a, b = index_b, %error, "dense refinement failed");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    KeypointsPrepared { kf_idx: usize, prepared: PreparedFeatures },
    PairVerified { index_a: usize, index_b: usize, inliers: usize },
    PairRejected { index_a: usize, index_b: usize, error: EstimateError },
    DenseRefinementFailed { index_a: usize, index_b: usize, error: DenseAlignError },
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: DiagnosticEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl DiagnosticsSink for RecordingSink {
    fn keypoints_prepared(&self, kf_idx: usize, _keyframe: &Keyframe, prepared: &PreparedFeatures) {
        self.push(DiagnosticEvent::KeypointsPrepared { kf_idx, prepared: *prepared });
    }

    fn pair_verified(&self, _keyframe_a: &Keyframe, _keyframe_b: &Keyframe, association: &Association) {
        self.push(DiagnosticEvent::PairVerified {
            index_a: association.index_a,
            index_b: association.index_b,
            inliers: association.inliers.len(),
        });
    }

    fn pair_rejected(
        &self,
        index_a: usize,
        index_b: usize,
        _keyframe_a: &Keyframe,
        _keyframe_b: &Keyframe,
        error: &EstimateError,
    ) {
        self.push(DiagnosticEvent::PairRejected { index_a, index_b, error: error.clone() });
    }

    fn dense_refinement_failed(&self, index_a: usize, index_b: usize, error: &DenseAlignError) {
        self.push(DiagnosticEvent::DenseRefinementFailed { index_a, index_b, error: error.clone() });
    }
}
