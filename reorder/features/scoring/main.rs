//! Normalization, the scoring model contract, decisions, and evaluation.

/// Feature table to (normalized) sample conversion and splitting.
pub mod dataset;
/// Probability thresholding.
pub mod decision;
/// Classification report and ROC-AUC.
pub mod evaluate;
/// Logistic scoring model and its trainer.
pub mod model;
/// Per-column standardization.
pub mod scaler;

use std::fmt::Debug;

use crate::assembler::FeatureVector;

/// Maps a normalized feature vector to a reorder probability in `[0, 1]`.
///
/// Implementations hold read-only parameters after training, so a single scorer can be
/// shared across any number of concurrent callers.
pub trait ReorderScorer: Send + Sync + Debug {
    /// Probability for one normalized vector.
    fn predict(&self, normalized: &FeatureVector) -> f64;

    /// Probabilities for a batch of normalized vectors.
    fn predict_batch(&self, normalized: &[FeatureVector]) -> Vec<f64> {
        normalized.iter().map(|vector| self.predict(vector)).collect()
    }

    /// Short model identifier for logs and manifests.
    fn name(&self) -> &str;
}
