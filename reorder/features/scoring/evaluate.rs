use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use super::{
    dataset::Dataset,
    decision::{is_likely, Threshold},
    ReorderScorer,
};

/// Precision/recall summary for one label value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Label value (0 or 1).
    pub label: u8,
    /// Fraction of predictions for this label that were correct; 0 when never predicted.
    pub precision: f64,
    /// Fraction of this label's samples that were predicted as it; 0 when absent.
    pub recall: f64,
    /// Harmonic mean of precision and recall.
    pub f1: f64,
    /// Samples carrying this label.
    pub support: usize,
}

impl ClassMetrics {
    fn from_counts(label: u8, true_pos: usize, predicted: usize, support: usize) -> Self {
        let ratio = |num: usize, den: usize| {
            if den == 0 {
                0.0
            } else {
                num as f64 / den as f64
            }
        };
        let precision = ratio(true_pos, predicted);
        let recall = ratio(true_pos, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            label,
            precision,
            recall,
            f1,
            support,
        }
    }
}

/// Classification report plus ranking quality of a scorer on a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Threshold the report was computed at.
    pub threshold: f64,
    /// Metrics for label 0 then label 1.
    pub classes: [ClassMetrics; 2],
    /// Fraction of correct decisions.
    pub accuracy: f64,
    /// Area under the ROC curve; `None` when only one class is present.
    pub roc_auc: Option<f64>,
    /// Samples evaluated.
    pub samples: usize,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>12} {:>10} {:>10} {:>10} {:>10}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for class in &self.classes {
            writeln!(
                f,
                "{:>12} {:>10.2} {:>10.2} {:>10.2} {:>10}",
                class.label, class.precision, class.recall, class.f1, class.support
            )?;
        }
        writeln!(f, "{:>12} {:>32.2} {:>10}", "accuracy", self.accuracy, self.samples)?;
        match self.roc_auc {
            Some(auc) => write!(f, "{:>12} {auc:>10.4}", "roc_auc"),
            None => write!(f, "{:>12} {:>10}", "roc_auc", "n/a"),
        }
    }
}

/// Scores every sample and summarizes decisions at `threshold`.
#[must_use]
pub fn evaluate(
    scorer: &dyn ReorderScorer,
    dataset: &Dataset,
    threshold: Threshold,
) -> EvaluationReport {
    let probabilities = scorer.predict_batch(&dataset.vectors());
    let labels = dataset.labels();

    // [actual][predicted]
    let mut confusion = [[0_usize; 2]; 2];
    for (probability, label) in probabilities.iter().zip(&labels) {
        let predicted = usize::from(is_likely(*probability, threshold));
        confusion[usize::from(*label)][predicted] += 1;
    }
    let support = |label: usize| confusion[label][0] + confusion[label][1];
    let predicted = |label: usize| confusion[0][label] + confusion[1][label];
    let classes = [
        ClassMetrics::from_counts(0, confusion[0][0], predicted(0), support(0)),
        ClassMetrics::from_counts(1, confusion[1][1], predicted(1), support(1)),
    ];
    let samples = labels.len();
    let accuracy = if samples == 0 {
        0.0
    } else {
        (confusion[0][0] + confusion[1][1]) as f64 / samples as f64
    };

    EvaluationReport {
        threshold: threshold.value(),
        classes,
        accuracy,
        roc_auc: roc_auc(&probabilities, &labels),
        samples,
    }
}

/// Rank-based ROC-AUC with tied scores sharing their average rank.
#[must_use]
pub fn roc_auc(scores: &[f64], labels: &[u8]) -> Option<f64> {
    let positives = labels.iter().filter(|label| **label == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| {
        scores[*a]
            .partial_cmp(&scores[*b])
            .unwrap_or(Ordering::Equal)
    });

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; the tie group spans ranks start+1..=end+1.
        let average_rank = (start + end) as f64 / 2.0 + 1.0;
        for idx in &order[start..=end] {
            if labels[*idx] == 1 {
                positive_rank_sum += average_rank;
            }
        }
        start = end + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembler::{FeatureVector, FEATURE_DIM},
        scoring::dataset::Sample,
    };

    /// Returns the first coordinate as the probability.
    #[derive(Debug)]
    struct Passthrough;

    impl ReorderScorer for Passthrough {
        fn predict(&self, normalized: &FeatureVector) -> f64 {
            normalized[0]
        }

        fn name(&self) -> &str {
            "passthrough"
        }
    }

    fn dataset(points: &[(f64, u8)]) -> Dataset {
        Dataset {
            samples: points
                .iter()
                .enumerate()
                .map(|(idx, (p, label))| {
                    let mut features = [0.0; FEATURE_DIM];
                    features[0] = *p;
                    Sample {
                        user_id: idx as u64,
                        product_id: 1,
                        features,
                        label: *label,
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn auc_handles_perfect_inverse_and_tied_scores() {
        assert_eq!(roc_auc(&[0.1, 0.4, 0.35, 0.8], &[0, 0, 1, 1]), Some(0.75));
        assert_eq!(roc_auc(&[0.1, 0.9], &[0, 1]), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.1], &[0, 1]), Some(0.0));
        assert_eq!(roc_auc(&[0.5, 0.5, 0.5, 0.5], &[0, 1, 0, 1]), Some(0.5));
        assert_eq!(roc_auc(&[0.2, 0.3], &[1, 1]), None);
    }

    #[test]
    fn report_counts_decisions_at_threshold() {
        let data = dataset(&[(0.9, 1), (0.6, 1), (0.5, 1), (0.2, 0), (0.7, 0)]);
        let report = evaluate(&Passthrough, &data, Threshold::default());
        // 0.5 is not above 0.5, so that positive is missed.
        let positive = report.classes[1];
        assert_eq!(positive.support, 3);
        assert!((positive.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((positive.precision - 2.0 / 3.0).abs() < 1e-12);
        let negative = report.classes[0];
        assert_eq!(negative.support, 2);
        assert!((negative.recall - 0.5).abs() < 1e-12);
        assert!((report.accuracy - 0.6).abs() < 1e-12);
        assert!(report.roc_auc.is_some());

        let rendered = report.to_string();
        assert!(rendered.contains("precision"));
        assert!(rendered.contains("roc_auc"));
    }

    #[test]
    fn single_class_report_has_no_auc() {
        let data = dataset(&[(0.1, 0), (0.2, 0)]);
        let report = evaluate(&Passthrough, &data, Threshold::default());
        assert_eq!(report.roc_auc, None);
        assert_eq!(report.classes[1].support, 0);
        assert!((report.classes[1].precision).abs() < f64::EPSILON);
        assert!((report.accuracy - 1.0).abs() < f64::EPSILON);
    }
}
