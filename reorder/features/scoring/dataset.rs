use ndarray::{Array1, Array2};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use super::scaler::StandardScaler;
use crate::{
    assembler::{FeatureTable, FeatureVector, FEATURE_DIM},
    relations::{ProductId, UserId},
};

/// One normalized training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// User key.
    pub user_id: UserId,
    /// Product key.
    pub product_id: ProductId,
    /// Normalized feature vector.
    pub features: FeatureVector,
    /// 0/1 label.
    pub label: u8,
}

/// Normalized samples ready for training or evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    /// Samples in table order (or split order).
    pub samples: Vec<Sample>,
}

impl Dataset {
    /// Normalizes every table row with an already fitted scaler.
    #[must_use]
    pub fn from_table(table: &FeatureTable, scaler: &StandardScaler) -> Self {
        let samples = table
            .rows()
            .iter()
            .map(|row| Sample {
                user_id: row.user_id,
                product_id: row.product_id,
                features: scaler.transform(&row.vector()),
                label: row.label,
            })
            .collect();
        Self { samples }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples labelled 1.
    #[must_use]
    pub fn positives(&self) -> usize {
        self.samples.iter().filter(|sample| sample.label == 1).count()
    }

    /// Feature vectors in sample order.
    #[must_use]
    pub fn vectors(&self) -> Vec<FeatureVector> {
        self.samples.iter().map(|sample| sample.features).collect()
    }

    /// Labels in sample order.
    #[must_use]
    pub fn labels(&self) -> Vec<u8> {
        self.samples.iter().map(|sample| sample.label).collect()
    }

    /// Design matrix (`len x FEATURE_DIM`) and label vector.
    #[must_use]
    pub fn to_matrix(&self) -> (Array2<f64>, Array1<f64>) {
        let features = Array2::from_shape_fn((self.samples.len(), FEATURE_DIM), |(row, col)| {
            self.samples[row].features[col]
        });
        let labels = self
            .samples
            .iter()
            .map(|sample| f64::from(sample.label))
            .collect();
        (features, labels)
    }
}

/// Seeded shuffle split into (train, test).
///
/// The test share is `ceil(len * test_ratio)`, capped so that at least one training sample
/// remains. The same seed and input always produce the same split.
#[must_use]
pub fn train_test_split(dataset: &Dataset, test_ratio: f64, seed: u64) -> (Dataset, Dataset) {
    let total = dataset.len();
    let mut order: Vec<usize> = (0..total).collect();
    let mut rng = SmallRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let wanted = (total as f64 * test_ratio.clamp(0.0, 1.0)).ceil() as usize;
    let n_test = wanted.min(total.saturating_sub(1));

    let pick = |indices: &[usize]| Dataset {
        samples: indices
            .iter()
            .map(|idx| dataset.samples[*idx].clone())
            .collect(),
    };
    (pick(&order[n_test..]), pick(&order[..n_test]))
}
