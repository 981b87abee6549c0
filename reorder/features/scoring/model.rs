use std::{fs, path::Path};

use ndarray::{Array1, Array2, Axis};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{dataset::Dataset, ReorderScorer};
use crate::assembler::{FeatureColumn, FeatureVector, FEATURE_DIM};

/// Current on-disk format of [`LogisticModel`].
pub const MODEL_FORMAT_VERSION: u32 = 1;

const PROBABILITY_EPSILON: f64 = 1e-12;

/// Errors raised while training or persisting the scoring model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No training samples.
    #[error("cannot train on an empty dataset")]
    EmptyTraining,
    /// Hyperparameters out of range.
    #[error("invalid training config: {0}")]
    InvalidConfig(String),
    /// Loss became NaN or infinite.
    #[error("training diverged at epoch {epoch}")]
    Diverged {
        /// Epoch at which the loss stopped being finite.
        epoch: usize,
    },
    /// Persisted parameters do not fit the current feature layout.
    #[error("model columns {found:?} do not match {expected:?}")]
    ColumnMismatch {
        /// Current ordering.
        expected: Vec<String>,
        /// Persisted ordering.
        found: Vec<String>,
    },
    /// Persisted format is not understood.
    #[error("unsupported model format version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version on disk.
        found: u32,
        /// Version this build reads.
        supported: u32,
    },
    /// Filesystem failure.
    #[error("model io: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding failure.
    #[error("model json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Gradient step size.
    pub learning_rate: f64,
    /// Maximum passes over the training set.
    pub epochs: usize,
    /// Samples per gradient step.
    pub batch_size: usize,
    /// Epochs without validation improvement before stopping; 0 disables early stopping.
    pub patience: usize,
    /// Shuffle seed.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            epochs: 20,
            batch_size: 512,
            patience: 3,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Checks hyperparameter ranges.
    pub fn validate(&self) -> Result<(), ModelError> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.epochs == 0 {
            return Err(ModelError::InvalidConfig("epochs must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ModelError::InvalidConfig("batch_size must be >= 1".into()));
        }
        Ok(())
    }
}

/// Loss values recorded after one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Mean binary cross-entropy on the training set.
    pub train_loss: f64,
    /// Mean binary cross-entropy on the validation set, when one was given.
    pub validation_loss: Option<f64>,
}

/// Per-epoch losses plus the epoch whose weights were kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Losses per completed epoch.
    pub epochs: Vec<EpochStats>,
    /// Epoch with the lowest monitored loss.
    pub best_epoch: usize,
    /// True when patience ran out before `epochs` were completed.
    pub stopped_early: bool,
}

impl TrainingHistory {
    /// Stats of the retained epoch.
    #[must_use]
    pub fn best(&self) -> Option<&EpochStats> {
        self.epochs.iter().find(|stats| stats.epoch == self.best_epoch)
    }
}

/// Logistic regression over the normalized feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    format_version: u32,
    columns: Vec<String>,
    weights: Vec<f64>,
    bias: f64,
}

impl LogisticModel {
    /// Builds a model from explicit parameters.
    #[must_use]
    pub fn from_parameters(weights: FeatureVector, bias: f64) -> Self {
        Self {
            format_version: MODEL_FORMAT_VERSION,
            columns: FeatureColumn::names(),
            weights: weights.to_vec(),
            bias,
        }
    }

    /// Per-column weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Intercept.
    #[must_use]
    pub const fn bias(&self) -> f64 {
        self.bias
    }

    /// Writes the model as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Reads a model, rejecting unknown versions and foreign column layouts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let model: Self = serde_json::from_slice(&fs::read(path)?)?;
        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion {
                found: model.format_version,
                supported: MODEL_FORMAT_VERSION,
            });
        }
        let expected = FeatureColumn::names();
        if model.columns != expected || model.weights.len() != FEATURE_DIM {
            return Err(ModelError::ColumnMismatch {
                expected,
                found: model.columns,
            });
        }
        Ok(model)
    }

    fn logit(&self, normalized: &FeatureVector) -> f64 {
        self.weights
            .iter()
            .zip(normalized.iter())
            .map(|(weight, value)| weight * value)
            .sum::<f64>()
            + self.bias
    }
}

impl ReorderScorer for LogisticModel {
    fn predict(&self, normalized: &FeatureVector) -> f64 {
        sigmoid(self.logit(normalized))
    }

    fn name(&self) -> &str {
        "logistic_regression"
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn cross_entropy(features: &Array2<f64>, labels: &Array1<f64>, weights: &Array1<f64>, bias: f64) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let probabilities = (features.dot(weights) + bias)
        .mapv(|z| sigmoid(z).clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON));
    let total: f64 = probabilities
        .iter()
        .zip(labels.iter())
        .map(|(p, y)| y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        .sum();
    -total / labels.len() as f64
}

/// Mini-batch gradient descent trainer with early stopping.
#[derive(Debug, Clone, Default)]
pub struct LogisticTrainer {
    config: TrainingConfig,
}

impl LogisticTrainer {
    /// Creates a trainer.
    #[must_use]
    pub const fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Hyperparameters in use.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Trains on `train`, monitoring `validation` loss (training loss when it is empty).
    ///
    /// The returned model carries the weights of the best monitored epoch.
    pub fn fit(
        &self,
        train: &Dataset,
        validation: &Dataset,
    ) -> Result<(LogisticModel, TrainingHistory), ModelError> {
        self.config.validate()?;
        if train.is_empty() {
            return Err(ModelError::EmptyTraining);
        }
        let (x_train, y_train) = train.to_matrix();
        let (x_val, y_val) = validation.to_matrix();

        let mut weights = Array1::<f64>::zeros(FEATURE_DIM);
        let mut bias = 0.0;
        let mut best = (weights.clone(), bias, f64::INFINITY);
        let mut history = TrainingHistory::default();
        let mut stale_epochs = 0;

        let mut rng = SmallRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..train.len()).collect();

        for epoch in 1..=self.config.epochs {
            order.shuffle(&mut rng);
            for batch in order.chunks(self.config.batch_size) {
                let x = x_train.select(Axis(0), batch);
                let y = y_train.select(Axis(0), batch);
                let error = (x.dot(&weights) + bias).mapv(sigmoid) - &y;
                let size = batch.len() as f64;
                let grad_w = x.t().dot(&error) / size;
                let grad_b = error.sum() / size;
                weights.scaled_add(-self.config.learning_rate, &grad_w);
                bias -= self.config.learning_rate * grad_b;
            }

            let train_loss = cross_entropy(&x_train, &y_train, &weights, bias);
            let validation_loss = (!validation.is_empty())
                .then(|| cross_entropy(&x_val, &y_val, &weights, bias));
            history.epochs.push(EpochStats {
                epoch,
                train_loss,
                validation_loss,
            });

            let monitored = validation_loss.unwrap_or(train_loss);
            if !monitored.is_finite() {
                return Err(ModelError::Diverged { epoch });
            }
            if monitored < best.2 {
                best = (weights.clone(), bias, monitored);
                history.best_epoch = epoch;
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
                if self.config.patience > 0 && stale_epochs >= self.config.patience {
                    history.stopped_early = epoch < self.config.epochs;
                    break;
                }
            }
        }

        let mut best_weights = [0.0; FEATURE_DIM];
        for (slot, value) in best_weights.iter_mut().zip(best.0.iter()) {
            *slot = *value;
        }
        Ok((LogisticModel::from_parameters(best_weights, best.1), history))
    }
}
