use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assembler::{FeatureColumn, FeatureVector, MissingValuePolicy, FEATURE_DIM};

/// Current on-disk format of [`StandardScaler`].
pub const SCALER_FORMAT_VERSION: u32 = 2;

/// Errors raised while fitting, applying, or persisting a scaler.
#[derive(Debug, Error)]
pub enum ScalerError {
    /// Fit was called without vectors.
    #[error("cannot fit a scaler on zero rows")]
    EmptyInput,
    /// A column has a single distinct value, or its spread rounds to zero.
    #[error("column '{column}' is constant")]
    ConstantColumn {
        /// Column name.
        column: String,
    },
    /// A column contains NaN or infinity, or its spread overflows.
    #[error("column '{column}' contains a non-finite value")]
    NonFinite {
        /// Column name.
        column: String,
    },
    /// Persisted column ordering differs from the current one.
    #[error("scaler columns {found:?} do not match {expected:?}")]
    ColumnMismatch {
        /// Current ordering.
        expected: Vec<String>,
        /// Persisted ordering.
        found: Vec<String>,
    },
    /// Persisted format is not understood.
    #[error("unsupported scaler format version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version on disk.
        found: u32,
        /// Version this build reads.
        supported: u32,
    },
    /// Filesystem failure.
    #[error("scaler io: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding failure.
    #[error("scaler json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-column mean/standard-deviation normalization.
///
/// Parameters are fixed at fit time; `transform` never refits, so training and serving see
/// the same mapping for the same persisted state. The fill policy the fitted table was
/// assembled under is stored alongside, so serving can refuse tables filled differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    format_version: u32,
    columns: Vec<String>,
    missing_value_policy: MissingValuePolicy,
    means: FeatureVector,
    stds: FeatureVector,
    fitted_rows: usize,
}

impl StandardScaler {
    /// Fits means and population standard deviations over `vectors`.
    pub fn fit(vectors: &[FeatureVector]) -> Result<Self, ScalerError> {
        if vectors.is_empty() {
            return Err(ScalerError::EmptyInput);
        }
        let count = vectors.len() as f64;
        let mut means = [0.0; FEATURE_DIM];
        let mut stds = [0.0; FEATURE_DIM];
        for column in FeatureColumn::ALL {
            let idx = column.index();
            let values = vectors.iter().map(|vector| vector[idx]);
            if values.clone().any(|value| !value.is_finite()) {
                return Err(ScalerError::NonFinite {
                    column: column.name().to_string(),
                });
            }
            let first = vectors[0][idx];
            if values.clone().all(|value| value == first) {
                return Err(ScalerError::ConstantColumn {
                    column: column.name().to_string(),
                });
            }
            let mean = values.clone().sum::<f64>() / count;
            let variance = values.map(|value| (value - mean).powi(2)).sum::<f64>() / count;
            let std = variance.sqrt();
            if !mean.is_finite() || !std.is_finite() {
                return Err(ScalerError::NonFinite {
                    column: column.name().to_string(),
                });
            }
            // Distinct values whose squared deviations underflow still give a zero spread.
            if std <= 0.0 {
                return Err(ScalerError::ConstantColumn {
                    column: column.name().to_string(),
                });
            }
            means[idx] = mean;
            stds[idx] = std;
        }
        Ok(Self {
            format_version: SCALER_FORMAT_VERSION,
            columns: FeatureColumn::names(),
            missing_value_policy: MissingValuePolicy::default(),
            means,
            stds,
            fitted_rows: vectors.len(),
        })
    }

    /// Records the fill policy of the table the vectors came from.
    #[must_use]
    pub fn with_policy(mut self, policy: MissingValuePolicy) -> Self {
        self.missing_value_policy = policy;
        self
    }

    /// Fill policy of the table the scaler was fitted on.
    #[must_use]
    pub const fn missing_value_policy(&self) -> MissingValuePolicy {
        self.missing_value_policy
    }

    /// Standardizes one vector with the fitted parameters.
    #[must_use]
    pub fn transform(&self, vector: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_DIM];
        for (idx, slot) in out.iter_mut().enumerate() {
            *slot = (vector[idx] - self.means[idx]) / self.stds[idx];
        }
        out
    }

    /// Standardizes a batch of vectors.
    #[must_use]
    pub fn transform_batch(&self, vectors: &[FeatureVector]) -> Vec<FeatureVector> {
        vectors.iter().map(|vector| self.transform(vector)).collect()
    }

    /// Fitted column means.
    #[must_use]
    pub const fn means(&self) -> &FeatureVector {
        &self.means
    }

    /// Fitted column standard deviations.
    #[must_use]
    pub const fn stds(&self) -> &FeatureVector {
        &self.stds
    }

    /// Column ordering the parameters refer to.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows the scaler was fitted on.
    #[must_use]
    pub const fn fitted_rows(&self) -> usize {
        self.fitted_rows
    }

    /// Writes the scaler as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ScalerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Reads a scaler, rejecting unknown versions and foreign column orderings.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScalerError> {
        let contents = fs::read(path)?;
        let scaler: Self = serde_json::from_slice(&contents)?;
        scaler.check_compatible()?;
        Ok(scaler)
    }

    fn check_compatible(&self) -> Result<(), ScalerError> {
        if self.format_version != SCALER_FORMAT_VERSION {
            return Err(ScalerError::UnsupportedVersion {
                found: self.format_version,
                supported: SCALER_FORMAT_VERSION,
            });
        }
        let expected = FeatureColumn::names();
        if self.columns != expected {
            return Err(ScalerError::ColumnMismatch {
                expected,
                found: self.columns.clone(),
            });
        }
        if let Some(idx) = self
            .stds
            .iter()
            .position(|std| *std <= 0.0 || !std.is_finite())
        {
            return Err(ScalerError::ConstantColumn {
                column: FeatureColumn::ALL[idx].name().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Vec<FeatureVector> {
        vec![
            [1.0, 0.0, 2.0, 10.0, 1.0, 2.0, 0.5],
            [3.0, 2.0, 4.0, 0.0, 4.0, 5.0, 0.8],
            [2.0, 1.0, 6.0, 5.0, 7.0, 9.0, 0.1],
        ]
    }

    #[test]
    fn transformed_columns_have_zero_mean_unit_std() {
        let vectors = sample();
        let scaler = StandardScaler::fit(&vectors).unwrap();
        let transformed = scaler.transform_batch(&vectors);
        let n = transformed.len() as f64;
        for idx in 0..FEATURE_DIM {
            let mean = transformed.iter().map(|v| v[idx]).sum::<f64>() / n;
            let var = transformed.iter().map(|v| (v[idx] - mean).powi(2)).sum::<f64>() / n;
            assert!(mean.abs() < 1e-9, "column {idx} mean {mean}");
            assert!((var.sqrt() - 1.0).abs() < 1e-9, "column {idx} std {}", var.sqrt());
        }
    }

    #[test]
    fn constant_column_is_rejected() {
        let mut vectors = sample();
        for vector in &mut vectors {
            vector[FeatureColumn::UserTotalOrders.index()] = 3.0;
        }
        let err = StandardScaler::fit(&vectors).unwrap_err();
        assert!(matches!(err, ScalerError::ConstantColumn { ref column } if column == "user_total_orders"));
    }

    #[test]
    fn underflowing_spread_is_constant_column() {
        let mut vectors = vec![sample()[0], sample()[1]];
        vectors[0][FeatureColumn::ReorderRatio.index()] = 0.0;
        vectors[1][FeatureColumn::ReorderRatio.index()] = 5e-324;
        let err = StandardScaler::fit(&vectors).unwrap_err();
        assert!(matches!(err, ScalerError::ConstantColumn { ref column } if column == "reorder_ratio"));
    }

    #[test]
    fn overflowing_spread_is_non_finite() {
        let mut vectors = vec![sample()[0], sample()[1]];
        vectors[0][FeatureColumn::TimesPurchased.index()] = -1e300;
        vectors[1][FeatureColumn::TimesPurchased.index()] = 1e300;
        let err = StandardScaler::fit(&vectors).unwrap_err();
        assert!(matches!(err, ScalerError::NonFinite { ref column } if column == "times_purchased"));
    }

    #[test]
    fn empty_and_non_finite_inputs_are_rejected() {
        assert!(matches!(StandardScaler::fit(&[]), Err(ScalerError::EmptyInput)));
        let mut vectors = sample();
        vectors[1][FeatureColumn::ReorderRatio.index()] = f64::NAN;
        assert!(matches!(
            StandardScaler::fit(&vectors),
            Err(ScalerError::NonFinite { .. })
        ));
    }

    #[test]
    fn persisted_parameters_reproduce_transform() {
        let policy = MissingValuePolicy { avg_days_fill: 30.0 };
        let scaler = StandardScaler::fit(&sample()).unwrap().with_policy(policy);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models/scaler.json");
        scaler.save(&path).unwrap();
        let loaded = StandardScaler::load(&path).unwrap();
        assert_eq!(loaded, scaler);
        assert_eq!(loaded.missing_value_policy(), policy);
        let probe = [9.0, 1.0, 3.0, 2.0, 0.0, 1.0, 0.3];
        assert_eq!(loaded.transform(&probe), scaler.transform(&probe));
        assert_eq!(loaded.fitted_rows(), 3);
    }

    #[test]
    fn load_rejects_foreign_column_order() {
        let scaler = StandardScaler::fit(&sample()).unwrap();
        let mut doc = serde_json::to_value(&scaler).unwrap();
        doc["columns"].as_array_mut().unwrap().swap(0, 1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaler.json");
        fs::write(&path, doc.to_string()).unwrap();
        assert!(matches!(
            StandardScaler::load(&path),
            Err(ScalerError::ColumnMismatch { .. })
        ));

        doc = serde_json::to_value(&scaler).unwrap();
        doc["format_version"] = 7.into();
        fs::write(&path, doc.to_string()).unwrap();
        assert!(matches!(
            StandardScaler::load(&path),
            Err(ScalerError::UnsupportedVersion { found: 7, .. })
        ));
    }

    proptest! {
        #[test]
        fn fitted_population_is_standardized(
            rows in prop::collection::vec(prop::array::uniform7(-1.0e3_f64..1.0e3), 2..40)
        ) {
            let Ok(scaler) = StandardScaler::fit(&rows) else {
                return Ok(());
            };
            let transformed = scaler.transform_batch(&rows);
            let n = transformed.len() as f64;
            for idx in 0..FEATURE_DIM {
                let mean = transformed.iter().map(|v| v[idx]).sum::<f64>() / n;
                let var = transformed.iter().map(|v| (v[idx] - mean).powi(2)).sum::<f64>() / n;
                prop_assert!(mean.abs() < 1e-6);
                prop_assert!((var.sqrt() - 1.0).abs() < 1e-6);
            }
        }
    }
}
