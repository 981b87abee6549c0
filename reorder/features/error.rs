use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::{
    loader::LoadError,
    relations::{ProductId, UserId},
    scoring::{decision::DecisionError, model::ModelError, scaler::ScalerError},
};

/// Aggregate view a feature row could not be joined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// Per-user view.
    User,
    /// Per-product view.
    Product,
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Product => f.write_str("product"),
        }
    }
}

/// Errors surfaced by the feature and training pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A relation could not be loaded or failed validation.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// A pair row has no matching user or product aggregate.
    #[error("pair ({user_id}, {product_id}) has no {missing} aggregate")]
    JoinIntegrity {
        /// User key of the pair.
        user_id: UserId,
        /// Product key of the pair.
        product_id: ProductId,
        /// Which view is missing.
        missing: AggregateKind,
    },
    /// The prior order lines produced no (user, product) pair.
    #[error("feature table is empty")]
    EmptyFeatureTable,
    /// A feature column has zero variance and cannot be standardized.
    #[error("feature column '{column}' is constant; cannot standardize")]
    DegenerateScale {
        /// Column name.
        column: String,
    },
    /// Other scaler failures.
    #[error(transparent)]
    Scaler(ScalerError),
    /// Model training or inference failure.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Invalid decision threshold.
    #[error(transparent)]
    Decision(#[from] DecisionError),
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// Artifact read/write failure.
    #[error("artifact {path:?}: {reason}")]
    Artifact {
        /// Artifact path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },
}

impl From<ScalerError> for PipelineError {
    fn from(err: ScalerError) -> Self {
        match err {
            ScalerError::ConstantColumn { column } => Self::DegenerateScale { column },
            other => Self::Scaler(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_column_maps_to_degenerate_scale() {
        let err = PipelineError::from(ScalerError::ConstantColumn {
            column: "user_total_orders".into(),
        });
        assert!(matches!(err, PipelineError::DegenerateScale { ref column } if column == "user_total_orders"));
        assert!(err.to_string().contains("constant"));

        let err = PipelineError::from(ScalerError::EmptyInput);
        assert!(matches!(err, PipelineError::Scaler(ScalerError::EmptyInput)));
    }

    #[test]
    fn join_integrity_names_the_missing_view() {
        let err = PipelineError::JoinIntegrity {
            user_id: 3,
            product_id: 8,
            missing: AggregateKind::Product,
        };
        assert_eq!(err.to_string(), "pair (3, 8) has no product aggregate");
    }
}
