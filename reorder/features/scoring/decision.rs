use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid decision inputs.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum DecisionError {
    /// Threshold outside `[0, 1]` or not a number.
    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),
    /// Probability outside `[0, 1]` or not a number.
    #[error("probability {0} is outside [0, 1]")]
    InvalidProbability(f64),
}

/// Probability cutoff in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Threshold(f64);

impl Threshold {
    /// Validates a raw threshold.
    pub fn new(value: f64) -> Result<Self, DecisionError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(DecisionError::InvalidThreshold(value))
        }
    }

    /// Raw value.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    /// Applies the threshold to a probability.
    pub fn decide(self, probability: f64) -> Result<Decision, DecisionError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(DecisionError::InvalidProbability(probability));
        }
        Ok(Decision {
            probability,
            threshold: self.0,
            likely: is_likely(probability, self),
        })
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(0.5)
    }
}

impl TryFrom<f64> for Threshold {
    type Error = DecisionError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Threshold> for f64 {
    fn from(threshold: Threshold) -> Self {
        threshold.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// True iff `probability` is strictly above the threshold.
#[must_use]
pub fn is_likely(probability: f64, threshold: Threshold) -> bool {
    probability > threshold.0
}

/// Outcome of thresholding one probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Scored probability.
    pub probability: f64,
    /// Threshold applied.
    pub threshold: f64,
    /// `probability > threshold`.
    pub likely: bool,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.likely {
            "likely to reorder"
        } else {
            "unlikely to reorder"
        };
        write!(
            f,
            "{verdict} (p={:.4}, threshold={})",
            self.probability, self.threshold
        )
    }
}
