use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::json;
use shared_event_bus::PipelineStage;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    assembler::{FeatureRow, FeatureTable},
    relations::{ProductId, UserId},
    scoring::{
        decision::{DecisionError, Threshold},
        scaler::StandardScaler,
        ReorderScorer,
    },
    telemetry::PipelineTelemetry,
};

/// Serving failures other than a lookup miss.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ServeError {
    /// Caller-supplied threshold outside `[0, 1]`.
    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),
    /// The scorer returned a value outside `[0, 1]`.
    #[error("scorer returned {probability} for ({user_id}, {product_id})")]
    InvalidProbability {
        /// User key.
        user_id: UserId,
        /// Product key.
        product_id: ProductId,
        /// Offending value.
        probability: f64,
    },
}

/// A scored pair with its presentation attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReorderScore {
    /// User key.
    pub user_id: UserId,
    /// Product key.
    pub product_id: ProductId,
    /// User display name.
    pub user_name: String,
    /// Product name.
    pub product_name: Option<Arc<str>>,
    /// Aisle name.
    pub aisle: Option<Arc<str>>,
    /// Reorder probability.
    pub probability: f64,
    /// Threshold applied.
    pub threshold: f64,
    /// `probability > threshold`.
    pub decision: bool,
}

impl fmt::Display for ReorderScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let product = self
            .product_name
            .as_deref()
            .map_or_else(|| self.product_id.to_string(), ToString::to_string);
        let verdict = if self.decision {
            "likely to reorder"
        } else {
            "unlikely to reorder"
        };
        write!(
            f,
            "{} / {product}: {verdict} (p={:.4}, threshold={})",
            self.user_name, self.probability, self.threshold
        )
    }
}

/// Result of a score request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScoreOutcome {
    /// The pair exists and was scored.
    Scored(ReorderScore),
    /// The user never bought the product; nothing is scored.
    NoInteraction {
        /// User key.
        user_id: UserId,
        /// Product key.
        product_id: ProductId,
    },
}

impl ScoreOutcome {
    /// The score, when the pair was found.
    #[must_use]
    pub const fn score(&self) -> Option<&ReorderScore> {
        match self {
            Self::Scored(score) => Some(score),
            Self::NoInteraction { .. } => None,
        }
    }
}

/// Raw history of one (user, product) pair, for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionDetails {
    /// User key.
    pub user_id: UserId,
    /// Product key.
    pub product_id: ProductId,
    /// User display name.
    pub user_name: String,
    /// Product name.
    pub product_name: Option<Arc<str>>,
    /// Aisle name.
    pub aisle: Option<Arc<str>>,
    /// Department name.
    pub department: Option<Arc<str>>,
    /// Times the user bought the product.
    pub up_order_count: u32,
    /// Times it was a reorder.
    pub up_reorder_count: u32,
    /// User's total orders.
    pub user_total_orders: u32,
}

impl From<&FeatureRow> for InteractionDetails {
    fn from(row: &FeatureRow) -> Self {
        Self {
            user_id: row.user_id,
            product_id: row.product_id,
            user_name: row.user_name(),
            product_name: row.product_name.clone(),
            aisle: row.aisle.clone(),
            department: row.department.clone(),
            up_order_count: row.up_order_count,
            up_reorder_count: row.up_reorder_count,
            user_total_orders: row.user_total_orders,
        }
    }
}

/// Scores (user, product) pairs against a fitted scaler and scorer.
///
/// All state is read-only; clones share it and may be used from any number of threads.
#[derive(Debug, Clone)]
pub struct ScoringService {
    table: Arc<FeatureTable>,
    scaler: Arc<StandardScaler>,
    scorer: Arc<dyn ReorderScorer>,
    default_threshold: Threshold,
    telemetry: Option<PipelineTelemetry>,
}

impl ScoringService {
    /// Creates a service over an assembled table and fitted parameters.
    #[must_use]
    pub fn new(
        table: Arc<FeatureTable>,
        scaler: Arc<StandardScaler>,
        scorer: Arc<dyn ReorderScorer>,
    ) -> Self {
        Self {
            table,
            scaler,
            scorer,
            default_threshold: Threshold::default(),
            telemetry: None,
        }
    }

    /// Threshold used by [`Self::score_default`].
    #[must_use]
    pub fn with_default_threshold(mut self, threshold: Threshold) -> Self {
        self.default_threshold = threshold;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Feature table being served.
    #[must_use]
    pub fn table(&self) -> &FeatureTable {
        &self.table
    }

    /// Scores a pair at `threshold`.
    ///
    /// A pair absent from the feature table yields [`ScoreOutcome::NoInteraction`]; no
    /// default probability is invented for it.
    pub fn score(
        &self,
        user_id: UserId,
        product_id: ProductId,
        threshold: f64,
    ) -> Result<ScoreOutcome, ServeError> {
        let threshold =
            Threshold::new(threshold).map_err(|_| ServeError::InvalidThreshold(threshold))?;
        self.score_with(user_id, product_id, threshold)
    }

    /// Scores a pair at the configured default threshold.
    pub fn score_default(
        &self,
        user_id: UserId,
        product_id: ProductId,
    ) -> Result<ScoreOutcome, ServeError> {
        self.score_with(user_id, product_id, self.default_threshold)
    }

    fn score_with(
        &self,
        user_id: UserId,
        product_id: ProductId,
        threshold: Threshold,
    ) -> Result<ScoreOutcome, ServeError> {
        let Some(row) = self.table.get(user_id, product_id) else {
            self.log(
                LogLevel::Debug,
                "score.no_interaction",
                json!({ "user_id": user_id, "product_id": product_id }),
            );
            return Ok(ScoreOutcome::NoInteraction {
                user_id,
                product_id,
            });
        };
        let normalized = self.scaler.transform(&row.vector());
        let probability = self.scorer.predict(&normalized);
        let decision = threshold.decide(probability).map_err(|err| match err {
            DecisionError::InvalidProbability(probability) => ServeError::InvalidProbability {
                user_id,
                product_id,
                probability,
            },
            DecisionError::InvalidThreshold(value) => ServeError::InvalidThreshold(value),
        })?;
        let score = ReorderScore {
            user_id,
            product_id,
            user_name: row.user_name(),
            product_name: row.product_name.clone(),
            aisle: row.aisle.clone(),
            probability: decision.probability,
            threshold: decision.threshold,
            decision: decision.likely,
        };
        let payload = json!({
            "user_id": user_id,
            "product_id": product_id,
            "probability": score.probability,
            "threshold": score.threshold,
            "decision": score.decision,
        });
        self.log(LogLevel::Debug, "score.served", payload.clone());
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.event(PipelineStage::ScoreServed, payload);
        }
        Ok(ScoreOutcome::Scored(score))
    }

    /// History of a pair, if the user ever bought the product.
    #[must_use]
    pub fn interaction(&self, user_id: UserId, product_id: ProductId) -> Option<InteractionDetails> {
        self.table
            .get(user_id, product_id)
            .map(InteractionDetails::from)
    }

    /// Products the user bought, by product id.
    #[must_use]
    pub fn products_for(&self, user_id: UserId) -> Vec<InteractionDetails> {
        self.table
            .for_user(user_id)
            .iter()
            .map(InteractionDetails::from)
            .collect()
    }

    /// The user's most reordered products.
    #[must_use]
    pub fn top_reordered(&self, user_id: UserId, limit: usize) -> Vec<InteractionDetails> {
        self.table
            .top_reordered(user_id, limit)
            .into_iter()
            .map(InteractionDetails::from)
            .collect()
    }

    /// Users present in the table.
    #[must_use]
    pub fn users(&self) -> Vec<UserId> {
        self.table.users()
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, message, metadata);
        }
    }
}
