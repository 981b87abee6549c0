#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Reorder feature pipeline: joins order history, aggregates per-user/per-product/per-pair
//! statistics, assembles the feature table, and scores pairs against a threshold.

/// Typed input relations.
#[path = "../relations.rs"]
pub mod relations;

/// Relation sources (CSV directory, in-memory) and load-time validation.
#[path = "../loader.rs"]
pub mod loader;

/// Left-join enrichment of prior order lines.
#[path = "../join.rs"]
pub mod join;

/// Per-user, per-product, and per-pair aggregation.
#[path = "../aggregate.rs"]
pub mod aggregate;

/// Feature table assembly and lookup.
#[path = "../assembler.rs"]
pub mod assembler;

/// Content-fingerprinted feature table cache.
#[path = "../cache.rs"]
pub mod cache;

/// Normalization, scoring model, decisions, and evaluation.
#[path = "../scoring/main.rs"]
pub mod scoring;

/// Serving-side scoring of (user, product) pairs.
#[path = "../serving.rs"]
pub mod serving;

/// Persisted scaler/model artifacts.
#[path = "../artifacts.rs"]
pub mod artifacts;

/// TOML pipeline configuration.
#[path = "../config.rs"]
pub mod config;

/// Pipeline error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Structured logging and stage events.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Orchestration of feature builds, training, and serving setup.
#[path = "../main.rs"]
pub mod runtime;

pub use aggregate::{Aggregates, ProductAggregate, UserAggregate, UserProductAggregate};
pub use artifacts::ArtifactStore;
pub use assembler::{
    FeatureColumn, FeatureRow, FeatureTable, FeatureVector, MissingValuePolicy, FEATURE_DIM,
};
pub use cache::{CacheStats, FeatureCache, Fingerprint};
pub use config::PipelineConfig;
pub use error::{AggregateKind, PipelineError};
pub use join::{EnrichedLine, EnrichedRelation, JoinSummary};
pub use loader::{CsvDirectorySource, InMemorySource, LoadError, RelationFiles, RelationSource};
pub use relations::{Aisle, Department, Order, PriorOrderLine, Product, RelationKind, Relations};
pub use runtime::{
    generate_features, FeatureBuild, PersistedArtifacts, ReorderRuntime, ReorderRuntimeBuilder,
    TrainingRun,
};
pub use scoring::{
    dataset::Dataset,
    decision::{Decision, Threshold},
    evaluate::EvaluationReport,
    model::{LogisticModel, LogisticTrainer, TrainingConfig},
    scaler::{ScalerError, StandardScaler},
    ReorderScorer,
};
pub use serving::{InteractionDetails, ReorderScore, ScoreOutcome, ScoringService, ServeError};
pub use telemetry::{PipelineTelemetry, PipelineTelemetryBuilder};
