//! Reorder pipeline runtime: loads relations, builds (or reuses) the feature table, fits the
//! scaler and scoring model, and wires serving.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use serde_json::{json, Value};
use shared_event_bus::PipelineStage;
use shared_logging::LogLevel;

use crate::{
    aggregate::aggregate,
    artifacts::ArtifactStore,
    assembler::{assemble, FeatureTable, MissingValuePolicy},
    cache::{FeatureCache, Fingerprint},
    config::PipelineConfig,
    error::PipelineError,
    join::{enrich, JoinSummary},
    loader::RelationSource,
    relations::Relations,
    scoring::{
        dataset::{train_test_split, Dataset},
        evaluate::{evaluate, EvaluationReport},
        model::{LogisticModel, LogisticTrainer, TrainingHistory},
        scaler::StandardScaler,
    },
    serving::ScoringService,
    telemetry::PipelineTelemetry,
};

/// Runs join, aggregation, and assembly over one set of relations.
pub fn generate_features(
    relations: &Relations,
    policy: MissingValuePolicy,
    shards: usize,
) -> Result<(FeatureTable, JoinSummary), PipelineError> {
    let enriched = enrich(relations);
    let aggregates = aggregate(&relations.orders, &enriched.lines, shards);
    let table = assemble(&aggregates, &enriched, policy)?;
    Ok((table, enriched.summary))
}

/// A feature table together with where it came from.
#[derive(Debug, Clone)]
pub struct FeatureBuild {
    /// Fingerprint of the input relations.
    pub fingerprint: Fingerprint,
    /// Assembled table.
    pub table: Arc<FeatureTable>,
    /// Join statistics; `None` when the table came from the cache.
    pub join: Option<JoinSummary>,
    /// True when the table was served from the cache.
    pub cached: bool,
}

/// Everything produced by one training run.
#[derive(Debug, Clone)]
pub struct TrainingRun {
    /// Run id shared with logs and events.
    pub run_id: String,
    /// Feature table the run trained on.
    pub features: FeatureBuild,
    /// Scaler fitted on the full table.
    pub scaler: StandardScaler,
    /// Trained scoring model.
    pub model: LogisticModel,
    /// Per-epoch losses.
    pub history: TrainingHistory,
    /// Validation report at the configured threshold.
    pub report: EvaluationReport,
    /// Training rows after the split.
    pub train_rows: usize,
    /// Validation rows after the split.
    pub validation_rows: usize,
}

impl TrainingRun {
    /// Compact summary for manifests and CLI output.
    #[must_use]
    pub fn summary(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "fingerprint": self.features.fingerprint,
            "rows": self.features.table.len(),
            "train_rows": self.train_rows,
            "validation_rows": self.validation_rows,
            "epochs": self.history.epochs.len(),
            "best_epoch": self.history.best_epoch,
            "stopped_early": self.history.stopped_early,
            "accuracy": self.report.accuracy,
            "roc_auc": self.report.roc_auc,
        })
    }
}

/// Paths written by [`ReorderRuntime::persist`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedArtifacts {
    /// Scaler file.
    pub scaler: PathBuf,
    /// Model file.
    pub model: PathBuf,
    /// Feature export file.
    pub features: PathBuf,
}

/// Builder for [`ReorderRuntime`].
#[derive(Debug, Default)]
pub struct ReorderRuntimeBuilder {
    config: Option<PipelineConfig>,
    cache: Option<Arc<FeatureCache>>,
    telemetry: Option<PipelineTelemetry>,
    artifacts: Option<ArtifactStore>,
}

impl ReorderRuntimeBuilder {
    /// Uses an in-memory configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads the configuration from a TOML file.
    pub fn config_path(mut self, path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        self.config = Some(PipelineConfig::load(path)?);
        Ok(self)
    }

    /// Shares a feature cache with other runtimes.
    #[must_use]
    pub fn cache(mut self, cache: Arc<FeatureCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Overrides the artifact store derived from the configuration.
    #[must_use]
    pub fn artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Builds the runtime.
    pub fn build(self) -> Result<ReorderRuntime, PipelineError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(FeatureCache::new(config.features.cache_capacity)));
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| ArtifactStore::from_section(&config.artifacts));
        Ok(ReorderRuntime {
            config,
            cache,
            telemetry: self.telemetry,
            artifacts,
        })
    }
}

/// Top-level runtime coordinating feature builds, training, and serving.
#[derive(Debug)]
pub struct ReorderRuntime {
    config: PipelineConfig,
    cache: Arc<FeatureCache>,
    telemetry: Option<PipelineTelemetry>,
    artifacts: ArtifactStore,
}

impl ReorderRuntime {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> ReorderRuntimeBuilder {
        ReorderRuntimeBuilder::default()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Feature cache.
    #[must_use]
    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    /// Artifact locations.
    #[must_use]
    pub const fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run id of the attached telemetry.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.telemetry.as_ref().map(PipelineTelemetry::run_id)
    }

    /// Loads and validates the five relations.
    pub fn load(&self, source: &dyn RelationSource) -> Result<Relations, PipelineError> {
        let relations = source
            .load()
            .map_err(|err| self.fail("load", PipelineError::from(err)))?;
        let counts = relations.row_counts();
        self.log(
            LogLevel::Info,
            "relations.loaded",
            json!({ "source": source.describe(), "rows": counts }),
        );
        self.event(PipelineStage::RelationsLoaded, json!({ "rows": counts }));
        Ok(relations)
    }

    /// Builds the feature table, reusing a cached one for identical inputs and fill policy.
    pub fn build_features(&self, relations: &Relations) -> Result<FeatureBuild, PipelineError> {
        let fingerprint = Fingerprint::of(relations);
        let key = fingerprint.with_policy(self.config.missing_value_policy());
        let mut join = None;
        let (table, cached) = self
            .cache
            .get_or_try_insert_with(key, || {
                let (table, summary) = generate_features(
                    relations,
                    self.config.missing_value_policy(),
                    self.config.features.shards,
                )?;
                join = Some(summary);
                Ok(table)
            })
            .map_err(|err| self.fail("features", err))?;
        if let Some(summary) = &join {
            self.log(
                LogLevel::Debug,
                "features.joined",
                json!({
                    "lines": summary.lines,
                    "orphan_lines": summary.orphan_lines,
                    "unmatched_products": summary.unmatched_products,
                    "unmatched_aisles": summary.unmatched_aisles,
                    "unmatched_departments": summary.unmatched_departments,
                }),
            );
        }
        let imputed = table.rows().iter().filter(|row| row.avg_days_imputed).count();
        let payload = json!({
            "rows": table.len(),
            "users": table.users().len(),
            "avg_days_imputed": imputed,
            "fingerprint": fingerprint,
            "cached": cached,
        });
        self.log(LogLevel::Info, "features.assembled", payload.clone());
        self.event(PipelineStage::FeaturesAssembled, payload);
        Ok(FeatureBuild {
            fingerprint,
            table,
            join,
            cached,
        })
    }

    /// Loads relations from `source` and builds their feature table.
    pub fn load_and_build(&self, source: &dyn RelationSource) -> Result<FeatureBuild, PipelineError> {
        let relations = self.load(source)?;
        self.build_features(&relations)
    }

    /// Full training run: load, build, fit the scaler, split, train, evaluate.
    pub fn train(&self, source: &dyn RelationSource) -> Result<TrainingRun, PipelineError> {
        let features = self.load_and_build(source)?;
        self.train_on(features)
    }

    /// Trains on an already built feature table.
    pub fn train_on(&self, features: FeatureBuild) -> Result<TrainingRun, PipelineError> {
        let table = Arc::clone(&features.table);
        let scaler = StandardScaler::fit(&table.vectors())
            .map_err(|err| self.fail("scaler", PipelineError::from(err)))?
            .with_policy(table.policy());
        self.log(
            LogLevel::Info,
            "scaler.fitted",
            json!({ "rows": scaler.fitted_rows(), "means": scaler.means(), "stds": scaler.stds() }),
        );
        self.event(
            PipelineStage::ScalerFitted,
            json!({ "rows": scaler.fitted_rows() }),
        );

        let dataset = Dataset::from_table(&table, &scaler);
        let training = &self.config.training;
        let (train, validation) = train_test_split(&dataset, training.test_ratio, training.seed);
        self.log(
            LogLevel::Debug,
            "training.split",
            json!({
                "train_rows": train.len(),
                "validation_rows": validation.len(),
                "train_positives": train.positives(),
                "validation_positives": validation.positives(),
            }),
        );

        let trainer = LogisticTrainer::new(training.optimizer());
        let (model, history) = trainer
            .fit(&train, &validation)
            .map_err(|err| self.fail("training", PipelineError::from(err)))?;
        let best = history.best().copied();
        self.log(
            LogLevel::Info,
            "model.trained",
            json!({
                "epochs": history.epochs.len(),
                "best_epoch": history.best_epoch,
                "stopped_early": history.stopped_early,
                "train_loss": best.map(|stats| stats.train_loss),
                "validation_loss": best.and_then(|stats| stats.validation_loss),
            }),
        );
        self.event(
            PipelineStage::ModelTrained,
            json!({ "epochs": history.epochs.len(), "best_epoch": history.best_epoch }),
        );

        let threshold = self.config.threshold()?;
        let holdout = if validation.is_empty() { &train } else { &validation };
        let report = evaluate(&model, holdout, threshold);
        let metrics = json!({
            "samples": report.samples,
            "accuracy": report.accuracy,
            "roc_auc": report.roc_auc,
            "threshold": report.threshold,
        });
        self.log(LogLevel::Info, "model.evaluated", metrics.clone());
        self.event(PipelineStage::ModelEvaluated, metrics);

        Ok(TrainingRun {
            run_id: self.run_id().map_or_else(String::new, ToString::to_string),
            features,
            scaler,
            model,
            history,
            report,
            train_rows: train.len(),
            validation_rows: validation.len(),
        })
    }

    /// Writes the scaler, model, and feature export of a run.
    pub fn persist(&self, run: &TrainingRun) -> Result<PersistedArtifacts, PipelineError> {
        let persisted = PersistedArtifacts {
            scaler: self.artifacts.save_scaler(&run.scaler)?,
            model: self.artifacts.save_model(&run.model)?,
            features: self.artifacts.write_features(&run.features.table)?,
        };
        self.log(
            LogLevel::Info,
            "artifacts.persisted",
            json!({
                "scaler": persisted.scaler,
                "model": persisted.model,
                "features": persisted.features,
            }),
        );
        Ok(persisted)
    }

    /// Serving over a finished run, without touching disk.
    #[must_use]
    pub fn serving_from_run(&self, run: &TrainingRun) -> ScoringService {
        self.service(
            Arc::clone(&run.features.table),
            run.scaler.clone(),
            run.model.clone(),
        )
    }

    /// Serving over persisted artifacts and a freshly built feature table.
    ///
    /// The scaler is loaded, never refitted, so inference uses exactly the training-time
    /// normalization. A table filled under a different missing-value policy than the one
    /// recorded in the scaler is rejected.
    pub fn serving(&self, source: &dyn RelationSource) -> Result<ScoringService, PipelineError> {
        let scaler = self.artifacts.load_scaler()?;
        let model = self.artifacts.load_model()?;
        let features = self.load_and_build(source)?;
        let trained = scaler.missing_value_policy();
        let current = features.table.policy();
        if trained != current {
            return Err(self.fail(
                "serving",
                PipelineError::Artifact {
                    path: self.artifacts.scaler_path(),
                    reason: format!(
                        "scaler was fitted with avg_days_fill = {}, features use {}",
                        trained.avg_days_fill, current.avg_days_fill
                    ),
                },
            ));
        }
        Ok(self.service(features.table, scaler, model))
    }

    fn service(
        &self,
        table: Arc<FeatureTable>,
        scaler: StandardScaler,
        model: LogisticModel,
    ) -> ScoringService {
        // Validated at build time.
        let threshold = self.config.threshold().unwrap_or_default();
        let service = ScoringService::new(table, Arc::new(scaler), Arc::new(model))
            .with_default_threshold(threshold);
        match &self.telemetry {
            Some(telemetry) => service.with_telemetry(telemetry.clone()),
            None => service,
        }
    }

    fn fail(&self, stage: &str, err: PipelineError) -> PipelineError {
        let payload = json!({ "stage": stage, "error": err.to_string() });
        self.log(LogLevel::Error, "run.failed", payload.clone());
        self.event(PipelineStage::RunFailed, payload);
        err
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(telemetry) = self.telemetry.as_ref() {
            let _ = telemetry.log(level, message, metadata);
        }
    }

    fn event(&self, stage: PipelineStage, payload: Value) {
        if let Some(telemetry) = self.telemetry.as_ref() {
            let _ = telemetry.event(stage, payload);
        }
    }
}
