use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::{
    assembler::MissingValuePolicy,
    error::PipelineError,
    loader::{CsvDirectorySource, RelationFiles},
    scoring::{decision::Threshold, model::TrainingConfig},
};

/// Pipeline configuration document.
///
/// Every field has a default, so an empty file is a valid configuration. Relative paths are
/// resolved against the directory of the file they were read from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input relations.
    pub data: DataSection,
    /// Feature assembly.
    pub features: FeatureSection,
    /// Split and optimizer settings.
    pub training: TrainingSection,
    /// Serving defaults.
    pub serving: ServingSection,
    /// Persisted outputs.
    pub artifacts: ArtifactSection,
    /// Log and event sinks.
    pub logging: LoggingSection,
    #[serde(skip)]
    source_dir: Option<PathBuf>,
}

/// `[data]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    /// Directory holding the relation CSV files.
    pub dir: PathBuf,
    /// File name per relation.
    #[serde(flatten)]
    pub files: RelationFiles,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            files: RelationFiles::default(),
        }
    }
}

/// `[features]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSection {
    /// Fill value for a missing `avg_days_between_orders`.
    pub avg_days_fill: f64,
    /// Aggregation shards.
    pub shards: usize,
    /// Feature tables kept by the fingerprint cache.
    pub cache_capacity: usize,
}

impl Default for FeatureSection {
    fn default() -> Self {
        Self {
            avg_days_fill: 0.0,
            shards: 1,
            cache_capacity: 4,
        }
    }
}

/// `[training]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    /// Share of rows held out for validation.
    pub test_ratio: f64,
    /// Split and shuffle seed.
    pub seed: u64,
    /// Maximum epochs.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Gradient step size.
    pub learning_rate: f64,
    /// Early-stopping patience in epochs.
    pub patience: usize,
}

impl Default for TrainingSection {
    fn default() -> Self {
        let optimizer = TrainingConfig::default();
        Self {
            test_ratio: 0.2,
            seed: optimizer.seed,
            epochs: optimizer.epochs,
            batch_size: optimizer.batch_size,
            learning_rate: optimizer.learning_rate,
            patience: optimizer.patience,
        }
    }
}

impl TrainingSection {
    /// Optimizer settings for the trainer.
    #[must_use]
    pub const fn optimizer(&self) -> TrainingConfig {
        TrainingConfig {
            learning_rate: self.learning_rate,
            epochs: self.epochs,
            batch_size: self.batch_size,
            patience: self.patience,
            seed: self.seed,
        }
    }
}

/// `[serving]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingSection {
    /// Default decision threshold.
    pub threshold: f64,
}

impl Default for ServingSection {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

/// `[artifacts]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSection {
    /// Output directory.
    pub dir: PathBuf,
    /// Scaler file name.
    pub scaler_file: String,
    /// Model file name.
    pub model_file: String,
    /// Feature table export file name.
    pub features_file: String,
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            scaler_file: "scaler.json".into(),
            model_file: "reorder_model.json".into(),
            features_file: "features.csv".into(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// JSON-lines log file; logging is off when unset.
    pub path: Option<PathBuf>,
    /// Minimum level written (`debug`, `info`, `warn`, `error`).
    pub min_level: String,
    /// JSON-lines stage event file; events are off when unset.
    pub event_log: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            path: None,
            min_level: "info".into(),
            event_log: None,
        }
    }
}

impl PipelineConfig {
    /// Loads and validates a TOML document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            PipelineError::Config(format!("reading {}: {err}", path.display()))
        })?;
        let mut config = Self::from_toml(&raw)
            .map_err(|err| PipelineError::Config(format!("{}: {err}", path.display())))?;
        let source_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.source_dir = Some(source_dir);
        let data_dir = config.resolve_path(&config.data.dir);
        let artifacts_dir = config.resolve_path(&config.artifacts.dir);
        let log_path = config.logging.path.as_ref().map(|log| config.resolve_path(log));
        let event_log = config
            .logging
            .event_log
            .as_ref()
            .map(|log| config.resolve_path(log));
        config.data.dir = data_dir;
        config.artifacts.dir = artifacts_dir;
        config.logging.path = log_path;
        config.logging.event_log = event_log;
        Ok(config)
    }

    /// Parses and validates a TOML string; paths are left as written.
    pub fn from_toml(raw: &str) -> Result<Self, PipelineError> {
        let config: Self =
            toml::from_str(raw).map_err(|err| PipelineError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));
        let ratio = self.training.test_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return invalid(format!("training.test_ratio must be in (0, 1), got {ratio}"));
        }
        if self.features.shards == 0 {
            return invalid("features.shards must be >= 1".into());
        }
        if !self.features.avg_days_fill.is_finite() {
            return invalid("features.avg_days_fill must be finite".into());
        }
        self.training
            .optimizer()
            .validate()
            .map_err(|err| PipelineError::Config(err.to_string()))?;
        self.threshold()?;
        self.log_level()?;
        Ok(())
    }

    /// Resolves a path relative to the configuration file; absolute paths and configs
    /// built in memory leave it unchanged.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        match &self.source_dir {
            Some(dir) => resolve(dir, candidate.as_ref()),
            None => candidate.as_ref().to_path_buf(),
        }
    }

    /// Relation source for `[data]`.
    #[must_use]
    pub fn relation_source(&self) -> CsvDirectorySource {
        CsvDirectorySource::with_files(&self.data.dir, self.data.files.clone())
    }

    /// Fill policy for `[features]`.
    #[must_use]
    pub const fn missing_value_policy(&self) -> MissingValuePolicy {
        MissingValuePolicy {
            avg_days_fill: self.features.avg_days_fill,
        }
    }

    /// Default serving threshold.
    pub fn threshold(&self) -> Result<Threshold, PipelineError> {
        Threshold::new(self.serving.threshold).map_err(|err| PipelineError::Config(err.to_string()))
    }

    /// Minimum log level.
    pub fn log_level(&self) -> Result<LogLevel, PipelineError> {
        self.logging
            .min_level
            .parse()
            .map_err(|err: anyhow::Error| PipelineError::Config(err.to_string()))
    }
}

fn resolve(base: &Path, candidate: &Path) -> PathBuf {
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::RelationKind;

    #[test]
    fn empty_document_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert!((config.training.test_ratio - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.optimizer(), TrainingConfig::default());
        assert!((config.threshold().unwrap().value() - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.log_level().unwrap(), LogLevel::Info);
        assert_eq!(
            config.data.files.file_name(RelationKind::PriorOrderLines),
            "order_products__prior.csv"
        );
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            r#"
[data]
dir = "input"
orders = "orders_v2.csv"

[features]
avg_days_fill = -1.0
shards = 4

[artifacts]
dir = "/var/lib/reorder"

[logging]
path = "logs/pipeline.log"
min_level = "debug"
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.data.dir, dir.path().join("input"));
        assert_eq!(config.data.files.orders, "orders_v2.csv");
        assert_eq!(config.data.files.products, "products.csv");
        assert_eq!(config.artifacts.dir, PathBuf::from("/var/lib/reorder"));
        assert_eq!(
            config.logging.path.as_deref(),
            Some(dir.path().join("logs/pipeline.log").as_path())
        );
        assert_eq!(config.features.shards, 4);
        assert!((config.missing_value_policy().avg_days_fill + 1.0).abs() < f64::EPSILON);
        assert_eq!(config.resolve_path("x.csv"), dir.path().join("x.csv"));
        assert_eq!(
            config.relation_source().path_for(RelationKind::Orders),
            dir.path().join("input/orders_v2.csv")
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for doc in [
            "[training]\ntest_ratio = 1.0",
            "[training]\ntest_ratio = 0.0",
            "[training]\nbatch_size = 0",
            "[training]\nepochs = 0",
            "[features]\nshards = 0",
            "[serving]\nthreshold = 1.2",
            "[logging]\nmin_level = \"loud\"",
        ] {
            assert!(
                matches!(PipelineConfig::from_toml(doc), Err(PipelineError::Config(_))),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn bundled_config_points_at_sample_dataset() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("pipeline.toml");
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.features.shards, 2);
        assert!(config
            .relation_source()
            .path_for(RelationKind::Orders)
            .is_file());
    }

    #[test]
    fn in_memory_config_leaves_paths_as_written() {
        let config = PipelineConfig::from_toml("[data]\ndir = \"input\"").unwrap();
        assert_eq!(config.data.dir, PathBuf::from("input"));
        assert_eq!(config.resolve_path("x.csv"), PathBuf::from("x.csv"));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = PipelineConfig::load("/nonexistent/pipeline.toml").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
