use std::path::{Path, PathBuf};

use crate::{
    assembler::FeatureTable,
    config::ArtifactSection,
    error::PipelineError,
    scoring::{model::LogisticModel, scaler::StandardScaler},
};

/// Locations of the persisted scaler, model, and feature export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStore {
    dir: PathBuf,
    scaler_file: String,
    model_file: String,
    features_file: String,
}

impl ArtifactStore {
    /// Store using the default file names inside `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::from_section(&ArtifactSection {
            dir: dir.into(),
            ..ArtifactSection::default()
        })
    }

    /// Store described by an `[artifacts]` section.
    #[must_use]
    pub fn from_section(section: &ArtifactSection) -> Self {
        Self {
            dir: section.dir.clone(),
            scaler_file: section.scaler_file.clone(),
            model_file: section.model_file.clone(),
            features_file: section.features_file.clone(),
        }
    }

    /// Output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scaler path.
    #[must_use]
    pub fn scaler_path(&self) -> PathBuf {
        self.dir.join(&self.scaler_file)
    }

    /// Model path.
    #[must_use]
    pub fn model_path(&self) -> PathBuf {
        self.dir.join(&self.model_file)
    }

    /// Feature export path.
    #[must_use]
    pub fn features_path(&self) -> PathBuf {
        self.dir.join(&self.features_file)
    }

    /// Persists the scaler.
    pub fn save_scaler(&self, scaler: &StandardScaler) -> Result<PathBuf, PipelineError> {
        let path = self.scaler_path();
        scaler
            .save(&path)
            .map_err(|err| artifact_error(&path, &err))?;
        Ok(path)
    }

    /// Loads the scaler written by [`Self::save_scaler`].
    pub fn load_scaler(&self) -> Result<StandardScaler, PipelineError> {
        let path = self.scaler_path();
        StandardScaler::load(&path).map_err(|err| artifact_error(&path, &err))
    }

    /// Persists the model.
    pub fn save_model(&self, model: &LogisticModel) -> Result<PathBuf, PipelineError> {
        let path = self.model_path();
        model.save(&path).map_err(|err| artifact_error(&path, &err))?;
        Ok(path)
    }

    /// Loads the model written by [`Self::save_model`].
    pub fn load_model(&self) -> Result<LogisticModel, PipelineError> {
        let path = self.model_path();
        LogisticModel::load(&path).map_err(|err| artifact_error(&path, &err))
    }

    /// Exports the feature table as CSV.
    pub fn write_features(&self, table: &FeatureTable) -> Result<PathBuf, PipelineError> {
        let path = self.features_path();
        table.write_csv(&path)?;
        Ok(path)
    }

    /// True when both the scaler and the model exist on disk.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.scaler_path().is_file() && self.model_path().is_file()
    }
}

fn artifact_error(path: &Path, err: &dyn std::error::Error) -> PipelineError {
    PipelineError::Artifact {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::FEATURE_DIM;

    #[test]
    fn saves_and_loads_scaler_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("models"));
        assert!(!store.is_complete());

        let scaler = StandardScaler::fit(&[[1.0; FEATURE_DIM], [3.0; FEATURE_DIM]]).unwrap();
        let model = LogisticModel::from_parameters([0.5; FEATURE_DIM], 0.1);
        store.save_scaler(&scaler).unwrap();
        store.save_model(&model).unwrap();
        assert!(store.is_complete());

        assert_eq!(store.load_scaler().unwrap(), scaler);
        assert_eq!(store.load_model().unwrap(), model);
        assert!(store.scaler_path().ends_with("models/scaler.json"));
    }

    #[test]
    fn missing_artifact_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        match store.load_model() {
            Err(PipelineError::Artifact { path, .. }) => assert_eq!(path, store.model_path()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
