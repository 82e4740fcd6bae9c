//! Prediction engine over a versioned regression model artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spp_core::{FeatureLayout, FeatureVector, SchemaVersion, SppError, SppResult};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "spp-model";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("reading model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model artifact is inconsistent: {0}")]
    Contract(String),
}

/// On-disk description of a fitted linear regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: String,
    pub features: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub output_range: Option<(f64, f64)>,
}

pub trait RegressionModel: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn layout(&self) -> FeatureLayout;

    fn arity(&self) -> usize {
        self.layout().arity()
    }

    /// Scores one vector. Callers have already checked its arity.
    fn predict_one(&self, features: &[f64]) -> f64;
}

#[derive(Debug, Clone)]
pub struct LinearModel {
    artifact: ModelArtifact,
    layout: FeatureLayout,
}

impl LinearModel {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelError> {
        let layout = FeatureLayout::from_feature_names(&artifact.features).ok_or_else(|| {
            ModelError::Contract(format!(
                "feature list {:?} matches neither {:?} nor {:?}",
                artifact.features,
                FeatureLayout::Composite.feature_names(),
                FeatureLayout::Extended.feature_names(),
            ))
        })?;
        if artifact.coefficients.len() != artifact.features.len() {
            return Err(ModelError::Contract(format!(
                "{} coefficients for {} features",
                artifact.coefficients.len(),
                artifact.features.len()
            )));
        }
        if !artifact.intercept.is_finite() || artifact.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelError::Contract("weights must be finite".into()));
        }
        if let Some((lo, hi)) = artifact.output_range {
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(ModelError::Contract(format!("empty output range [{lo}, {hi}]")));
            }
        }
        Ok(Self { artifact, layout })
    }

    pub fn from_json(text: &str) -> Result<Self, ModelError> {
        Self::from_artifact(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_json(&text)?;
        info!(
            path = %path.display(),
            model = %model.artifact.name,
            version = %model.artifact.version,
            arity = model.layout.arity(),
            "loaded regression model"
        );
        Ok(model)
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }
}

impl RegressionModel for LinearModel {
    fn name(&self) -> &str {
        &self.artifact.name
    }

    fn version(&self) -> &str {
        &self.artifact.version
    }

    fn layout(&self) -> FeatureLayout {
        self.layout
    }

    fn predict_one(&self, features: &[f64]) -> f64 {
        let raw = self.artifact.intercept
            + self
                .artifact
                .coefficients
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>();
        match self.artifact.output_range {
            Some((lo, hi)) => raw.clamp(lo, hi),
            None => raw,
        }
    }
}

/// Loaded once at startup and shared; stateless per call.
#[derive(Clone)]
pub struct PredictionEngine {
    model: Arc<dyn RegressionModel>,
}

impl std::fmt::Debug for PredictionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionEngine")
            .field("model", &self.model.name())
            .field("version", &self.model.version())
            .field("layout", &self.model.layout())
            .finish()
    }
}

impl PredictionEngine {
    pub fn new(model: Arc<dyn RegressionModel>) -> Self {
        Self { model }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        Ok(Self::new(Arc::new(LinearModel::load(path)?)))
    }

    pub fn layout(&self) -> FeatureLayout {
        self.model.layout()
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn model_version(&self) -> &str {
        self.model.version()
    }

    /// The store must be able to hold every feature the model consumes.
    pub fn check_schema(&self, version: SchemaVersion) -> SppResult<()> {
        let needed = version.feature_layout();
        if needed == self.layout() {
            return Ok(());
        }
        Err(SppError::ModelInputShape {
            expected: self.model.arity(),
            actual: needed.arity(),
        })
    }

    pub fn predict(&self, features: &FeatureVector) -> SppResult<f64> {
        self.check(features)?;
        self.score(features)
    }

    /// All vectors are checked before any is scored; one bad vector fails the batch.
    pub fn predict_batch(&self, batch: &[FeatureVector]) -> SppResult<Vec<f64>> {
        for features in batch {
            self.check(features)?;
        }
        let scores = batch.iter().map(|f| self.score(f)).collect::<SppResult<Vec<_>>>()?;
        debug!(count = scores.len(), model = self.model.name(), "scored batch");
        Ok(scores)
    }

    fn check(&self, features: &FeatureVector) -> SppResult<()> {
        if features.layout() != self.layout() || features.len() != self.model.arity() {
            return Err(SppError::ModelInputShape {
                expected: self.model.arity(),
                actual: features.len(),
            });
        }
        Ok(())
    }

    fn score(&self, features: &FeatureVector) -> SppResult<f64> {
        let score = self.model.predict_one(features.values());
        if !score.is_finite() {
            return Err(SppError::InvalidInput(format!(
                "model produced a non-finite score for {:?}",
                features.values()
            )));
        }
        Ok(score)
    }
}
