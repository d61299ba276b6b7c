use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::PredictionError;
use crate::inference::adapter::{
    interpret_vision_output, predict_with_confidence, Condition, ImageClassifier, Label,
    TabularModel,
};
use crate::inference::features::{standardize, FeatureVector};
use crate::inference::onnx::{OnnxImageModel, OnnxTabularModel};
use crate::inference::preprocess::{preprocess, ImageSize};

/// A model handle resolved at startup. A failed load is kept with its reason so requests can report it.
pub enum ModelSlot<T> {
    Loaded(T),
    Unavailable(String),
}

impl<T> ModelSlot<T> {
    fn from_load(name: &str, path: &str, result: anyhow::Result<T>) -> Self {
        match result {
            Ok(model) => {
                tracing::info!("Loaded {} model from {}", name, path);
                ModelSlot::Loaded(model)
            }
            Err(err) => {
                tracing::error!("Failed to load {} model from {}: {:#}", name, path, err);
                ModelSlot::Unavailable(format!("{err:#}"))
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelSlot::Loaded(_))
    }

    fn get(&self, model: &'static str) -> Result<&T, PredictionError> {
        match self {
            ModelSlot::Loaded(handle) => Ok(handle),
            ModelSlot::Unavailable(reason) => Err(PredictionError::ModelUnavailable {
                model,
                reason: reason.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub image_size: ImageSize,
    pub tumour_class_index: usize,
    pub legacy_alert_threshold: f32,
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        ServiceSettings {
            image_size: ImageSize {
                width: config.image_width,
                height: config.image_height,
            },
            tumour_class_index: config.tumour_class_index,
            legacy_alert_threshold: config.legacy_alert_threshold,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub diabetes_model_loaded: bool,
    pub cnn_model_loaded: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiabetesPrediction {
    pub prediction: Label,
    pub confidence: Option<f32>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TumourPrediction {
    pub prediction: Label,
    pub confidence: f32,
}

/// Outcome of the legacy form predictor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAssessment {
    pub probability: f32,
    pub elevated: bool,
}

/// Owns both models for the lifetime of the process and runs the prediction pipelines.
pub struct PredictionService {
    diabetes: ModelSlot<TabularModel>,
    tumour: ModelSlot<Box<dyn ImageClassifier>>,
    settings: ServiceSettings,
}

impl PredictionService {
    pub fn new(
        diabetes: ModelSlot<TabularModel>,
        tumour: ModelSlot<Box<dyn ImageClassifier>>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            diabetes,
            tumour,
            settings,
        }
    }

    /// Loads both models from disk. Load failures leave the matching endpoints unavailable.
    pub fn load(config: &Config) -> Self {
        let settings = ServiceSettings::from(config);
        let diabetes = ModelSlot::from_load(
            "diabetes",
            &config.diabetes_model_path,
            OnnxTabularModel::load(&config.diabetes_model_path),
        );
        if let ModelSlot::Loaded(model) = &diabetes {
            tracing::info!("Diabetes model is {}", model.kind());
        }
        let tumour = ModelSlot::from_load(
            "CNN",
            &config.cnn_model_path,
            OnnxImageModel::load(
                &config.cnn_model_path,
                settings.image_size,
                settings.tumour_class_index,
            )
            .map(|model| Box::new(model) as Box<dyn ImageClassifier>),
        );
        Self::new(diabetes, tumour, settings)
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "ok",
            diabetes_model_loaded: self.diabetes.is_loaded(),
            cnn_model_loaded: self.tumour.is_loaded(),
        }
    }

    pub fn ensure_diabetes_model(&self) -> Result<(), PredictionError> {
        self.diabetes.get("Diabetes").map(|_| ())
    }

    pub fn ensure_tumour_model(&self) -> Result<(), PredictionError> {
        self.tumour.get("CNN").map(|_| ())
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub fn predict_diabetes(
        &self,
        record: &Map<String, Value>,
    ) -> Result<DiabetesPrediction, PredictionError> {
        let model = self.diabetes.get("Diabetes")?;
        let features = standardize(record)?;
        tracing::debug!(?features, "standardized diabetes request");

        let result = predict_with_confidence(model, &features, Condition::Diabetes)?;
        tracing::info!(prediction = %result.label, confidence = ?result.confidence, "diabetes prediction");
        Ok(DiabetesPrediction {
            prediction: result.label,
            confidence: result.confidence,
        })
    }

    #[tracing::instrument(level = "info", skip_all, fields(len = image.len()))]
    pub fn predict_tumour(&self, image: &[u8]) -> Result<TumourPrediction, PredictionError> {
        let model = self.tumour.get("CNN")?;
        let pixels = preprocess(image, self.settings.image_size)?;
        let scores = model
            .predict_scores(&pixels)
            .map_err(PredictionError::inference)?;
        tracing::debug!(?scores, "tumour model scores");

        let result =
            interpret_vision_output(&scores, self.settings.tumour_class_index, Condition::Tumour)?;
        let confidence = round_to(result.confidence.unwrap_or_default(), 4);
        tracing::info!(prediction = %result.label, confidence, "tumour prediction");
        Ok(TumourPrediction {
            prediction: result.label,
            confidence,
        })
    }

    /// Scores positional form values with the diabetes model's probability output.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn assess_risk(&self, values: &[f32]) -> Result<RiskAssessment, PredictionError> {
        let model = self.diabetes.get("Diabetes")?;
        let features = FeatureVector::from_positional(values)?;
        let probability = model.positive_probability(&features)?.ok_or_else(|| {
            PredictionError::ModelInference(
                "the diabetes model does not report probabilities".to_string(),
            )
        })?;
        Ok(RiskAssessment {
            probability,
            elevated: probability >= self.settings.legacy_alert_threshold,
        })
    }
}

fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}
