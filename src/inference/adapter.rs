use std::fmt::Display;

use anyhow::Result;
use serde::Serialize;

use crate::error::PredictionError;
use crate::inference::features::FeatureVector;
use crate::inference::preprocess::PixelGrid;

/// Probability mass at or above which the positive class is predicted
pub const DECISION_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Diabetes,
    Tumour,
}

impl Condition {
    pub fn label(self, positive: bool) -> Label {
        match (self, positive) {
            (Condition::Diabetes, true) => Label::Diabetic,
            (Condition::Diabetes, false) => Label::NotDiabetic,
            (Condition::Tumour, true) => Label::Tumour,
            (Condition::Tumour, false) => Label::NoTumour,
        }
    }

    /// Substring that marks a textual model label as the positive class
    fn positive_token(self) -> &'static str {
        match self {
            Condition::Diabetes => "diabet",
            Condition::Tumour => "tumo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Label {
    Diabetic,
    #[serde(rename = "Not Diabetic")]
    NotDiabetic,
    Tumour,
    #[serde(rename = "No Tumour")]
    NoTumour,
}

impl Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Diabetic => write!(f, "Diabetic"),
            Label::NotDiabetic => write!(f, "Not Diabetic"),
            Label::Tumour => write!(f, "Tumour"),
            Label::NoTumour => write!(f, "No Tumour"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionResult {
    pub label: Label,
    /// Absent when the model only reports hard labels
    pub confidence: Option<f32>,
}

/// Hard label as emitted by a classifier without a probability output
#[derive(Debug, Clone, PartialEq)]
pub enum RawLabel {
    Numeric(f64),
    Text(String),
}

impl RawLabel {
    pub fn is_positive(&self, condition: Condition) -> bool {
        match self {
            RawLabel::Numeric(value) => *value == 1.0,
            RawLabel::Text(text) => {
                let text = text.trim().to_lowercase();
                text.contains(condition.positive_token())
                    || matches!(text.as_str(), "1" | "true" | "yes")
            }
        }
    }
}

pub trait ProbabilityClassifier: Send + Sync {
    /// Per-class probabilities for a single sample
    fn predict_proba(&self, features: &FeatureVector) -> Result<Vec<f32>>;
}

pub trait LabelClassifier: Send + Sync {
    fn predict_label(&self, features: &FeatureVector) -> Result<RawLabel>;
}

pub trait ImageClassifier: Send + Sync {
    /// Raw output scores for a single `(1, H, W, 3)` image, either one sigmoid value or one score per class
    fn predict_scores(&self, pixels: &PixelGrid) -> Result<Vec<f32>>;
}

/// A tabular model together with the capability it was found to expose at load time
pub enum TabularModel {
    Probabilistic(Box<dyn ProbabilityClassifier>),
    LabelOnly(Box<dyn LabelClassifier>),
}

impl TabularModel {
    pub fn kind(&self) -> &'static str {
        match self {
            TabularModel::Probabilistic(_) => "probabilistic",
            TabularModel::LabelOnly(_) => "label-only",
        }
    }

    /// Probability of the positive class, `None` for label-only models.
    pub fn positive_probability(
        &self,
        features: &FeatureVector,
    ) -> Result<Option<f32>, PredictionError> {
        match self {
            TabularModel::Probabilistic(model) => {
                let probabilities = model
                    .predict_proba(features)
                    .map_err(PredictionError::inference)?;
                positive_class_probability(&probabilities).map(Some)
            }
            TabularModel::LabelOnly(_) => Ok(None),
        }
    }
}

fn positive_class_probability(probabilities: &[f32]) -> Result<f32, PredictionError> {
    let probability = match probabilities {
        [] => {
            return Err(PredictionError::ModelInference(
                "model returned no probabilities".to_string(),
            ))
        }
        [single] => *single,
        [_, positive, ..] => *positive,
    };
    if !probability.is_finite() {
        return Err(PredictionError::ModelInference(format!(
            "model returned a non-finite probability: {probability}"
        )));
    }
    Ok(probability.clamp(0.0, 1.0))
}

/// Runs a tabular model and normalizes its output, regardless of whether it reports probabilities.
pub fn predict_with_confidence(
    model: &TabularModel,
    features: &FeatureVector,
    condition: Condition,
) -> Result<PredictionResult, PredictionError> {
    match model {
        TabularModel::Probabilistic(_) => {
            let probability = model
                .positive_probability(features)?
                .unwrap_or_default();
            Ok(PredictionResult {
                label: condition.label(probability >= DECISION_THRESHOLD),
                confidence: Some(probability),
            })
        }
        TabularModel::LabelOnly(classifier) => {
            let raw = classifier
                .predict_label(features)
                .map_err(PredictionError::inference)?;
            Ok(PredictionResult {
                label: condition.label(raw.is_positive(condition)),
                confidence: None,
            })
        }
    }
}

/// Interprets CNN scores. A single value is a sigmoid probability of the positive class and the
/// confidence is that of the predicted class. Several values are class scores where `positive_index`
/// names the positive class.
pub fn interpret_vision_output(
    scores: &[f32],
    positive_index: usize,
    condition: Condition,
) -> Result<PredictionResult, PredictionError> {
    if let Some(bad) = scores.iter().find(|score| !score.is_finite()) {
        return Err(PredictionError::ModelInference(format!(
            "model returned a non-finite score: {bad}"
        )));
    }
    match scores {
        [] => Err(PredictionError::ModelInference(
            "model returned no scores".to_string(),
        )),
        [probability] => {
            let probability = probability.clamp(0.0, 1.0);
            let positive = probability >= DECISION_THRESHOLD;
            let confidence = if positive {
                probability
            } else {
                1.0 - probability
            };
            Ok(PredictionResult {
                label: condition.label(positive),
                confidence: Some(confidence),
            })
        }
        _ if positive_index >= scores.len() => Err(PredictionError::ModelInference(format!(
            "positive class index {positive_index} is out of range for {} class scores",
            scores.len()
        ))),
        _ => {
            // Ties resolve to the lowest index
            let (index, score) = scores.iter().copied().enumerate().fold(
                (0, f32::NEG_INFINITY),
                |best, (i, score)| if score > best.1 { (i, score) } else { best },
            );
            Ok(PredictionResult {
                label: condition.label(index == positive_index),
                confidence: Some(score.clamp(0.0, 1.0)),
            })
        }
    }
}
