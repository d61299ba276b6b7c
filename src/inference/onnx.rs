use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tract_onnx::prelude::*;

use crate::inference::adapter::{
    ImageClassifier, LabelClassifier, ProbabilityClassifier, RawLabel, TabularModel,
};
use crate::inference::features::{FeatureVector, FEATURE_COUNT};
use crate::inference::preprocess::{ImageSize, PixelGrid};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// A scikit-learn classifier exported to ONNX, run on a single `(1, FEATURE_COUNT)` row
pub struct OnnxTabularModel {
    plan: Plan,
    /// Index of the graph output read by this model
    output: usize,
}

impl OnnxTabularModel {
    /// Loads the model and decides once whether it exposes class probabilities.
    ///
    /// sklearn exports emit the hard label first and, for classifiers with `predict_proba`, a float
    /// probability tensor after it. The first float output wins, otherwise the model is label-only.
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<TabularModel> {
        let model = tract_onnx::onnx()
            .model_for_path(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, FEATURE_COUNT)),
            )?
            .into_optimized()?;

        let output_types = (0..model.outputs.len())
            .map(|ix| model.output_fact(ix).map(|fact| fact.datum_type))
            .collect::<TractResult<Vec<DatumType>>>()?;
        tracing::debug!(?output_types, "tabular model outputs");
        if output_types.is_empty() {
            bail!("Model has no outputs");
        }

        let probability_output = output_types.iter().position(|dt| dt.is_float());
        let plan = model.into_runnable()?;

        Ok(match probability_output {
            Some(output) => TabularModel::Probabilistic(Box::new(OnnxTabularModel { plan, output })),
            None => TabularModel::LabelOnly(Box::new(OnnxTabularModel { plan, output: 0 })),
        })
    }

    fn run(&self, features: &FeatureVector) -> Result<TVec<TValue>> {
        let input = Tensor::from_shape(&[1, FEATURE_COUNT], features.as_slice())?;
        self.plan.run(tvec!(input.into()))
    }

    fn selected<'a>(&self, outputs: &'a TVec<TValue>) -> Result<&'a Tensor> {
        outputs
            .get(self.output)
            .map(|value| &**value)
            .ok_or_else(|| anyhow!("Model produced no output at index {}", self.output))
    }
}

impl ProbabilityClassifier for OnnxTabularModel {
    fn predict_proba(&self, features: &FeatureVector) -> Result<Vec<f32>> {
        let outputs = self.run(features)?;
        let probabilities = self.selected(&outputs)?.cast_to::<f32>()?;
        let probabilities = probabilities.as_slice::<f32>()?.to_vec();
        Ok(probabilities)
    }
}

impl LabelClassifier for OnnxTabularModel {
    fn predict_label(&self, features: &FeatureVector) -> Result<RawLabel> {
        let outputs = self.run(features)?;
        let label = self.selected(&outputs)?;
        if label.datum_type() == DatumType::String {
            let text = label
                .as_slice::<String>()?
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("Model returned an empty label tensor"))?;
            return Ok(RawLabel::Text(text));
        }
        let numeric = label.cast_to::<f64>()?;
        let value = numeric
            .as_slice::<f64>()?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("Model returned an empty label tensor"))?;
        Ok(RawLabel::Numeric(value))
    }
}

/// A Keras CNN exported to ONNX taking `(1, H, W, 3)` normalized pixels
pub struct OnnxImageModel {
    plan: Plan,
}

impl OnnxImageModel {
    /// Loads the CNN and, when its class count is known statically, checks that `positive_index`
    /// names one of its classes.
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, size: ImageSize, positive_index: usize) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_path(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, size.height as usize, size.width as usize, 3),
                ),
            )?
            .into_optimized()?;

        let classes = model
            .output_fact(0)?
            .shape
            .as_concrete()
            .and_then(|shape| shape.last().copied());
        tracing::debug!(?classes, "vision model classes");
        if let Some(classes) = classes {
            if classes > 1 && positive_index >= classes {
                bail!("tumour_class_index {positive_index} is out of range for a model with {classes} classes");
            }
        }

        Ok(Self {
            plan: model.into_runnable()?,
        })
    }
}

impl ImageClassifier for OnnxImageModel {
    fn predict_scores(&self, pixels: &PixelGrid) -> Result<Vec<f32>> {
        let input = Tensor::from_shape(&pixels.shape(), pixels.as_slice())?;
        let outputs = self.plan.run(tvec!(input.into()))?;
        let scores = outputs
            .first()
            .ok_or_else(|| anyhow!("Model produced no output"))?
            .to_array_view::<f32>()?
            .iter()
            .copied()
            .collect();
        Ok(scores)
    }
}
