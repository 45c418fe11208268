//! Applying the quantizer across a model's linear layers
//!
//! The model itself is external: it hands over its linear layers as
//! [`LinearWeights`] and receives a [`QuantizedModel`] whose selected layers
//! are replaced by [`MixedPrecisionLinear`]. Layers are independent, so they
//! are built and their masks generated in parallel.

use super::diagnostics::QuantDiagnostics;
use super::layer::MixedPrecisionLinear;
use crate::config::QuantizationConfig;
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// One linear layer of an external model
#[derive(Clone, Debug)]
pub struct LinearWeights {
    /// Dotted module path, e.g. `model.layers.0.self_attn.q_proj`
    pub name: String,
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearWeights {
    pub fn new(name: impl Into<String>, weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            name: name.into(),
            weight,
            bias,
        }
    }

    /// Unquantized `input · W^T + bias`
    pub fn apply(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.weight.ncols() {
            return Err(Error::ShapeMismatch {
                expected: vec![input.nrows(), self.weight.ncols()],
                got: input.shape().to_vec(),
            });
        }
        let mut output = input.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            output += bias;
        }
        Ok(output)
    }
}

/// Which linear layers get quantized
#[derive(Clone, Debug)]
pub struct LayerSelection {
    /// Module names (last path segment) to quantize when not `all_linear`
    pub target_modules: HashSet<String>,
    /// Quantize every layer not excluded
    pub all_linear: bool,
    /// Module names kept in full precision regardless of the above
    pub exclude: HashSet<String>,
}

impl Default for LayerSelection {
    /// Every linear layer except `lm_head`
    fn default() -> Self {
        Self {
            target_modules: HashSet::new(),
            all_linear: true,
            exclude: ["lm_head".to_string()].into_iter().collect(),
        }
    }
}

impl LayerSelection {
    /// Only the named modules, e.g. `&["q_proj", "v_proj"]`
    pub fn target_modules(modules: &[&str]) -> Self {
        Self {
            target_modules: modules.iter().map(|s| s.to_string()).collect(),
            all_linear: false,
            ..Self::default()
        }
    }

    pub fn exclude(mut self, modules: &[&str]) -> Self {
        self.exclude.extend(modules.iter().map(|s| s.to_string()));
        self
    }

    /// Matches either the full dotted name or its last segment
    pub fn should_quantize(&self, name: &str) -> bool {
        let module = name.rsplit('.').next().unwrap_or(name);
        if self.exclude.contains(name) || self.exclude.contains(module) {
            return false;
        }
        self.all_linear || self.target_modules.contains(name) || self.target_modules.contains(module)
    }
}

/// A model layer after selection
#[derive(Debug)]
pub enum ModelLayer {
    Quantized(MixedPrecisionLinear),
    Dense(LinearWeights),
}

impl ModelLayer {
    pub fn apply(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        match self {
            ModelLayer::Quantized(layer) => layer.apply(input),
            ModelLayer::Dense(layer) => layer.apply(input),
        }
    }
}

/// The linear layers of a model, in their original order
#[derive(Debug)]
pub struct QuantizedModel {
    layers: Vec<(String, ModelLayer)>,
}

impl QuantizedModel {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, name: &str) -> Option<&ModelLayer> {
        self.layers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, layer)| layer)
    }

    /// The quantized layer with this name, if it was selected
    pub fn get(&self, name: &str) -> Option<&MixedPrecisionLinear> {
        match self.layer(name)? {
            ModelLayer::Quantized(layer) => Some(layer),
            ModelLayer::Dense(_) => None,
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut MixedPrecisionLinear> {
        self.layers
            .iter_mut()
            .find(|(n, _)| n == name)
            .and_then(|(_, layer)| match layer {
                ModelLayer::Quantized(layer) => Some(layer),
                ModelLayer::Dense(_) => None,
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(n, _)| n.as_str())
    }

    pub fn quantized_count(&self) -> usize {
        self.quantized().count()
    }

    /// Apply the named layer to an input batch
    pub fn apply(&self, name: &str, input: &Array2<f32>) -> Result<Array2<f32>> {
        self.layer(name)
            .ok_or_else(|| Error::PreconditionViolation(format!("unknown layer '{name}'")))?
            .apply(input)
    }

    /// Diagnostics of every quantized layer whose mask exists
    pub fn diagnostics(&self) -> Vec<(String, QuantDiagnostics)> {
        self.quantized()
            .filter_map(|(name, layer)| layer.diagnostics().map(|d| (name.to_string(), d)))
            .collect()
    }

    /// Element-weighted outlier fraction across quantized layers
    pub fn mean_outlier_fraction(&self) -> Option<f64> {
        let (outliers, total) = self
            .diagnostics()
            .iter()
            .fold((0usize, 0usize), |(o, t), (_, d)| (o + d.outlier_count, t + d.total));
        (total > 0).then(|| outliers as f64 / total as f64)
    }

    pub fn train(&mut self) {
        self.quantized_mut().for_each(MixedPrecisionLinear::train);
    }

    pub fn eval(&mut self) {
        self.quantized_mut().for_each(MixedPrecisionLinear::eval);
    }

    fn quantized(&self) -> impl Iterator<Item = (&str, &MixedPrecisionLinear)> {
        self.layers.iter().filter_map(|(name, layer)| match layer {
            ModelLayer::Quantized(layer) => Some((name.as_str(), layer)),
            ModelLayer::Dense(_) => None,
        })
    }

    fn quantized_mut(&mut self) -> impl Iterator<Item = &mut MixedPrecisionLinear> {
        self.layers.iter_mut().filter_map(|(_, layer)| match layer {
            ModelLayer::Quantized(layer) => Some(layer),
            ModelLayer::Dense(_) => None,
        })
    }
}

/// Replace every selected linear layer with a [`MixedPrecisionLinear`].
///
/// The config is validated before any layer is touched. Selected layers have
/// their outlier masks generated eagerly, in parallel.
pub fn quantize_model(
    layers: Vec<LinearWeights>,
    config: Arc<QuantizationConfig>,
    selection: &LayerSelection,
) -> Result<QuantizedModel> {
    config.validate()?;

    let layers = layers
        .into_par_iter()
        .map(|linear| {
            if !selection.should_quantize(&linear.name) {
                debug!(layer = %linear.name, "kept in full precision");
                return Ok((linear.name.clone(), ModelLayer::Dense(linear)));
            }
            let LinearWeights { name, weight, bias } = linear;
            let layer = MixedPrecisionLinear::from_weights(weight, bias, Arc::clone(&config))?
                .with_name(name.clone());
            layer.prepare()?;
            Ok((name, ModelLayer::Quantized(layer)))
        })
        .collect::<Result<Vec<_>>>()?;

    let model = QuantizedModel { layers };
    info!(
        quantized = model.quantized_count(),
        total = model.len(),
        outlier_fraction = model.mean_outlier_fraction().unwrap_or(0.0),
        "quantized model"
    );
    Ok(model)
}
