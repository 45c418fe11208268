//! Outlier-aware mixed-precision linear layer
//!
//! Wraps one weight matrix `W ∈ ℝ^(out × in)` and an optional bias. Each
//! forward pass reconstructs a simulated weight:
//!
//! ```text
//! W_sim[r, c] = W[r, c] * outlier_scale      if mask[r, c]
//!             = sign(W[r, c]) * scale[r]     otherwise
//! ```
//!
//! The outlier mask is generated once, on the first forward call, and kept
//! for the lifetime of the layer (or until [`MixedPrecisionLinear::invalidate_mask`]).
//! The channel scale is recomputed on every call in training mode and frozen
//! in eval mode.

use super::binarize::{binarize, BinarizationStrategy};
use super::diagnostics::QuantDiagnostics;
use super::fake_quantize::{FakeQuantConfig, FakeQuantize};
use super::outlier::{OutlierMask, OutlierMaskGenerator};
use super::scale::{ChannelScale, ChannelScaleEstimator};
use crate::autograd::{add_row_broadcast, matmul, mul, scale, select, transpose, Tensor};
use crate::config::{HighPrecisionPolicy, QuantizationConfig};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Zip};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Cached quantization state of one layer
#[derive(Debug)]
enum CacheState {
    Uninitialized,
    MaskGenerated(QuantState),
}

#[derive(Clone, Debug)]
struct QuantState {
    mask: Arc<OutlierMask>,
    scale: ChannelScale,
    /// Calibrated grid for outliers; `None` under passthrough
    high: Option<FakeQuantize>,
}

/// Linear layer whose weight is binarized except for statistical outliers
#[derive(Debug)]
pub struct MixedPrecisionLinear {
    name: Option<String>,
    weight: Option<Array2<f32>>,
    bias: Option<Array1<f32>>,
    config: Arc<QuantizationConfig>,
    strategy: BinarizationStrategy,
    mask_generator: OutlierMaskGenerator,
    scale_estimator: ChannelScaleEstimator,
    training: bool,
    cache: Mutex<CacheState>,
}

impl MixedPrecisionLinear {
    /// Layer with no weight yet; the config is validated here, never lazily
    pub fn new(config: Arc<QuantizationConfig>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: None,
            weight: None,
            bias: None,
            strategy: BinarizationStrategy::from_method(config.binary_method),
            scale_estimator: ChannelScaleEstimator::new(config.perchannel),
            mask_generator: OutlierMaskGenerator::default(),
            config,
            training: true,
            cache: Mutex::new(CacheState::Uninitialized),
        })
    }

    pub fn from_weights(
        weight: Array2<f32>,
        bias: Option<Array1<f32>>,
        config: Arc<QuantizationConfig>,
    ) -> Result<Self> {
        let mut layer = Self::new(config)?;
        layer.set_weight(weight, bias)?;
        Ok(layer)
    }

    /// Name used in log events
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mask_generator(mut self, generator: OutlierMaskGenerator) -> Self {
        self.mask_generator = generator;
        self
    }

    /// Override the strategy derived from the config (e.g. saturating STE)
    pub fn with_strategy(mut self, strategy: BinarizationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Install a new weight. This is a different tensor, so cached state is dropped.
    pub fn set_weight(&mut self, weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<()> {
        if weight.is_empty() {
            return Err(Error::PreconditionViolation(format!(
                "weight must be non-empty, got shape {:?}",
                weight.shape()
            )));
        }
        if let Some(b) = &bias {
            if b.len() != weight.nrows() {
                return Err(Error::ShapeMismatch {
                    expected: vec![weight.nrows()],
                    got: vec![b.len()],
                });
            }
        }
        self.weight = Some(weight);
        self.bias = bias;
        self.invalidate_mask();
        Ok(())
    }

    pub fn weight(&self) -> Option<&Array2<f32>> {
        self.weight.as_ref()
    }

    /// In-place access for an optimizer step; the mask is NOT invalidated
    pub fn weight_mut(&mut self) -> Result<&mut Array2<f32>> {
        self.weight.as_mut().ok_or_else(unset_weight)
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    pub fn strategy(&self) -> BinarizationStrategy {
        self.strategy
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `(out_features, in_features)`
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.weight.as_ref().map(|w| w.dim())
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Drop the cached mask and scale; the next forward regenerates both
    pub fn invalidate_mask(&mut self) {
        *self.cache.get_mut() = CacheState::Uninitialized;
    }

    pub fn is_mask_generated(&self) -> bool {
        matches!(*self.cache.lock(), CacheState::MaskGenerated(_))
    }

    pub fn mask(&self) -> Option<Arc<OutlierMask>> {
        match &*self.cache.lock() {
            CacheState::MaskGenerated(state) => Some(Arc::clone(&state.mask)),
            CacheState::Uninitialized => None,
        }
    }

    pub fn scale(&self) -> Option<ChannelScale> {
        match &*self.cache.lock() {
            CacheState::MaskGenerated(state) => Some(state.scale.clone()),
            CacheState::Uninitialized => None,
        }
    }

    pub fn diagnostics(&self) -> Option<QuantDiagnostics> {
        match &*self.cache.lock() {
            CacheState::MaskGenerated(state) => {
                Some(QuantDiagnostics::new(&state.mask, &state.scale))
            }
            CacheState::Uninitialized => None,
        }
    }

    /// Generate the mask (and first scale) now rather than on the first forward
    pub fn prepare(&self) -> Result<()> {
        let weight = self.weight.as_ref().ok_or_else(unset_weight)?;
        self.quant_state(weight.view()).map(|_| ())
    }

    /// Reconstruct the simulated weight for the current weight values
    pub fn quantize_forward(&self) -> Result<Array2<f32>> {
        let weight = self.weight.as_ref().ok_or_else(unset_weight)?;
        let state = self.quant_state(weight.view())?;
        Ok(self.assemble(weight.view(), &state))
    }

    /// `input · W_sim^T + bias` for a `[batch, in_features]` input
    pub fn apply(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        let (_, in_features) = self.shape().ok_or_else(unset_weight)?;
        if input.nrows() == 0 {
            return Err(empty_batch());
        }
        if input.ncols() != in_features {
            return Err(Error::ShapeMismatch {
                expected: vec![input.nrows(), in_features],
                got: input.shape().to_vec(),
            });
        }

        let simulated = self.quantize_forward()?;
        let mut output = input.dot(&simulated.t());
        if let Some(bias) = &self.bias {
            output += bias;
        }
        Ok(output)
    }

    /// Single-row convenience wrapper around [`apply`](Self::apply)
    pub fn apply_vec(&self, input: &[f32]) -> Result<Array1<f32>> {
        let row = Array2::from_shape_vec((1, input.len()), input.to_vec()).map_err(|_| {
            Error::ShapeMismatch {
                expected: vec![1, input.len()],
                got: vec![input.len()],
            }
        })?;
        let output = self.apply(&row)?;
        Ok(output.row(0).to_owned())
    }

    /// The current weight as a gradient-tracking tensor for [`forward_tensor`](Self::forward_tensor)
    pub fn weight_tensor(&self) -> Result<Tensor> {
        let weight = self.weight.as_ref().ok_or_else(unset_weight)?;
        Ok(Tensor::from_array2(weight, true))
    }

    pub fn bias_tensor(&self) -> Option<Tensor> {
        self.bias
            .as_ref()
            .map(|b| Tensor::from_vec(b.to_vec(), true))
    }

    /// Differentiable forward over a flattened `[batch, in_features]` input.
    ///
    /// Mask and scale are refreshed from `weight` under the same policy as
    /// [`quantize_forward`](Self::quantize_forward). Gradients reaching
    /// `weight` are `outlier_scale · g` on outlier entries and
    /// `scale[row] · surrogate'(w) · g` elsewhere; the scale is treated as a
    /// constant.
    pub fn forward_tensor(
        &self,
        input: &Tensor,
        batch: usize,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (out_features, in_features) = self.shape().ok_or_else(unset_weight)?;
        if batch == 0 {
            return Err(empty_batch());
        }
        if weight.len() != out_features * in_features {
            return Err(Error::ShapeMismatch {
                expected: vec![out_features, in_features],
                got: vec![weight.len()],
            });
        }
        if input.len() != batch * in_features {
            return Err(Error::ShapeMismatch {
                expected: vec![batch, in_features],
                got: vec![input.len()],
            });
        }
        if let Some(b) = bias {
            if b.len() != out_features {
                return Err(Error::ShapeMismatch {
                    expected: vec![out_features],
                    got: vec![b.len()],
                });
            }
        }

        let weight_values = weight.to_array2(out_features, in_features)?;
        let state = self.quant_state(weight_values.view())?;

        let row_scale: Vec<f32> = state
            .scale
            .values()
            .iter()
            .flat_map(|&s| std::iter::repeat(s).take(in_features))
            .collect();
        let row_scale = Tensor::from_vec(row_scale, false);
        let binary = mul(&binarize(weight, self.strategy), &row_scale);

        let outlier = match &state.high {
            Some(fq) => scale(&fq.forward(weight), self.config.outlier_scale),
            None => scale(weight, self.config.outlier_scale),
        };

        let simulated = select(&state.mask.to_flat_vec(), &outlier, &binary);
        let simulated_t = transpose(&simulated, out_features, in_features);
        let output = matmul(input, &simulated_t, batch, in_features, out_features);

        Ok(match bias {
            Some(b) => add_row_broadcast(&output, b, batch, out_features),
            None => output,
        })
    }

    /// Estimated storage: 1 bit per binary entry, `high_bit` per outlier,
    /// a 1-bit mask over every entry, and one f32 per scale.
    ///
    /// `None` until the mask exists.
    pub fn storage_bits(&self) -> Option<u64> {
        let cache = self.cache.lock();
        let CacheState::MaskGenerated(state) = &*cache else {
            return None;
        };
        let total = state.mask.total() as u64;
        let outliers = state.mask.outlier_count() as u64;
        let scales = if self.config.perchannel {
            state.scale.len() as u64
        } else {
            1
        };
        Some(
            (total - outliers) * u64::from(self.config.low_bit)
                + outliers * u64::from(self.config.high_bit)
                + total
                + scales * 32,
        )
    }

    /// f32 storage divided by [`storage_bits`](Self::storage_bits)
    pub fn compression_ratio(&self) -> Option<f64> {
        let bits = self.storage_bits()?;
        let total = self.weight.as_ref()?.len() as f64;
        Some(total * 32.0 / bits as f64)
    }

    /// Mask-before-scale under the lock: at most one caller generates the mask
    fn quant_state(&self, weight: ArrayView2<'_, f32>) -> Result<QuantState> {
        let mut cache = self.cache.lock();

        if let CacheState::MaskGenerated(state) = &mut *cache {
            if state.mask.shape() != weight.dim() {
                let (rows, cols) = state.mask.shape();
                return Err(Error::ShapeMismatch {
                    expected: vec![rows, cols],
                    got: weight.shape().to_vec(),
                });
            }
            if self.training {
                state.scale = self.scale_estimator.estimate(weight, &state.mask)?;
                state.high = self.calibrate_high(weight, &state.mask);
                debug!(layer = self.log_name(), "recomputed channel scale");
            }
            return Ok(state.clone());
        }

        let mask = self.mask_generator.generate(weight)?;
        info!(
            layer = self.log_name(),
            outliers = mask.outlier_count(),
            total = mask.total(),
            fraction = mask.fraction(),
            "generated outlier mask"
        );
        let scale = self.scale_estimator.estimate(weight, &mask)?;
        let high = self.calibrate_high(weight, &mask);
        let state = QuantState {
            mask: Arc::new(mask),
            scale,
            high,
        };
        *cache = CacheState::MaskGenerated(state.clone());
        Ok(state)
    }

    fn log_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    fn calibrate_high(&self, weight: ArrayView2<'_, f32>, mask: &OutlierMask) -> Option<FakeQuantize> {
        let HighPrecisionPolicy::Uniform {
            bits,
            symmetric,
            mse,
        } = self.config.high_precision_policy()
        else {
            return None;
        };

        let config = if symmetric {
            FakeQuantConfig::symmetric(usize::from(bits))
        } else {
            FakeQuantConfig::asymmetric(usize::from(bits))
        };
        let outliers: Vec<f32> = weight
            .iter()
            .zip(mask.as_array().iter())
            .filter_map(|(&w, &m)| m.then_some(w))
            .collect();

        let mut fq = FakeQuantize::new(config);
        if mse {
            fq.calibrate_mse(&outliers);
        } else {
            fq.calibrate(&outliers);
        }
        // No outliers to calibrate on: nothing takes this branch
        fq.is_calibrated().then_some(fq)
    }

    fn assemble(&self, weight: ArrayView2<'_, f32>, state: &QuantState) -> Array2<f32> {
        let outlier_scale = self.config.outlier_scale;
        let scale = state.scale.values();
        let mut simulated = Array2::zeros(weight.dim());

        Zip::indexed(&mut simulated)
            .and(&weight)
            .and(state.mask.as_array())
            .for_each(|(row, _), out, &w, &is_outlier| {
                *out = if is_outlier {
                    let w = state.high.as_ref().map_or(w, |fq| fq.quantize_value(w));
                    w * outlier_scale
                } else {
                    self.strategy.forward(w) * scale[row]
                };
            });

        simulated
    }
}

fn unset_weight() -> Error {
    Error::PreconditionViolation("quantization requested before a weight was set".to_string())
}

fn empty_batch() -> Error {
    Error::PreconditionViolation("input batch must contain at least one row".to_string())
}
