//! Outlier-aware mixed-precision weight quantization
//!
//! A weight matrix is split by a statistical outlier mask: the few entries
//! outside `μ ± k·σ` stay in high precision, everything else is binarized to
//! `±scale[row]`. The pieces compose bottom-up:
//!
//! - [`OutlierMaskGenerator`]: one-shot global outlier detection
//! - [`ChannelScaleEstimator`]: per-row mean absolute value over non-outliers
//! - [`BinarizationStrategy`]: sign forward with a pluggable surrogate gradient
//! - [`FakeQuantize`]: optional uniform grid for outliers below 16 bits
//! - [`MixedPrecisionLinear`]: the layer owning the mask/scale cache
//! - [`quantize_model`]: swap selected linear layers of a model in parallel

mod binarize;
mod diagnostics;
mod fake_quantize;
mod layer;
mod model;
mod outlier;
mod scale;

pub use binarize::{binarize, sign, BinarizationStrategy};
pub use diagnostics::{QuantDiagnostics, ScaleStats};
pub use fake_quantize::{FakeQuantConfig, FakeQuantize};
pub use layer::MixedPrecisionLinear;
pub use model::{quantize_model, LayerSelection, LinearWeights, ModelLayer, QuantizedModel};
pub use outlier::{OutlierMask, OutlierMaskGenerator, DEFAULT_OUTLIER_SIGMA};
pub use scale::{ChannelScale, ChannelScaleEstimator, DEGENERATE_CHANNEL_SCALE};
