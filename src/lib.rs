//! # binquant: outlier-aware mixed-precision weight binarization
//!
//! Quantizes the weight matrices of linear layers to 1 bit while keeping
//! statistical outliers in high precision, for quantization-aware training
//! and post-training quantization of large language models.
//!
//! ## Architecture
//!
//! - **quant**: outlier masks, channel scales, sign surrogates and the
//!   [`MixedPrecisionLinear`] layer
//! - **autograd**: tape-based automatic differentiation the surrogates plug into
//! - **config**: declarative YAML configuration
//!
//! ```no_run
//! use binquant::{MixedPrecisionLinear, QuantizationConfig};
//! use ndarray::arr2;
//! use std::sync::Arc;
//!
//! let config = Arc::new(QuantizationConfig::default());
//! let weight = arr2(&[[0.3, -0.2], [8.0, 0.1]]);
//! let layer = MixedPrecisionLinear::from_weights(weight, None, config)?;
//! let simulated = layer.quantize_forward()?;
//! # Ok::<(), binquant::Error>(())
//! ```

pub mod autograd;
pub mod config;
pub mod quant;

pub mod error;

// Re-export commonly used types
pub use autograd::{backward, Tensor};
pub use config::{load_quant_config, BinaryMethod, QuantizationConfig};
pub use error::{Error, Result};
pub use quant::{
    quantize_model, BinarizationStrategy, ChannelScale, ChannelScaleEstimator, LayerSelection,
    LinearWeights, MixedPrecisionLinear, OutlierMask, OutlierMaskGenerator, QuantDiagnostics,
    QuantizedModel,
};
