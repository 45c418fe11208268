//! Declarative quantization configuration
//!
//! A [`QuantizationConfig`] is built once per quantization run (in code or
//! from YAML) and shared read-only by every layer it is applied to.
//!
//! ```yaml
//! low_bit: 1
//! high_bit: 16
//! binary_method: xnor
//! perchannel: true
//! high_sym: false
//! high_mse: false
//! outlier_scale: 1.0
//! ```

mod load;
mod schema;
mod validate;

#[cfg(test)]
mod tests;

pub use load::load_quant_config;
pub use schema::{BinaryMethod, HighPrecisionPolicy, QuantizationConfig, PASSTHROUGH_BITS};
pub use validate::{validate_quant_config, ValidationError};
