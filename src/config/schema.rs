//! Quantization configuration schema

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bit widths at or above this keep outliers unquantized (scaled passthrough)
pub const PASSTHROUGH_BITS: u8 = 16;

/// Which sign surrogate is used for the binary (non-outlier) branch.
///
/// Deserialized through [`FromStr`], so names are case-insensitive and
/// `xnor` / `ir_net` are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum BinaryMethod {
    /// Straight-through estimator
    #[default]
    Ste,
    /// IR-Net error decay estimator
    IrNet,
    /// Fourier-series derivative approximation
    Fda,
}

impl BinaryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryMethod::Ste => "ste",
            BinaryMethod::IrNet => "irnet",
            BinaryMethod::Fda => "fda",
        }
    }
}

impl fmt::Display for BinaryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BinaryMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ste" | "xnor" => Ok(BinaryMethod::Ste),
            "irnet" | "ir_net" => Ok(BinaryMethod::IrNet),
            "fda" => Ok(BinaryMethod::Fda),
            other => Err(Error::ConfigurationMismatch(format!(
                "unknown binary_method '{other}' (expected one of: ste, xnor, irnet, fda)"
            ))),
        }
    }
}

impl TryFrom<String> for BinaryMethod {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// How outlier entries are represented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighPrecisionPolicy {
    /// `w * outlier_scale`, no rounding
    Passthrough,
    /// Uniform fake quantization on a `bits`-wide grid calibrated over the outliers
    Uniform {
        bits: u8,
        symmetric: bool,
        mse: bool,
    },
}

/// Quantization settings shared read-only by every layer of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Bit width of the non-outlier branch; only 1 (binary) is supported
    #[serde(default = "default_low_bit")]
    pub low_bit: u8,

    /// Bit width of the outlier branch
    #[serde(default = "default_high_bit")]
    pub high_bit: u8,

    #[serde(default)]
    pub binary_method: BinaryMethod,

    /// One scale per output channel instead of a single tensor-wide scale
    #[serde(default = "default_true")]
    pub perchannel: bool,

    /// Symmetric range for the outlier grid (only when `high_bit` < 16)
    #[serde(default)]
    pub high_sym: bool,

    /// MSE-searched clipping range for the outlier grid (only when `high_bit` < 16)
    #[serde(default)]
    pub high_mse: bool,

    /// Multiplier applied to outlier entries
    #[serde(default = "default_outlier_scale")]
    pub outlier_scale: f32,
}

fn default_low_bit() -> u8 {
    1
}

fn default_high_bit() -> u8 {
    PASSTHROUGH_BITS
}

fn default_true() -> bool {
    true
}

fn default_outlier_scale() -> f32 {
    1.0
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            low_bit: default_low_bit(),
            high_bit: default_high_bit(),
            binary_method: BinaryMethod::default(),
            perchannel: true,
            high_sym: false,
            high_mse: false,
            outlier_scale: default_outlier_scale(),
        }
    }
}

impl QuantizationConfig {
    pub fn with_method(mut self, method: BinaryMethod) -> Self {
        self.binary_method = method;
        self
    }

    pub fn with_outlier_scale(mut self, outlier_scale: f32) -> Self {
        self.outlier_scale = outlier_scale;
        self
    }

    pub fn with_high_bit(mut self, high_bit: u8, symmetric: bool, mse: bool) -> Self {
        self.high_bit = high_bit;
        self.high_sym = symmetric;
        self.high_mse = mse;
        self
    }

    pub fn per_tensor(mut self) -> Self {
        self.perchannel = false;
        self
    }

    /// Outlier branch policy implied by `high_bit`, `high_sym` and `high_mse`
    pub fn high_precision_policy(&self) -> HighPrecisionPolicy {
        if self.high_bit >= PASSTHROUGH_BITS {
            HighPrecisionPolicy::Passthrough
        } else {
            HighPrecisionPolicy::Uniform {
                bits: self.high_bit,
                symmetric: self.high_sym,
                mse: self.high_mse,
            }
        }
    }

    /// Parse a YAML document and validate it.
    ///
    /// Malformed YAML is a `ConfigError`; an unknown `binary_method` is a
    /// `ConfigurationMismatch`, like any other unsupported setting.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {e}")))?;
        if let Some(method) = value.get("binary_method").and_then(serde_yaml::Value::as_str) {
            method.parse::<BinaryMethod>()?;
        }

        let config: QuantizationConfig = serde_yaml::from_value(value)
            .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Reject combinations the quantizer cannot run
    pub fn validate(&self) -> Result<()> {
        super::validate::validate_quant_config(self)
            .map_err(|e| Error::ConfigurationMismatch(e.to_string()))
    }
}
