//! Configuration validation

use super::schema::QuantizationConfig;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported low_bit: {0} (only 1-bit binarization is implemented)")]
    UnsupportedLowBit(u8),

    #[error("Invalid high_bit: {0} (must be in 2..=32)")]
    InvalidHighBit(u8),

    #[error("high_bit ({high}) must exceed low_bit ({low})")]
    HighNotAboveLow { low: u8, high: u8 },

    #[error("Invalid outlier_scale: {0} (must be finite and >= 0.0)")]
    InvalidOutlierScale(f32),
}

/// Validate a quantization configuration
///
/// Checks:
/// - `low_bit` selects the binary path
/// - `high_bit` is a usable grid width above `low_bit`
/// - `outlier_scale` is a finite non-negative multiplier
pub fn validate_quant_config(config: &QuantizationConfig) -> Result<(), ValidationError> {
    if config.low_bit != 1 {
        return Err(ValidationError::UnsupportedLowBit(config.low_bit));
    }

    if !(2..=32).contains(&config.high_bit) {
        return Err(ValidationError::InvalidHighBit(config.high_bit));
    }

    if config.high_bit <= config.low_bit {
        return Err(ValidationError::HighNotAboveLow {
            low: config.low_bit,
            high: config.high_bit,
        });
    }

    if !config.outlier_scale.is_finite() || config.outlier_scale < 0.0 {
        return Err(ValidationError::InvalidOutlierScale(config.outlier_scale));
    }

    Ok(())
}
