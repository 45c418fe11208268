//! Tests for the quantization config schema and validation

use super::*;
use crate::Error;
use std::str::FromStr;

#[test]
fn test_defaults_select_binary_passthrough() {
    let config = QuantizationConfig::default();
    assert_eq!(config.low_bit, 1);
    assert_eq!(config.high_bit, PASSTHROUGH_BITS);
    assert_eq!(config.binary_method, BinaryMethod::Ste);
    assert!(config.perchannel);
    assert_eq!(config.outlier_scale, 1.0);
    assert_eq!(config.high_precision_policy(), HighPrecisionPolicy::Passthrough);
    assert!(config.validate().is_ok());
}

#[test]
fn test_empty_yaml_uses_defaults() {
    let config = QuantizationConfig::from_yaml_str("{}").unwrap();
    assert_eq!(config, QuantizationConfig::default());
}

#[test]
fn test_xnor_run_config_parses() {
    let yaml = r#"
low_bit: 1
high_bit: 8
binary_method: xnor
perchannel: true
high_sym: false
high_mse: false
"#;
    let config = QuantizationConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(config.binary_method, BinaryMethod::Ste);
    assert_eq!(
        config.high_precision_policy(),
        HighPrecisionPolicy::Uniform {
            bits: 8,
            symmetric: false,
            mse: false
        }
    );
}

#[test]
fn test_yaml_roundtrip_preserves_fields() {
    let config = QuantizationConfig::default()
        .with_method(BinaryMethod::IrNet)
        .with_high_bit(4, true, true)
        .with_outlier_scale(0.25)
        .per_tensor();

    let yaml = config.to_yaml().unwrap();
    assert!(yaml.contains("irnet"));
    let parsed = QuantizationConfig::from_yaml_str(&yaml).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_binary_method_from_str() {
    assert_eq!(BinaryMethod::from_str("STE").unwrap(), BinaryMethod::Ste);
    assert_eq!(BinaryMethod::from_str("xnor").unwrap(), BinaryMethod::Ste);
    assert_eq!(BinaryMethod::from_str("irnet").unwrap(), BinaryMethod::IrNet);
    assert_eq!(BinaryMethod::from_str("ir_net").unwrap(), BinaryMethod::IrNet);
    assert_eq!(BinaryMethod::from_str("fda").unwrap(), BinaryMethod::Fda);

    let err = BinaryMethod::from_str("ternary").unwrap_err();
    assert!(matches!(err, Error::ConfigurationMismatch(_)));
}

#[test]
fn test_yaml_method_names_match_from_str() {
    let config = QuantizationConfig::from_yaml_str("binary_method: IR_NET").unwrap();
    assert_eq!(config.binary_method, BinaryMethod::IrNet);

    let config = QuantizationConfig::from_yaml_str("binary_method: Xnor").unwrap();
    assert_eq!(config.binary_method, BinaryMethod::Ste);
}

#[test]
fn test_yaml_unknown_method_is_configuration_mismatch() {
    let err = QuantizationConfig::from_yaml_str("binary_method: ternary").unwrap_err();
    assert!(matches!(err, Error::ConfigurationMismatch(_)));

    let err = QuantizationConfig::from_yaml_str("low_bit: [1, 2").unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}

#[test]
fn test_validation_rejects_bad_bit_widths() {
    let mut config = QuantizationConfig::default();
    config.low_bit = 4;
    assert!(matches!(
        validate_quant_config(&config),
        Err(ValidationError::UnsupportedLowBit(4))
    ));

    let mut config = QuantizationConfig::default();
    config.high_bit = 1;
    assert!(matches!(
        validate_quant_config(&config),
        Err(ValidationError::InvalidHighBit(1))
    ));

    let mut config = QuantizationConfig::default();
    config.high_bit = 64;
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_bad_outlier_scale() {
    let config = QuantizationConfig::default().with_outlier_scale(f32::NAN);
    assert!(matches!(
        config.validate(),
        Err(Error::ConfigurationMismatch(_))
    ));

    let config = QuantizationConfig::default().with_outlier_scale(-1.0);
    assert!(config.validate().is_err());

    let config = QuantizationConfig::default().with_outlier_scale(0.0);
    assert!(config.validate().is_ok());
}
