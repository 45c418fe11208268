//! Loading quantization configs from YAML files

use super::schema::QuantizationConfig;
use crate::{Error, Result};
use std::fs;
use std::path::Path;

/// Load and validate a quantization config from a YAML file
///
/// ```yaml
/// low_bit: 1
/// high_bit: 8
/// binary_method: irnet
/// perchannel: true
/// high_sym: false
/// high_mse: true
/// outlier_scale: 1.0
/// ```
pub fn load_quant_config<P: AsRef<Path>>(config_path: P) -> Result<QuantizationConfig> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    QuantizationConfig::from_yaml_str(&yaml_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BinaryMethod;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_valid_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "low_bit: 1\nhigh_bit: 8\nbinary_method: fda\nhigh_sym: true\noutlier_scale: 0.5"
        )
        .unwrap();

        let config = load_quant_config(file.path()).unwrap();
        assert_eq!(config.binary_method, BinaryMethod::Fda);
        assert_eq!(config.high_bit, 8);
        assert!(config.high_sym);
        assert!(!config.high_mse);
        assert!(config.perchannel);
        assert_eq!(config.outlier_scale, 0.5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_quant_config("/nonexistent/quant.yaml").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_load_rejects_unsupported_low_bit() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "low_bit: 2").unwrap();

        let err = load_quant_config(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigurationMismatch(_)));
    }

    #[test]
    fn test_load_rejects_unknown_method() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "binary_method: ternary").unwrap();

        let err = load_quant_config(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigurationMismatch(_)));
    }
}
