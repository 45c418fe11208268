//! Read-only quantization diagnostics for training harness logs

use super::outlier::OutlierMask;
use super::scale::ChannelScale;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Summary statistics over the per-channel scales
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

impl ScaleStats {
    pub fn from_scale(scale: &ChannelScale) -> Self {
        let values = scale.values();
        if values.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        Self {
            min: values.iter().cloned().fold(f32::INFINITY, f32::min),
            max: values.iter().cloned().fold(f32::NEG_INFINITY, f32::max),
            mean: values.iter().sum::<f32>() / values.len() as f32,
        }
    }
}

/// Snapshot of one layer's mask and scale state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantDiagnostics {
    pub outlier_count: usize,
    pub total: usize,
    pub outlier_fraction: f64,
    pub lower_threshold: f32,
    pub upper_threshold: f32,
    pub scale: ScaleStats,
    /// Channels whose scale fell back because every entry was an outlier
    pub degenerate_channels: usize,
}

impl QuantDiagnostics {
    pub fn new(mask: &OutlierMask, scale: &ChannelScale) -> Self {
        let (lower, upper) = mask.thresholds();
        Self {
            outlier_count: mask.outlier_count(),
            total: mask.total(),
            outlier_fraction: mask.fraction(),
            lower_threshold: lower,
            upper_threshold: upper,
            scale: ScaleStats::from_scale(scale),
            degenerate_channels: scale.degenerate_channels().len(),
        }
    }

    /// Single-line JSON, for structured log sinks
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
