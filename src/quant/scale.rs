//! Per-channel scale estimation for the binary branch
//!
//! The scale of a channel is the mean absolute value of its non-outlier
//! entries, so `sign(w) * scale` preserves the channel's L1 mass.

use super::outlier::OutlierMask;
use crate::{Error, Result};
use ndarray::{Array1, ArrayView2};
use tracing::warn;

/// Scale used for a channel whose every entry is an outlier
pub const DEGENERATE_CHANNEL_SCALE: f32 = 0.0;

/// One non-negative scale per output channel
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelScale {
    values: Array1<f32>,
    degenerate_channels: Vec<usize>,
}

impl ChannelScale {
    pub fn values(&self) -> &Array1<f32> {
        &self.values
    }

    pub fn get(&self, channel: usize) -> f32 {
        self.values[channel]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Channels that fell back to [`DEGENERATE_CHANNEL_SCALE`]
    pub fn degenerate_channels(&self) -> &[usize] {
        &self.degenerate_channels
    }
}

/// Computes [`ChannelScale`] from a weight and its outlier mask
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelScaleEstimator {
    perchannel: bool,
}

impl Default for ChannelScaleEstimator {
    fn default() -> Self {
        Self { perchannel: true }
    }
}

impl ChannelScaleEstimator {
    /// `perchannel = false` computes one tensor-wide scale and repeats it per row
    pub fn new(perchannel: bool) -> Self {
        Self { perchannel }
    }

    pub fn is_perchannel(&self) -> bool {
        self.perchannel
    }

    pub fn estimate(&self, weight: ArrayView2<'_, f32>, mask: &OutlierMask) -> Result<ChannelScale> {
        if weight.dim() != mask.shape() {
            let (rows, cols) = mask.shape();
            return Err(Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: weight.shape().to_vec(),
            });
        }

        let out_features = weight.nrows();
        let mask = mask.as_array();

        let scale = if self.perchannel {
            let mut values = Array1::zeros(out_features);
            let mut degenerate = Vec::new();
            for (row, (w_row, m_row)) in weight.outer_iter().zip(mask.outer_iter()).enumerate() {
                match mean_abs_unmasked(w_row.iter().copied().zip(m_row.iter().copied())) {
                    Some(s) => values[row] = s,
                    None => {
                        values[row] = DEGENERATE_CHANNEL_SCALE;
                        degenerate.push(row);
                    }
                }
            }
            ChannelScale {
                values,
                degenerate_channels: degenerate,
            }
        } else {
            match mean_abs_unmasked(weight.iter().copied().zip(mask.iter().copied())) {
                Some(s) => ChannelScale {
                    values: Array1::from_elem(out_features, s),
                    degenerate_channels: Vec::new(),
                },
                None => ChannelScale {
                    values: Array1::from_elem(out_features, DEGENERATE_CHANNEL_SCALE),
                    degenerate_channels: (0..out_features).collect(),
                },
            }
        };

        if !scale.degenerate_channels.is_empty() {
            warn!(
                channels = scale.degenerate_channels.len(),
                fallback = DEGENERATE_CHANNEL_SCALE,
                "channels with no non-outlier entries"
            );
        }

        Ok(scale)
    }
}

/// Mean |w| over entries whose mask bit is false; `None` if there are none
fn mean_abs_unmasked(entries: impl Iterator<Item = (f32, bool)>) -> Option<f32> {
    let (sum, count) = entries
        .filter(|&(_, is_outlier)| !is_outlier)
        .fold((0.0f64, 0usize), |(sum, count), (w, _)| {
            (sum + f64::from(w.abs()), count + 1)
        });
    (count > 0).then(|| (sum / count as f64) as f32)
}
