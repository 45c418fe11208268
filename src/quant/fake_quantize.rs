//! Fake quantization for the outlier (high-precision) branch
//!
//! When `high_bit` is below the passthrough width, outlier entries are not
//! kept in full precision but snapped to a uniform grid calibrated over the
//! outlier population:
//! - Forward: quantize → dequantize (simulates quantization noise)
//! - Backward: Straight-Through Estimator (STE), zeroed outside the grid range
//!
//! Range selection is either min/max (`high_mse = false`) or a clipping
//! search minimizing reconstruction MSE (`high_mse = true`).

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Candidate clipping ratios for MSE calibration: 0.50, 0.51, ..., 1.00
const MSE_CLIP_STEPS: usize = 50;
const MSE_MIN_CLIP: f32 = 0.5;

/// Fake quantization configuration
#[derive(Clone, Debug, PartialEq)]
pub struct FakeQuantConfig {
    /// Number of bits for quantization (e.g., 4, 8)
    pub bits: usize,
    /// Whether quantization is symmetric (centered at 0)
    pub symmetric: bool,
    /// Quantization range: min value
    pub qmin: i32,
    /// Quantization range: max value
    pub qmax: i32,
}

impl FakeQuantConfig {
    /// Symmetric grid: 4-bit gives [-7, 7], 8-bit gives [-127, 127]
    pub fn symmetric(bits: usize) -> Self {
        let qmax = (1 << (bits - 1)) - 1;
        Self {
            bits,
            symmetric: true,
            qmin: -qmax,
            qmax,
        }
    }

    /// Asymmetric grid: 4-bit gives [0, 15], 8-bit gives [0, 255]
    pub fn asymmetric(bits: usize) -> Self {
        Self {
            bits,
            symmetric: false,
            qmin: 0,
            qmax: (1 << bits) - 1,
        }
    }
}

impl Default for FakeQuantConfig {
    fn default() -> Self {
        Self::symmetric(8)
    }
}

/// Calibrated uniform quantizer
#[derive(Clone, Debug, PartialEq)]
pub struct FakeQuantize {
    pub config: FakeQuantConfig,
    pub scale: f32,
    pub zero_point: i32,
    calibrated: bool,
}

impl FakeQuantize {
    pub fn new(config: FakeQuantConfig) -> Self {
        Self {
            config,
            scale: 1.0,
            zero_point: 0,
            calibrated: false,
        }
    }

    /// False until a calibration saw at least one value
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Min-max calibration.
    ///
    /// For symmetric: scale = max(|min|, |max|) / qmax
    /// For asymmetric: scale = (max - min) / (qmax - qmin), range widened to include 0
    pub fn calibrate(&mut self, data: &[f32]) {
        if let Some((min_val, max_val)) = min_max(data) {
            self.calibrate_range(min_val, max_val);
        }
    }

    /// Search clipping ratios of the min/max range and keep the one with the
    /// lowest reconstruction MSE over `data`
    pub fn calibrate_mse(&mut self, data: &[f32]) {
        let Some((min_val, max_val)) = min_max(data) else {
            return;
        };

        let mut best: Option<(f32, f32, i32)> = None;
        for step in 0..=MSE_CLIP_STEPS {
            let ratio = MSE_MIN_CLIP + (1.0 - MSE_MIN_CLIP) * step as f32 / MSE_CLIP_STEPS as f32;
            self.calibrate_range(min_val * ratio, max_val * ratio);
            let mse = self.mse(data);
            if best.map_or(true, |(best_mse, _, _)| mse < best_mse) {
                best = Some((mse, self.scale, self.zero_point));
            }
        }

        if let Some((_, scale, zero_point)) = best {
            self.scale = scale;
            self.zero_point = zero_point;
        }
    }

    fn calibrate_range(&mut self, min_val: f32, max_val: f32) {
        if self.config.symmetric {
            let max_abs = min_val.abs().max(max_val.abs());
            self.scale = max_abs / self.config.qmax as f32;
            self.zero_point = 0;
        } else {
            let min_val = min_val.min(0.0);
            let max_val = max_val.max(0.0);
            self.scale = (max_val - min_val) / (self.config.qmax - self.config.qmin) as f32;
            if self.scale < 1e-10 {
                self.scale = 1e-10;
            }
            self.zero_point = (self.config.qmin as f32 - min_val / self.scale).round() as i32;
            self.zero_point = self.zero_point.clamp(self.config.qmin, self.config.qmax);
        }

        // Prevent division by zero
        if self.scale < 1e-10 {
            self.scale = 1e-10;
        }

        self.calibrated = true;
    }

    /// Mean squared reconstruction error over `data`
    pub fn mse(&self, data: &[f32]) -> f32 {
        if data.is_empty() {
            return 0.0;
        }
        data.iter()
            .map(|&x| {
                let d = x - self.quantize_value(x);
                d * d
            })
            .sum::<f32>()
            / data.len() as f32
    }

    /// Quantize then dequantize a single value
    pub fn quantize_value(&self, x: f32) -> f32 {
        let q = ((x / self.scale) + self.zero_point as f32)
            .round()
            .clamp(self.config.qmin as f32, self.config.qmax as f32) as i32;
        (q - self.zero_point) as f32 * self.scale
    }

    /// Forward pass: fake quantize every element.
    ///
    /// When the input tracks gradients, the result carries a clamped STE
    /// backward op.
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let data = input.data().mapv(|x| self.quantize_value(x));
        let requires_grad = input.requires_grad();

        let mut result = Tensor::new(data, requires_grad);

        if requires_grad {
            let backward_op = Rc::new(SteBackward {
                quantizer: self.clone(),
                input: input.clone(),
                result_grad: result.grad_cell(),
            });
            result.set_backward_op(backward_op);
        }

        result
    }

    /// STE with gradient clipping outside the representable range
    pub fn backward_clamped(&self, grad_output: &Array1<f32>, input: &Array1<f32>) -> Array1<f32> {
        let lo = (self.config.qmin - self.zero_point) as f32 * self.scale;
        let hi = (self.config.qmax - self.zero_point) as f32 * self.scale;

        grad_output
            .iter()
            .zip(input.iter())
            .map(|(&grad, &x)| if x < lo || x > hi { 0.0 } else { grad })
            .collect()
    }

    pub fn num_levels(&self) -> usize {
        (self.config.qmax - self.config.qmin + 1) as usize
    }
}

fn min_max(data: &[f32]) -> Option<(f32, f32)> {
    if data.is_empty() {
        return None;
    }
    let min_val = data.iter().cloned().fold(f32::INFINITY, f32::min);
    let max_val = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    Some((min_val, max_val))
}

/// Straight-through inside the grid range: ∂L/∂x = ∂L/∂y, zero outside
struct SteBackward {
    quantizer: FakeQuantize,
    input: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for SteBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.input.requires_grad() {
                self.input
                    .accumulate_grad(self.quantizer.backward_clamped(grad, self.input.data()));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.input]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// Outputs sit on the grid: (x / scale + zp) is an integer
        #[test]
        fn prop_outputs_are_grid_points(
            values in prop::collection::vec(-5.0f32..5.0, 4..32),
            bits in 2usize..9,
            symmetric in any::<bool>(),
        ) {
            let config = if symmetric {
                FakeQuantConfig::symmetric(bits)
            } else {
                FakeQuantConfig::asymmetric(bits)
            };
            let mut fq = FakeQuantize::new(config);
            fq.calibrate(&values);

            for &v in &values {
                let out = fq.quantize_value(v);
                let q = out / fq.scale + fq.zero_point as f32;
                prop_assert!((q - q.round()).abs() < 1e-2, "{} not on grid (q={})", out, q);
            }
        }

        /// MSE calibration is never worse than plain min-max
        #[test]
        fn prop_mse_calibration_not_worse(
            values in prop::collection::vec(-20.0f32..20.0, 4..64),
            bits in 2usize..6,
        ) {
            let mut minmax = FakeQuantize::new(FakeQuantConfig::symmetric(bits));
            minmax.calibrate(&values);
            let mut searched = FakeQuantize::new(FakeQuantConfig::symmetric(bits));
            searched.calibrate_mse(&values);

            prop_assert!(searched.mse(&values) <= minmax.mse(&values) + 1e-5);
        }

        #[test]
        fn prop_num_levels_correct(bits in 2usize..10) {
            let fq = FakeQuantize::new(FakeQuantConfig::symmetric(bits));
            prop_assert_eq!(fq.num_levels(), (1 << bits) - 1);
        }
    }

    #[test]
    fn test_config_ranges() {
        let sym = FakeQuantConfig::symmetric(4);
        assert_eq!((sym.qmin, sym.qmax), (-7, 7));
        let asym = FakeQuantConfig::asymmetric(8);
        assert_eq!((asym.qmin, asym.qmax), (0, 255));
    }

    #[test]
    fn test_symmetric_calibration() {
        let mut fq = FakeQuantize::new(FakeQuantConfig::symmetric(8));
        fq.calibrate(&[0.0, 1.0, -2.0, 1.5, -1.5]);

        assert_abs_diff_eq!(fq.scale, 2.0 / 127.0, epsilon = 1e-6);
        assert_eq!(fq.zero_point, 0);
        assert!(fq.is_calibrated());
    }

    #[test]
    fn test_asymmetric_range_includes_zero() {
        // All-positive outliers still represent 0 exactly
        let mut fq = FakeQuantize::new(FakeQuantConfig::asymmetric(4));
        fq.calibrate(&[3.0, 6.0, 4.5]);
        assert_eq!(fq.zero_point, 0);
        assert_abs_diff_eq!(fq.scale, 6.0 / 15.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fq.quantize_value(6.0), 6.0, epsilon = 1e-5);
        assert_abs_diff_eq!(fq.quantize_value(0.0), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_calibration_is_noop() {
        let mut fq = FakeQuantize::new(FakeQuantConfig::symmetric(8));
        fq.calibrate(&[]);
        fq.calibrate_mse(&[]);
        assert!(!fq.is_calibrated());
        assert_eq!(fq.scale, 1.0);
    }

    #[test]
    fn test_mse_clips_heavy_tail() {
        // One huge value stretches the min-max grid; clipping should help the rest
        let mut data: Vec<f32> = (0..63).map(|i| (i as f32 - 31.0) / 31.0).collect();
        data.push(40.0);

        let mut minmax = FakeQuantize::new(FakeQuantConfig::symmetric(3));
        minmax.calibrate(&data);
        let mut searched = FakeQuantize::new(FakeQuantConfig::symmetric(3));
        searched.calibrate_mse(&data);

        assert!(searched.mse(&data) <= minmax.mse(&data));
    }

    #[test]
    fn test_forward_wires_straight_through_gradient() {
        let mut fq = FakeQuantize::new(FakeQuantConfig::symmetric(4));
        fq.calibrate(&[-7.0, 7.0]);

        let x = Tensor::from_vec(vec![0.4, 2.6, -6.9], true);
        let mut y = fq.forward(&x);
        assert_abs_diff_eq!(y.data()[1], 3.0, epsilon = 1e-5);

        backward(&mut y, Some(ndarray::arr1(&[1.0, 2.0, 3.0])));
        assert_eq!(x.grad().unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_forward_zeroes_gradient_of_clipped_values() {
        let mut fq = FakeQuantize::new(FakeQuantConfig::symmetric(4));
        fq.calibrate(&[-1.0, 1.0]);

        let x = Tensor::from_vec(vec![0.5, 3.0], true);
        let mut y = fq.forward(&x);
        backward(&mut y, None);
        assert_eq!(x.grad().unwrap().to_vec(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_clamped_ste_backward() {
        let mut fq = FakeQuantize::new(FakeQuantConfig::symmetric(4));
        fq.calibrate(&[-7.0, 7.0]);

        let grad = ndarray::arr1(&[1.0, 1.0, 1.0]);
        let input = ndarray::arr1(&[0.5, 10.0, -10.0]);
        let out = fq.backward_clamped(&grad, &input);

        assert_eq!(out.to_vec(), vec![1.0, 0.0, 0.0]);
    }
}
