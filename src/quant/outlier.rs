//! Statistical outlier detection for weight matrices
//!
//! An entry is an outlier when it falls strictly outside `μ ± k·σ`, where `μ`
//! and `σ` are taken over the whole tensor (not per channel). With `k = 1.6`
//! roughly 11% of a normally distributed tensor is marked.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// Default threshold multiplier, marking about the outer 11% of a Gaussian
pub const DEFAULT_OUTLIER_SIGMA: f32 = 1.6;

/// Boolean outlier mask with the statistics it was derived from
#[derive(Clone, Debug, PartialEq)]
pub struct OutlierMask {
    mask: Array2<bool>,
    outlier_count: usize,
    mean: f32,
    std: f32,
    lower: f32,
    upper: f32,
}

impl OutlierMask {
    /// Build a mask directly, bypassing the statistics (thresholds are NaN)
    pub fn from_array(mask: Array2<bool>) -> Self {
        let outlier_count = mask.iter().filter(|&&m| m).count();
        Self {
            mask,
            outlier_count,
            mean: f32::NAN,
            std: f32::NAN,
            lower: f32::NAN,
            upper: f32::NAN,
        }
    }

    pub fn as_array(&self) -> &Array2<bool> {
        &self.mask
    }

    pub fn is_outlier(&self, row: usize, col: usize) -> bool {
        self.mask[[row, col]]
    }

    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn outlier_count(&self) -> usize {
        self.outlier_count
    }

    pub fn total(&self) -> usize {
        self.mask.len()
    }

    /// `count(outliers) / total`
    pub fn fraction(&self) -> f64 {
        if self.mask.is_empty() {
            0.0
        } else {
            self.outlier_count as f64 / self.mask.len() as f64
        }
    }

    /// Number of outliers in one output channel
    pub fn row_outlier_count(&self, row: usize) -> usize {
        self.mask.row(row).iter().filter(|&&m| m).count()
    }

    /// Flattened row-major copy, the layout autograd tensors use
    pub fn to_flat_vec(&self) -> Vec<bool> {
        self.mask.iter().copied().collect()
    }

    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn std(&self) -> f32 {
        self.std
    }

    /// `(μ - kσ, μ + kσ)`
    pub fn thresholds(&self) -> (f32, f32) {
        (self.lower, self.upper)
    }
}

/// Produces [`OutlierMask`]s from mean/std thresholds
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutlierMaskGenerator {
    sigma: f32,
}

impl Default for OutlierMaskGenerator {
    fn default() -> Self {
        Self {
            sigma: DEFAULT_OUTLIER_SIGMA,
        }
    }
}

impl OutlierMaskGenerator {
    /// Generator with a custom multiplier `k`
    pub fn with_sigma(sigma: f32) -> Result<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(Error::ConfigurationMismatch(format!(
                "outlier sigma must be finite and > 0, got {sigma}"
            )));
        }
        Ok(Self { sigma })
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    /// Mark every entry lying strictly outside `μ ± k·σ`.
    ///
    /// `σ` is the sample standard deviation (n - 1 denominator); a single
    /// entry or a constant tensor has `σ = 0` and therefore no outliers.
    pub fn generate(&self, weight: ArrayView2<'_, f32>) -> Result<OutlierMask> {
        if weight.is_empty() {
            return Err(Error::PreconditionViolation(
                "cannot generate an outlier mask for an empty weight".to_string(),
            ));
        }
        if weight.iter().any(|w| !w.is_finite()) {
            return Err(Error::PreconditionViolation(
                "weight contains non-finite values".to_string(),
            ));
        }

        let (mean, std) = mean_std(weight);
        let k = f64::from(self.sigma);
        let lower = mean - k * std;
        let upper = mean + k * std;

        let mask = weight.mapv(|w| {
            let w = f64::from(w);
            w < lower || w > upper
        });

        let outlier_count = mask.iter().filter(|&&m| m).count();

        Ok(OutlierMask {
            mask,
            outlier_count,
            mean: mean as f32,
            std: std as f32,
            lower: lower as f32,
            upper: upper as f32,
        })
    }
}

/// Mean and sample standard deviation over every entry, accumulated in f64
fn mean_std(weight: ArrayView2<'_, f32>) -> (f64, f64) {
    let n = weight.len() as f64;
    let mean = weight.iter().map(|&w| f64::from(w)).sum::<f64>() / n;
    if weight.len() < 2 {
        return (mean, 0.0);
    }
    let var = weight
        .iter()
        .map(|&w| {
            let d = f64::from(w) - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array2};
    use proptest::prelude::*;

    fn spiked() -> Array2<f32> {
        arr2(&[
            [100.0, 0.1, 0.2, -0.1],
            [0.5, -0.5, 0.4, -0.4],
            [0.5, -0.5, 0.4, -0.4],
            [0.5, -0.5, 0.4, -0.4],
        ])
    }

    #[test]
    fn test_extreme_value_is_the_only_outlier() {
        let mask = OutlierMaskGenerator::default()
            .generate(spiked().view())
            .unwrap();

        assert!(mask.is_outlier(0, 0));
        assert_eq!(mask.outlier_count(), 1);
        assert_eq!(mask.total(), 16);
        assert_abs_diff_eq!(mask.fraction(), 1.0 / 16.0);
        assert_eq!(mask.row_outlier_count(0), 1);
        assert_eq!(mask.row_outlier_count(1), 0);
    }

    #[test]
    fn test_statistics_are_recorded() {
        let mask = OutlierMaskGenerator::default()
            .generate(arr2(&[[1.0, 3.0]]).view())
            .unwrap();
        // mean 2, sample std sqrt(2)
        assert_abs_diff_eq!(mask.mean(), 2.0);
        assert_abs_diff_eq!(mask.std(), 2.0f32.sqrt(), epsilon = 1e-6);
        let (lower, upper) = mask.thresholds();
        assert_abs_diff_eq!(lower, 2.0 - 1.6 * 2.0f32.sqrt(), epsilon = 1e-5);
        assert_abs_diff_eq!(upper, 2.0 + 1.6 * 2.0f32.sqrt(), epsilon = 1e-5);
    }

    #[test]
    fn test_constant_tensor_has_no_outliers() {
        let weight = Array2::from_elem((3, 5), 0.7f32);
        let mask = OutlierMaskGenerator::default()
            .generate(weight.view())
            .unwrap();
        assert_eq!(mask.outlier_count(), 0);
    }

    #[test]
    fn test_single_entry_has_no_outliers() {
        let mask = OutlierMaskGenerator::default()
            .generate(arr2(&[[42.0f32]]).view())
            .unwrap();
        assert_eq!(mask.outlier_count(), 0);
    }

    #[test]
    fn test_heavy_tails_exceed_ten_percent() {
        // 4 of 14 entries sit at ±10; no cap is applied to the fraction
        let weight = arr2(&[
            [10.0, -10.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [10.0, -10.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ]);
        let mask = OutlierMaskGenerator::default()
            .generate(weight.view())
            .unwrap();
        assert_eq!(mask.outlier_count(), 4);
        assert!(mask.fraction() > 0.2, "fraction {}", mask.fraction());
    }

    #[test]
    fn test_bimodal_weights_mark_nothing() {
        let weight = Array2::from_shape_fn((4, 8), |(r, c)| if (r + c) % 2 == 0 { 1.0 } else { -1.0 });
        let mask = OutlierMaskGenerator::default()
            .generate(weight.view())
            .unwrap();
        assert_eq!(mask.outlier_count(), 0);
    }

    #[test]
    fn test_empty_weight_is_rejected() {
        let weight = Array2::<f32>::zeros((0, 4));
        let err = OutlierMaskGenerator::default()
            .generate(weight.view())
            .unwrap_err();
        assert!(err.is_precondition_violation());
    }

    #[test]
    fn test_non_finite_weight_is_rejected() {
        let weight = arr2(&[[1.0, f32::NAN]]);
        assert!(OutlierMaskGenerator::default()
            .generate(weight.view())
            .is_err());
    }

    #[test]
    fn test_sigma_must_be_positive() {
        assert!(OutlierMaskGenerator::with_sigma(0.0).is_err());
        assert!(OutlierMaskGenerator::with_sigma(f32::INFINITY).is_err());
        assert_eq!(OutlierMaskGenerator::with_sigma(2.3).unwrap().sigma(), 2.3);
    }

    #[test]
    fn test_smaller_sigma_marks_more() {
        let weight = Array2::from_shape_fn((16, 16), |(r, c)| ((r * 16 + c) as f32 * 0.37).sin());
        let wide = OutlierMaskGenerator::with_sigma(2.0)
            .unwrap()
            .generate(weight.view())
            .unwrap();
        let narrow = OutlierMaskGenerator::with_sigma(0.67)
            .unwrap()
            .generate(weight.view())
            .unwrap();
        assert!(narrow.outlier_count() > wide.outlier_count());
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// The reported fraction is exactly count(|w - μ| > kσ) / numel
        #[test]
        fn prop_fraction_matches_definition(
            values in prop::collection::vec(-10.0f32..10.0, 2..64),
        ) {
            let cols = values.len();
            let weight = Array2::from_shape_vec((1, cols), values.clone()).unwrap();
            let mask = OutlierMaskGenerator::default().generate(weight.view()).unwrap();

            let (lower, upper) = mask.thresholds();
            let expected = values
                .iter()
                .filter(|&&v| v < lower || v > upper)
                .count();

            // Entries within float rounding of a threshold may go either way
            let borderline = values
                .iter()
                .filter(|&&v| (v - lower).abs() < 1e-4 || (v - upper).abs() < 1e-4)
                .count();
            prop_assert!(mask.outlier_count().abs_diff(expected) <= borderline);
            prop_assert!((mask.fraction() - mask.outlier_count() as f64 / cols as f64).abs() < 1e-12);
        }
    }
}
