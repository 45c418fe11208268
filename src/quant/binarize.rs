//! Binarization with differentiable sign surrogates
//!
//! Every strategy has the same forward, `sign(x)` with `sign(0) = +1`. They
//! differ only in the local derivative reported during the backward pass:
//!
//! - **StraightThrough**: identity, optionally zeroed where `|x| > 1`
//! - **IrNet**: derivative of `k·tanh(t·x)`, peaked at the origin and decaying
//! - **Fda**: derivative of a truncated Fourier series of the square wave
//!
//! [`binarize`] wraps a strategy as an autograd op whose backward applies the
//! surrogate, so a training loop can differentiate through the binary weight.

use crate::autograd::{BackwardOp, Tensor};
use crate::config::BinaryMethod;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use std::cell::RefCell;
use std::f32::consts::PI;
use std::rc::Rc;

/// Sign function with ties resolved to +1
#[inline]
pub fn sign(x: f32) -> f32 {
    if x >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// Sign surrogate selected once per layer from [`BinaryMethod`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinarizationStrategy {
    StraightThrough {
        /// Zero the gradient where `|x| > 1`
        saturate: bool,
    },
    IrNet {
        k: f32,
        t: f32,
    },
    Fda {
        /// Number of odd harmonics kept
        terms: usize,
        omega: f32,
    },
}

impl Default for BinarizationStrategy {
    fn default() -> Self {
        Self::from_method(BinaryMethod::default())
    }
}

impl BinarizationStrategy {
    /// Strategy with the default parameters for a method
    pub fn from_method(method: BinaryMethod) -> Self {
        match method {
            BinaryMethod::Ste => Self::StraightThrough { saturate: false },
            BinaryMethod::IrNet => Self::IrNet { k: 10.0, t: 0.1 },
            BinaryMethod::Fda => Self::Fda {
                terms: 10,
                omega: 0.1,
            },
        }
    }

    /// IR-Net's error decay schedule at `progress` ∈ [0, 1] of training.
    ///
    /// `t` grows from 0.1 to 10 on a log scale and `k = max(1/t, 1)`, moving the
    /// surrogate from near-identity to a sharp bump around the origin.
    pub fn ir_net_annealed(progress: f32) -> Self {
        const T_MIN: f32 = 0.1;
        const T_MAX: f32 = 10.0;
        let progress = progress.clamp(0.0, 1.0);
        let t = T_MIN * 10f32.powf(progress * (T_MAX / T_MIN).log10());
        let k = (1.0 / t).max(1.0);
        Self::IrNet { k, t }
    }

    pub fn method(&self) -> BinaryMethod {
        match self {
            Self::StraightThrough { .. } => BinaryMethod::Ste,
            Self::IrNet { .. } => BinaryMethod::IrNet,
            Self::Fda { .. } => BinaryMethod::Fda,
        }
    }

    #[inline]
    pub fn forward(&self, x: f32) -> f32 {
        sign(x)
    }

    /// Local derivative the backward pass multiplies the incoming gradient by
    pub fn surrogate_grad(&self, x: f32) -> f32 {
        match *self {
            Self::StraightThrough { saturate } => {
                if saturate && x.abs() > 1.0 {
                    0.0
                } else {
                    1.0
                }
            }
            Self::IrNet { k, t } => {
                let th = (t * x).tanh();
                k * t * (1.0 - th * th)
            }
            Self::Fda { terms, omega } => {
                if x.abs() > 1.0 {
                    return 0.0;
                }
                let series: f32 = (0..terms)
                    .map(|i| ((2 * i + 1) as f32 * omega * x).cos())
                    .sum();
                4.0 * omega / PI * series
            }
        }
    }

    /// Element-wise sign of a matrix
    pub fn forward_array(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.mapv(sign)
    }

    /// `grad_output * surrogate'(input)`, same shape as the input
    pub fn backward(&self, input: &Array1<f32>, grad_output: &Array1<f32>) -> Result<Array1<f32>> {
        if input.len() != grad_output.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![input.len()],
                got: vec![grad_output.len()],
            });
        }
        Ok(self.apply_surrogate(input, grad_output))
    }

    fn apply_surrogate(&self, input: &Array1<f32>, grad_output: &Array1<f32>) -> Array1<f32> {
        input
            .iter()
            .zip(grad_output.iter())
            .map(|(&x, &g)| g * self.surrogate_grad(x))
            .collect()
    }
}

/// Autograd op: `sign(a)` forward, surrogate derivative backward
pub fn binarize(a: &Tensor, strategy: BinarizationStrategy) -> Tensor {
    let data = a.data().mapv(sign);
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(BinarizeBackward {
            a: a.clone(),
            strategy,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct BinarizeBackward {
    a: Tensor,
    strategy: BinarizationStrategy,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for BinarizeBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a
                    .accumulate_grad(self.strategy.apply_surrogate(self.a.data(), grad));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}
