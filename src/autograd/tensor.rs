//! Flat tensor with gradient tracking

use super::BackwardOp;
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use std::cell::RefCell;
use std::rc::Rc;

/// Tensor with automatic differentiation support.
///
/// Data is stored flattened; matrices are row-major and their shape is
/// passed explicitly to the ops that need it.
#[derive(Clone)]
pub struct Tensor {
    data: Array1<f32>,
    grad: Rc<RefCell<Option<Array1<f32>>>>,
    backward_op: Option<Rc<dyn BackwardOp>>,
    requires_grad: bool,
}

impl Tensor {
    pub fn new(data: Array1<f32>, requires_grad: bool) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            backward_op: None,
            requires_grad,
        }
    }

    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self::new(Array1::from(data), requires_grad)
    }

    /// Flatten a row-major matrix into a tensor
    pub fn from_array2(matrix: &Array2<f32>, requires_grad: bool) -> Self {
        let flat: Vec<f32> = matrix.iter().copied().collect();
        Self::from_vec(flat, requires_grad)
    }

    pub fn zeros(size: usize, requires_grad: bool) -> Self {
        Self::new(Array1::zeros(size), requires_grad)
    }

    pub fn ones(size: usize, requires_grad: bool) -> Self {
        Self::new(Array1::ones(size), requires_grad)
    }

    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// Reshape the data into a `rows x cols` matrix
    pub fn to_array2(&self, rows: usize, cols: usize) -> Result<Array2<f32>> {
        Array2::from_shape_vec((rows, cols), self.data.to_vec()).map_err(|_| {
            Error::ShapeMismatch {
                expected: vec![rows * cols],
                got: vec![self.data.len()],
            }
        })
    }

    /// Gradient reshaped into a `rows x cols` matrix, if one was computed
    pub fn grad_array2(&self, rows: usize, cols: usize) -> Option<Array2<f32>> {
        let grad = self.grad()?;
        Array2::from_shape_vec((rows, cols), grad.to_vec()).ok()
    }

    pub fn grad(&self) -> Option<Array1<f32>> {
        self.grad.borrow().clone()
    }

    pub fn set_grad(&self, grad: Array1<f32>) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Accumulate gradient (for when tensor is used multiple times)
    pub fn accumulate_grad(&self, grad: Array1<f32>) {
        let mut grad_ref = self.grad.borrow_mut();
        if let Some(existing) = grad_ref.as_mut() {
            *existing = &*existing + &grad;
        } else {
            *grad_ref = Some(grad);
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// A copy of the data cut off from the graph
    pub fn detach(&self) -> Self {
        Self::new(self.data.clone(), false)
    }

    /// Shared gradient cell, captured by backward ops of results
    pub fn grad_cell(&self) -> Rc<RefCell<Option<Array1<f32>>>> {
        self.grad.clone()
    }

    pub fn set_backward_op(&mut self, op: Rc<dyn BackwardOp>) {
        self.backward_op = Some(op);
    }

    pub fn backward_op(&self) -> Option<Rc<dyn BackwardOp>> {
        self.backward_op.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("data", &self.data)
            .field("grad", &self.grad.borrow())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}
