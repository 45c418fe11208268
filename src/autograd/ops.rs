//! Autograd operations with backward passes
//!
//! Matrices are flattened row-major; ops that need a shape take it explicitly.

use super::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

type GradCell = Rc<RefCell<Option<Array1<f32>>>>;

/// Add two tensors element-wise
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add: length mismatch");
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}

/// Multiply two tensors element-wise
pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "mul: length mismatch");
    let data = a.data() * b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MulBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MulBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for MulBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * b
                self.a.accumulate_grad(grad * self.b.data());
            }
            if self.b.requires_grad() {
                // ∂L/∂b = ∂L/∂out * a
                self.b.accumulate_grad(grad * self.a.data());
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}

/// Scale tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: GradCell,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad * self.factor);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Sum all elements into a single-element tensor
pub fn sum(a: &Tensor) -> Tensor {
    let total = a.data().sum();
    let requires_grad = a.requires_grad();

    let mut result = Tensor::from_vec(vec![total], requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SumBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct SumBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for SumBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a
                    .accumulate_grad(Array1::from_elem(self.a.len(), grad[0]));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Element-wise selection: `out[i] = if mask[i] { a[i] } else { b[i] }`.
///
/// The gradient is routed to whichever input was selected at each position.
pub fn select(mask: &[bool], a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(mask.len(), a.len(), "select: mask/a length mismatch");
    assert_eq!(mask.len(), b.len(), "select: mask/b length mismatch");

    let data: Array1<f32> = mask
        .iter()
        .zip(a.data().iter().zip(b.data().iter()))
        .map(|(&m, (&x, &y))| if m { x } else { y })
        .collect();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SelectBackward {
            mask: mask.to_vec(),
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct SelectBackward {
    mask: Vec<bool>,
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for SelectBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                let grad_a: Array1<f32> = self
                    .mask
                    .iter()
                    .zip(grad.iter())
                    .map(|(&m, &g)| if m { g } else { 0.0 })
                    .collect();
                self.a.accumulate_grad(grad_a);
            }
            if self.b.requires_grad() {
                let grad_b: Array1<f32> = self
                    .mask
                    .iter()
                    .zip(grad.iter())
                    .map(|(&m, &g)| if m { 0.0 } else { g })
                    .collect();
                self.b.accumulate_grad(grad_b);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}

/// Transpose a `rows x cols` matrix into `cols x rows`
pub fn transpose(a: &Tensor, rows: usize, cols: usize) -> Tensor {
    assert_eq!(a.len(), rows * cols, "transpose: size mismatch");

    let data = transpose_flat(a.data(), rows, cols);
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(TransposeBackward {
            a: a.clone(),
            rows,
            cols,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

fn transpose_flat(data: &Array1<f32>, rows: usize, cols: usize) -> Array1<f32> {
    let mut out = Array1::zeros(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = data[i * cols + j];
        }
    }
    out
}

struct TransposeBackward {
    a: Tensor,
    rows: usize,
    cols: usize,
    result_grad: GradCell,
}

impl BackwardOp for TransposeBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // grad is cols x rows; transpose back
                self.a
                    .accumulate_grad(transpose_flat(grad, self.cols, self.rows));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a]
    }
}

/// Add a length-`cols` row vector to every row of a `rows x cols` matrix
pub fn add_row_broadcast(x: &Tensor, row: &Tensor, rows: usize, cols: usize) -> Tensor {
    assert_eq!(x.len(), rows * cols, "add_row_broadcast: matrix size mismatch");
    assert_eq!(row.len(), cols, "add_row_broadcast: row length mismatch");

    let mut data = x.data().clone();
    for i in 0..rows {
        for j in 0..cols {
            data[i * cols + j] += row.data()[j];
        }
    }
    let requires_grad = x.requires_grad() || row.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(AddRowBroadcastBackward {
            x: x.clone(),
            row: row.clone(),
            rows,
            cols,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddRowBroadcastBackward {
    x: Tensor,
    row: Tensor,
    rows: usize,
    cols: usize,
    result_grad: GradCell,
}

impl BackwardOp for AddRowBroadcastBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.x.requires_grad() {
                self.x.accumulate_grad(grad.clone());
            }
            if self.row.requires_grad() {
                // ∂L/∂row[j] = Σ_i ∂L/∂out[i, j]
                let mut grad_row = Array1::zeros(self.cols);
                for i in 0..self.rows {
                    for j in 0..self.cols {
                        grad_row[j] += grad[i * self.cols + j];
                    }
                }
                self.row.accumulate_grad(grad_row);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.x, &self.row]
    }
}

/// Matrix multiplication
///
/// Computes C = A @ B where:
/// - A is m×k (flattened to length m*k)
/// - B is k×n (flattened to length k*n)
/// - C is m×n (flattened to length m*n)
pub fn matmul(a: &Tensor, b: &Tensor, m: usize, k: usize, n: usize) -> Tensor {
    assert_eq!(a.len(), m * k, "Matrix A size mismatch");
    assert_eq!(b.len(), k * n, "Matrix B size mismatch");

    let mut result_data = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            for p in 0..k {
                acc += a.data()[i * k + p] * b.data()[p * n + j];
            }
            result_data[i * n + j] = acc;
        }
    }

    let requires_grad = a.requires_grad() || b.requires_grad();
    let mut result = Tensor::new(Array1::from(result_data), requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MatmulBackward {
            a: a.clone(),
            b: b.clone(),
            m,
            k,
            n,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MatmulBackward {
    a: Tensor,
    b: Tensor,
    m: usize,
    k: usize,
    n: usize,
    result_grad: GradCell,
}

impl BackwardOp for MatmulBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            // ∂L/∂A = ∂L/∂C @ B^T
            // ∂L/∂B = A^T @ ∂L/∂C

            if self.a.requires_grad() {
                let mut grad_a = vec![0.0; self.m * self.k];
                for i in 0..self.m {
                    for p in 0..self.k {
                        let mut acc = 0.0;
                        for j in 0..self.n {
                            acc += grad_output[i * self.n + j] * self.b.data()[p * self.n + j];
                        }
                        grad_a[i * self.k + p] = acc;
                    }
                }
                self.a.accumulate_grad(Array1::from(grad_a));
            }

            if self.b.requires_grad() {
                let mut grad_b = vec![0.0; self.k * self.n];
                for p in 0..self.k {
                    for j in 0..self.n {
                        let mut acc = 0.0;
                        for i in 0..self.m {
                            acc += self.a.data()[i * self.k + p] * grad_output[i * self.n + j];
                        }
                        grad_b[p * self.n + j] = acc;
                    }
                }
                self.b.accumulate_grad(Array1::from(grad_b));
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}
