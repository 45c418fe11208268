//! Tape-based autograd engine
//!
//! Small reverse-mode engine used to wire quantization operators with custom
//! derivative rules (straight-through and smooth sign surrogates) into a
//! differentiable linear forward pass.

mod backward;
mod ops;
mod tensor;


pub use backward::BackwardOp;
pub use ops::*;
pub use tensor::Tensor;

use std::collections::HashSet;
use std::rc::Rc;

/// Run the backward pass from `tensor`.
///
/// With no explicit `grad_output` the seed gradient is all ones, which is the
/// gradient of `sum(tensor)`. Nodes run in reverse topological order, so a
/// tensor feeding several ops has its full gradient before it propagates.
pub fn backward(tensor: &mut Tensor, grad_output: Option<ndarray::Array1<f32>>) {
    match grad_output {
        Some(grad) => tensor.set_grad(grad),
        None => tensor.set_grad(ndarray::Array1::ones(tensor.len())),
    }

    let Some(root) = tensor.backward_op() else {
        return;
    };

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    topological_order(root, &mut visited, &mut order);

    for op in order.iter().rev() {
        op.backward();
    }
}

/// Post-order DFS over the tape: every node lands after all of its inputs
fn topological_order(
    op: Rc<dyn BackwardOp>,
    visited: &mut HashSet<*const ()>,
    order: &mut Vec<Rc<dyn BackwardOp>>,
) {
    if !visited.insert(Rc::as_ptr(&op) as *const ()) {
        return;
    }
    for input in op.inputs() {
        if let Some(child) = input.backward_op() {
            topological_order(child, visited, order);
        }
    }
    order.push(op);
}
