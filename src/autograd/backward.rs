//! Backward operation trait

use super::Tensor;

/// A node's local derivative rule.
///
/// `backward` reads the gradient accumulated on the node's output and adds
/// the input gradients. It never recurses: [`backward`](super::backward)
/// orders the tape and calls every node exactly once, after all of its
/// consumers.
pub trait BackwardOp {
    fn backward(&self);

    /// Tensors this node was computed from
    fn inputs(&self) -> Vec<&Tensor>;
}
