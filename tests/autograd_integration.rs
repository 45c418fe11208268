//! Integration tests for the autograd engine and the differentiable
//! quantized forward pass built on it.

use approx::assert_abs_diff_eq;
use binquant::autograd::{add, backward, mul, scale, sum, Tensor};
use binquant::{BinarizationStrategy, MixedPrecisionLinear, QuantizationConfig};
use ndarray::{arr2, Array1, Array2};
use std::sync::Arc;

fn spiked() -> Array2<f32> {
    arr2(&[
        [100.0, 0.1, 0.2, -0.1],
        [0.5, -0.5, 0.4, -0.4],
        [0.5, -0.5, 0.4, -0.4],
        [0.5, -0.5, 0.4, -0.4],
    ])
}

#[test]
fn test_tensor_grad_accumulation() {
    let t = Tensor::from_vec(vec![1.0, 2.0], true);
    t.accumulate_grad(Array1::from(vec![1.0, 1.0]));
    t.accumulate_grad(Array1::from(vec![2.0, 3.0]));

    let grad = t.grad().expect("should have grad");
    assert_abs_diff_eq!(grad[0], 3.0);
    assert_abs_diff_eq!(grad[1], 4.0);

    t.zero_grad();
    assert!(t.grad().is_none());
}

#[test]
fn test_backward_with_custom_grad() {
    let mut t = Tensor::from_vec(vec![1.0, 2.0], true);
    backward(&mut t, Some(Array1::from(vec![0.5, 0.5])));

    let grad = t.grad().expect("should have grad");
    assert_abs_diff_eq!(grad[0], 0.5);
    assert_abs_diff_eq!(grad[1], 0.5);
}

#[test]
fn test_squared_error_through_quantized_layer() {
    let config = Arc::new(QuantizationConfig::default().with_outlier_scale(0.5));
    let layer = MixedPrecisionLinear::from_weights(spiked(), None, config)
        .unwrap()
        .with_strategy(BinarizationStrategy::StraightThrough { saturate: false });

    let input = arr2(&[[1.0, 2.0, -1.0, 0.5], [0.0, -1.0, 3.0, 1.0]]);
    let target = arr2(&[[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]]);

    let w = layer.weight_tensor().unwrap();
    let x = Tensor::from_array2(&input, false);
    let t = Tensor::from_array2(&target, false);
    let y = layer.forward_tensor(&x, 2, &w, None).unwrap();
    let diff = add(&y, &scale(&t, -1.0));
    let mut loss = sum(&mul(&diff, &diff));
    backward(&mut loss, None);

    // ∂L/∂W_sim[o, i] = Σ_b 2·(y - t)[b, o]·x[b, i]
    let residual = y.to_array2(2, 4).unwrap() - &target;
    let grad_sim = residual.t().dot(&input) * 2.0;
    let grad = w.grad_array2(4, 4).unwrap();

    let mask = layer.mask().unwrap();
    let channel_scale = layer.scale().unwrap();
    for o in 0..4 {
        for i in 0..4 {
            let expected = if mask.is_outlier(o, i) {
                0.5 * grad_sim[[o, i]]
            } else {
                channel_scale.get(o) * grad_sim[[o, i]]
            };
            assert_abs_diff_eq!(grad[[o, i]], expected, epsilon = 1e-3);
        }
    }
}

#[test]
fn test_optimizer_step_keeps_mask() {
    let config = Arc::new(QuantizationConfig::default());
    let mut layer = MixedPrecisionLinear::from_weights(spiked(), None, config).unwrap();

    for _ in 0..3 {
        let w = layer.weight_tensor().unwrap();
        let x = Tensor::from_vec(vec![1.0, -1.0, 1.0, -1.0], false);
        let mut loss = sum(&layer.forward_tensor(&x, 1, &w, None).unwrap());
        backward(&mut loss, None);

        let grad = w.grad_array2(4, 4).unwrap();
        layer.weight_mut().unwrap().scaled_add(-0.01, &grad);
    }

    let mask = layer.mask().unwrap();
    assert_eq!(mask.outlier_count(), 1);
    assert!(mask.is_outlier(0, 0));
}
