#![allow(dead_code)]

use aot_autograd::{interpreter_compiler, AotConfig};
use aot_tensor::dispatch;
use aot_tensor::{Op, Tensor, Value, ViewOp};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> AotConfig {
    let mut config = AotConfig::new(interpreter_compiler());
    config.debug_assert = true;
    config
}

pub fn tensor(sizes: &[usize], data: &[f64]) -> Tensor {
    Tensor::from_vec(sizes, data.to_vec()).unwrap()
}

pub fn leaf(sizes: &[usize], data: &[f64]) -> Tensor {
    let t = tensor(sizes, data);
    t.set_requires_grad(true).unwrap();
    t
}

/// A non-leaf copy of `t` which carries autograd history back to it.
pub fn non_leaf(t: &Tensor) -> Tensor {
    dispatch::call(&Op::MulScalar(1.0), &[Value::Tensor(t.clone())])
        .unwrap()
        .tensor()
        .unwrap()
}

pub fn reshape(t: &Tensor, sizes: &[usize]) -> Tensor {
    dispatch::call(
        &Op::View(ViewOp::Reshape(sizes.to_vec())),
        &[Value::Tensor(t.clone())],
    )
    .unwrap()
    .tensor()
    .unwrap()
}

pub fn ones_like(t: &Tensor) -> Tensor {
    Tensor::from_vec(&t.sizes(), vec![1.0; t.numel()]).unwrap()
}

/// The gradient of `out.sum()` with respect to `input`.
pub fn grad_of_sum(out: &Tensor, input: &Tensor) -> Vec<f64> {
    let grads =
        aot_tensor::autograd::grad(&[out.clone()], &[Some(ones_like(out))], &[input.clone()], false)
            .unwrap();
    grads[0].as_ref().unwrap().to_vec()
}

pub fn assert_close(found: &[f64], expected: &[f64]) {
    assert_eq!(found.len(), expected.len(), "{:?} vs {:?}", found, expected);
    for (a, b) in found.iter().zip(expected) {
        assert!((a - b).abs() < 1e-9, "{:?} vs {:?}", found, expected);
    }
}
