//! Eager implementations of the out-of-place operators.

use crate::error::Error;
use crate::layout::numel;
use crate::op::Op;
use crate::tensor::Tensor;
use crate::value::Value;

fn zip_with(lhs: &Tensor, rhs: &Tensor, f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    lhs.to_vec()
        .into_iter()
        .zip(rhs.to_vec())
        .map(|(a, b)| f(a, b))
        .collect()
}

fn map(input: &Tensor, f: impl Fn(f64) -> f64) -> Vec<f64> {
    input.to_vec().into_iter().map(f).collect()
}

/// Computes a fresh result tensor. Views, in-place operators and `size` are not handled here.
pub fn compute(op: &Op, inputs: &[&Tensor]) -> Result<Tensor, Error> {
    let metas: Vec<_> = inputs.iter().map(|t| t.meta()).collect();
    let out = match op.infer_meta(&metas.iter().collect::<Vec<_>>())? {
        Value::Tensor(meta) => meta,
        _ => {
            return Err(Error::Invariant(format!(
                "'{}' does not produce a tensor",
                op.name()
            )))
        }
    };

    let data = match op {
        Op::Full { sizes, value, .. } => vec![*value; numel(sizes)],
        Op::Add => zip_with(inputs[0], inputs[1], |a, b| a + b),
        Op::Sub => zip_with(inputs[0], inputs[1], |a, b| a - b),
        Op::Mul => zip_with(inputs[0], inputs[1], |a, b| a * b),
        &Op::AddScalar(s) => map(inputs[0], |a| a + s),
        &Op::MulScalar(s) => map(inputs[0], |a| a * s),
        Op::Neg => map(inputs[0], |a| -a),
        Op::Sin => map(inputs[0], f64::sin),
        Op::Cos => map(inputs[0], f64::cos),
        Op::Sum => vec![inputs[0].to_vec().into_iter().sum()],
        Op::Clone | Op::UnsafeView(_) => inputs[0].to_vec(),

        Op::StridedScatter(layout) => {
            let mut data = inputs[0].to_vec();
            for (pos, value) in layout.positions().into_iter().zip(inputs[1].to_vec()) {
                data[pos] = value;
            }
            data
        }

        Op::StridedGather(layout) => {
            let base = inputs[0].to_vec();
            layout.positions().into_iter().map(|pos| base[pos]).collect()
        }

        Op::StridedGradient { sizes, layout } => {
            let mut data = vec![0.0; numel(sizes)];
            for (pos, value) in layout.positions().into_iter().zip(inputs[0].to_vec()) {
                data[pos] += value;
            }
            data
        }

        _ => {
            return Err(Error::Invariant(format!(
                "'{}' has no out-of-place kernel",
                op.name()
            )))
        }
    };

    Tensor::from_vec_dtype(out.sizes(), data, out.dtype)
}
