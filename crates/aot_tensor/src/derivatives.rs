//! Vector-Jacobian products, written once for every consumer of gradients.
//!
//! The eager engine instantiates [`Emit`] with real tensors; graph differentiation instantiates it
//! with graph nodes.

use crate::error::Error;
use crate::layout::{Layout, TensorMeta};
use crate::op::{Op, ViewOp};

pub trait Emit {
    type Handle: Clone;

    fn emit(&mut self, op: Op, args: &[Self::Handle]) -> Result<Self::Handle, Error>;

    fn meta(&self, handle: &Self::Handle) -> Result<TensorMeta, Error>;
}

/// Layout of a view relative to the logical elements of its input.
///
/// `as_strided` is taken as relative to a contiguous, zero-offset input, which is how it appears
/// in traced graphs.
fn relative_layout(view: &ViewOp, input: &TensorMeta) -> Result<Layout, Error> {
    match view {
        ViewOp::AsStrided(layout) => Ok(layout.clone()),
        _ => view.apply(&Layout::contiguous(input.sizes())),
    }
}

/// Gradients of `op`'s tensor arguments given the gradient of its result. `None` marks an
/// argument which receives no gradient.
pub fn vjp<E: Emit>(
    cx: &mut E,
    op: &Op,
    inputs: &[E::Handle],
    grad: &E::Handle,
) -> Result<Vec<Option<E::Handle>>, Error> {
    if inputs.len() != op.num_tensor_args() {
        return Err(Error::Invariant(format!(
            "'{}' differentiated with {} inputs",
            op.name(),
            inputs.len()
        )));
    }
    let g = grad.clone();

    Ok(match op {
        Op::Add => vec![Some(g.clone()), Some(g)],

        Op::Sub => vec![Some(g.clone()), Some(cx.emit(Op::Neg, &[g])?)],

        Op::Mul => {
            let lhs = cx.emit(Op::Mul, &[g.clone(), inputs[1].clone()])?;
            let rhs = cx.emit(Op::Mul, &[g, inputs[0].clone()])?;
            vec![Some(lhs), Some(rhs)]
        }

        Op::AddScalar(_) | Op::Clone => vec![Some(g)],

        &Op::MulScalar(s) => vec![Some(cx.emit(Op::MulScalar(s), &[g])?)],

        Op::Neg => vec![Some(cx.emit(Op::Neg, &[g])?)],

        Op::Sin => {
            let cos = cx.emit(Op::Cos, &[inputs[0].clone()])?;
            vec![Some(cx.emit(Op::Mul, &[g, cos])?)]
        }

        Op::Cos => {
            let sin = cx.emit(Op::Sin, &[inputs[0].clone()])?;
            let neg_sin = cx.emit(Op::Neg, &[sin])?;
            vec![Some(cx.emit(Op::Mul, &[g, neg_sin])?)]
        }

        Op::Sum => {
            let sizes = cx.meta(&inputs[0])?.layout.sizes;
            vec![Some(cx.emit(Op::View(ViewOp::Expand(sizes)), &[g])?)]
        }

        Op::UnsafeView(_) => {
            let sizes = cx.meta(&inputs[0])?.layout.sizes;
            vec![Some(cx.emit(Op::UnsafeView(sizes), &[g])?)]
        }

        Op::View(view) => {
            let input = cx.meta(&inputs[0])?;
            let layout = relative_layout(view, &input)?;
            let mut input_grad = cx.emit(
                Op::StridedGradient {
                    sizes: input.layout.sizes.clone(),
                    layout,
                },
                &[g],
            )?;
            if let ViewOp::Reinterpret(_) = view {
                input_grad = cx.emit(
                    Op::View(ViewOp::Reinterpret(input.dtype)),
                    &[input_grad],
                )?;
            }
            vec![Some(input_grad)]
        }

        Op::StridedScatter(layout) => {
            let dtype = cx.meta(&g)?.dtype;
            let zeros = cx.emit(
                Op::Full {
                    sizes: layout.sizes.clone(),
                    value: 0.0,
                    dtype,
                },
                &[],
            )?;
            let base_grad = cx.emit(Op::StridedScatter(layout.clone()), &[g.clone(), zeros])?;
            let src_grad = cx.emit(Op::StridedGather(layout.clone()), &[g])?;
            vec![Some(base_grad), Some(src_grad)]
        }

        Op::StridedGather(layout) => {
            let sizes = cx.meta(&inputs[0])?.layout.sizes;
            vec![Some(cx.emit(
                Op::StridedGradient {
                    sizes,
                    layout: layout.clone(),
                },
                &[g],
            )?)]
        }

        Op::StridedGradient { layout, .. } => {
            vec![Some(cx.emit(Op::StridedGather(layout.clone()), &[g])?)]
        }

        Op::Full { .. } | Op::Detach | Op::Size(_) => vec![None; op.num_tensor_args()],

        _ => return Err(Error::NotDifferentiable(op.name())),
    })
}
