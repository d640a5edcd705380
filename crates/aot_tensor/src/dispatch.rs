//! Eager execution of operators, recording autograd history when grad mode asks for it.

use std::rc::Rc;

use crate::autograd::nodes::{CopyBackward, CopySlices, OpBackward};
use crate::autograd::{is_grad_enabled, Edge, GradNode};
use crate::error::Error;
use crate::kernels;
use crate::op::Op;
use crate::tensor::Tensor;
use crate::value::Value;

fn tensor_args(op: &Op, args: &[Value<Tensor>]) -> Result<Vec<Tensor>, Error> {
    if args.len() != op.num_tensor_args() {
        return Err(Error::invalid(
            op.name(),
            format!(
                "expected {} arguments, found {}",
                op.num_tensor_args(),
                args.len()
            ),
        ));
    }
    args.iter()
        .map(|arg| {
            arg.as_tensor().cloned().ok_or_else(|| {
                Error::invalid(op.name(), format!("expected a tensor, found {:?}", arg.kind()))
            })
        })
        .collect()
}

pub fn call(op: &Op, args: &[Value<Tensor>]) -> Result<Value<Tensor>, Error> {
    let tensors = tensor_args(op, args)?;

    if let Op::Size(_) = op {
        let size = op.infer_meta(&[&tensors[0].meta()])?;
        return size
            .scalar()
            .ok_or_else(|| Error::Invariant("size() produced a tensor".to_owned()));
    }
    if let Op::View(view) = op {
        return Ok(Value::Tensor(tensors[0].make_view(view)?));
    }
    if let Op::Detach = op {
        return Ok(Value::Tensor(tensors[0].detach()));
    }
    if op.mutates_data() {
        return Ok(Value::Tensor(mutate(op, &tensors)?));
    }
    if let Some(view) = op.metadata_view() {
        tensors[0].restride(&view)?;
        return Ok(Value::Tensor(tensors[0].clone()));
    }
    Ok(Value::Tensor(functional(op, &tensors)?))
}

fn functional(op: &Op, tensors: &[Tensor]) -> Result<Tensor, Error> {
    let refs: Vec<&Tensor> = tensors.iter().collect();
    let out = kernels::compute(op, &refs)?;
    if is_grad_enabled() && op.is_differentiable() && tensors.iter().any(Tensor::requires_grad) {
        let node: Rc<dyn GradNode> = Rc::new(OpBackward::new(op.clone(), tensors.to_vec()));
        out.set_history(Edge::new(node, 0))?;
    }
    Ok(out)
}

fn mutate(op: &Op, tensors: &[Tensor]) -> Result<Tensor, Error> {
    let target = &tensors[0];
    let new_value = match op {
        Op::CopyInplace => tensors[1].clone(),
        Op::ZeroInplace => functional(
            &Op::Full {
                sizes: target.sizes(),
                value: 0.0,
                dtype: target.dtype(),
            },
            &[],
        )?,
        _ => {
            let functional_op = op.functional_counterpart().ok_or_else(|| {
                Error::Invariant(format!("'{}' has no functional counterpart", op.name()))
            })?;
            functional(&functional_op, tensors)?
        }
    };
    copy_into(target, &new_value)?;
    Ok(target.clone())
}

/// Writes `src` into `dst` and rebases `dst`'s autograd history onto the write.
pub fn copy_into(dst: &Tensor, src: &Tensor) -> Result<(), Error> {
    if dst.sizes() != src.sizes() {
        return Err(Error::ShapeMismatch {
            op: "copy_",
            expected: dst.sizes(),
            found: src.sizes(),
        });
    }

    let tracked = is_grad_enabled() && (dst.requires_grad() || src.requires_grad());
    let root = dst
        .view_info()
        .filter(|info| info.tracks_grad)
        .map(|info| info.base);

    if tracked {
        let owner = root.as_ref().unwrap_or(dst);
        if owner.is_leaf() && owner.requires_grad() {
            return Err(Error::LeafMutation);
        }
    }

    let values = src.to_vec();
    dst.write(&values)?;

    if tracked {
        let src_edge = src.grad_edge();
        match root {
            Some(root) => {
                let node: Rc<dyn GradNode> = Rc::new(CopySlices::new(
                    root.grad_edge(),
                    src_edge,
                    root.storage().len(),
                    root.layout(),
                    dst.layout(),
                ));
                root.set_history(Edge::new(node, 0))?;
            }
            None => {
                let node: Rc<dyn GradNode> = Rc::new(CopyBackward::new(dst.grad_edge(), src_edge));
                dst.set_history(Edge::new(node, 0))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::autograd::{self, no_grad};
    use crate::op::ViewOp;

    fn tensor(sizes: &[usize], data: &[f64]) -> Tensor {
        Tensor::from_vec(sizes, data.to_vec()).unwrap()
    }

    fn run(op: Op, args: &[&Tensor]) -> Tensor {
        let args: Vec<_> = args.iter().map(|&t| Value::Tensor(t.clone())).collect();
        call(&op, &args).unwrap().tensor().unwrap()
    }

    #[test]
    fn mutation_through_view_is_visible_in_base() {
        let x = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let row = run(Op::View(ViewOp::Select { dim: 0, index: 1 }), &[&x]);
        run(Op::MulScalarInplace(10.0), &[&row]);
        assert_eq!(x.to_vec(), vec![1.0, 2.0, 30.0, 40.0]);
    }

    #[test]
    fn mutating_a_leaf_requiring_grad_fails() {
        let x = tensor(&[2], &[1.0, 2.0]);
        x.set_requires_grad(true).unwrap();
        let result = call(&Op::MulScalarInplace(2.0), &[Value::Tensor(x.clone())]);
        assert!(matches!(result, Err(Error::LeafMutation)));
        assert_eq!(x.to_vec(), vec![1.0, 2.0]);

        let _guard = no_grad();
        run(Op::MulScalarInplace(2.0), &[&x]);
        assert_eq!(x.to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn gradient_flows_through_write_into_view() {
        let leaf = tensor(&[3], &[1.0, 2.0, 3.0]);
        leaf.set_requires_grad(true).unwrap();
        let y = run(Op::MulScalar(1.0), &[&leaf]);
        let head = run(
            Op::View(ViewOp::Slice {
                dim: 0,
                start: 0,
                end: 2,
                step: 1,
            }),
            &[&y],
        );
        run(Op::MulScalarInplace(5.0), &[&head]);
        let total = run(Op::Sum, &[&y]);

        let grads = autograd::grad(&[total], &[None], &[leaf], false).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().to_vec(), vec![5.0, 5.0, 1.0]);
    }

    #[test]
    fn backward_accumulates_into_leaves() {
        let a = tensor(&[2], &[1.0, 2.0]);
        let b = tensor(&[2], &[3.0, 4.0]);
        a.set_requires_grad(true).unwrap();
        b.set_requires_grad(true).unwrap();
        let prod = run(Op::Mul, &[&a, &b]);
        let total = run(Op::Sum, &[&prod]);
        autograd::backward(&[total.clone()], &[None]).unwrap();
        autograd::backward(&[total], &[None]).unwrap();
        assert_eq!(a.grad().unwrap().to_vec(), vec![6.0, 8.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn size_returns_an_integer() {
        let x = tensor(&[2, 3], &[0.0; 6]);
        let size = call(&Op::Size(1), &[Value::Tensor(x)]).unwrap();
        assert!(matches!(size, Value::Int(3)));
    }

    #[test]
    fn transpose_in_place_restrides() {
        let x = tensor(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        run(Op::TransposeInplace(0, 1), &[&x]);
        assert_eq!(x.sizes(), vec![3, 2]);
        assert_eq!(x.to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }
}
