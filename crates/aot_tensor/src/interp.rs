//! The interface user functions are written against.
//!
//! A function receives tensors as opaque [`TRef`]s and manipulates them only through an
//! [`Interpreter`], so the same function can be run eagerly or traced into a graph.

use std::rc::Rc;

use id_collections::{id_type, IdVec};
use im_rc::Vector;

use crate::dispatch;
use crate::error::Error;
use crate::layout::{DType, Layout, TensorMeta};
use crate::op::{Op, ViewOp};
use crate::tensor::Tensor;
use crate::value::Value;

#[id_type]
pub struct TRef(pub usize);

pub type Val = Value<TRef>;

/// The root a view was derived from, and the views applied to it.
#[derive(Clone, Debug)]
pub struct ViewBase {
    pub base: TRef,
    pub chain: Vector<ViewOp>,
}

pub trait Interpreter {
    fn call(&mut self, op: &Op, args: &[Val]) -> Result<Val, Error>;

    fn meta(&self, tensor: TRef) -> TensorMeta;

    fn requires_grad(&self, tensor: TRef) -> bool;

    fn set_requires_grad(&mut self, tensor: TRef, requires_grad: bool) -> Result<(), Error>;

    fn view_base(&mut self, tensor: TRef) -> Option<ViewBase>;
}

/// A function over a flat list of arguments returning a flat list of results.
pub type FlatFn = Rc<dyn Fn(&mut dyn Interpreter, &[Val]) -> Result<Vec<Val>, Error>>;

pub fn flat_fn(
    f: impl Fn(&mut dyn Interpreter, &[Val]) -> Result<Vec<Val>, Error> + 'static,
) -> FlatFn {
    Rc::new(f)
}

impl<'a> dyn Interpreter + 'a {
    pub fn op(&mut self, op: Op, args: &[TRef]) -> Result<TRef, Error> {
        let args: Vec<Val> = args.iter().map(|&t| Value::Tensor(t)).collect();
        self.call(&op, &args)?.tensor()
    }

    pub fn sizes(&self, t: TRef) -> Vec<usize> {
        self.meta(t).layout.sizes
    }

    pub fn full(&mut self, sizes: &[usize], value: f64, dtype: DType) -> Result<TRef, Error> {
        self.op(
            Op::Full {
                sizes: sizes.to_vec(),
                value,
                dtype,
            },
            &[],
        )
    }

    pub fn add(&mut self, a: TRef, b: TRef) -> Result<TRef, Error> {
        self.op(Op::Add, &[a, b])
    }

    pub fn sub(&mut self, a: TRef, b: TRef) -> Result<TRef, Error> {
        self.op(Op::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: TRef, b: TRef) -> Result<TRef, Error> {
        self.op(Op::Mul, &[a, b])
    }

    pub fn add_scalar(&mut self, a: TRef, s: f64) -> Result<TRef, Error> {
        self.op(Op::AddScalar(s), &[a])
    }

    pub fn mul_scalar(&mut self, a: TRef, s: f64) -> Result<TRef, Error> {
        self.op(Op::MulScalar(s), &[a])
    }

    pub fn neg(&mut self, a: TRef) -> Result<TRef, Error> {
        self.op(Op::Neg, &[a])
    }

    pub fn sin(&mut self, a: TRef) -> Result<TRef, Error> {
        self.op(Op::Sin, &[a])
    }

    pub fn cos(&mut self, a: TRef) -> Result<TRef, Error> {
        self.op(Op::Cos, &[a])
    }

    pub fn sum(&mut self, a: TRef) -> Result<TRef, Error> {
        self.op(Op::Sum, &[a])
    }

    pub fn clone(&mut self, a: TRef) -> Result<TRef, Error> {
        self.op(Op::Clone, &[a])
    }

    pub fn detach(&mut self, a: TRef) -> Result<TRef, Error> {
        self.op(Op::Detach, &[a])
    }

    pub fn unsafe_view(&mut self, a: TRef, sizes: &[usize]) -> Result<TRef, Error> {
        self.op(Op::UnsafeView(sizes.to_vec()), &[a])
    }

    pub fn view_op(&mut self, a: TRef, view: ViewOp) -> Result<TRef, Error> {
        self.op(Op::View(view), &[a])
    }

    pub fn view(&mut self, a: TRef, sizes: &[usize]) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::Reshape(sizes.to_vec()))
    }

    /// Flattens to one dimension.
    pub fn flatten(&mut self, a: TRef) -> Result<TRef, Error> {
        let numel = self.sizes(a).iter().product::<usize>();
        self.view(a, &[numel])
    }

    pub fn transpose(&mut self, a: TRef, d0: usize, d1: usize) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::Transpose(d0, d1))
    }

    pub fn t(&mut self, a: TRef) -> Result<TRef, Error> {
        if self.sizes(a).len() < 2 {
            return self.view_op(a, ViewOp::Alias);
        }
        self.transpose(a, 0, 1)
    }

    pub fn slice(
        &mut self,
        a: TRef,
        dim: usize,
        start: usize,
        end: usize,
        step: usize,
    ) -> Result<TRef, Error> {
        self.view_op(
            a,
            ViewOp::Slice {
                dim,
                start,
                end,
                step,
            },
        )
    }

    pub fn select(&mut self, a: TRef, dim: usize, index: usize) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::Select { dim, index })
    }

    pub fn unsqueeze(&mut self, a: TRef, dim: usize) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::Unsqueeze(dim))
    }

    pub fn expand(&mut self, a: TRef, sizes: &[usize]) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::Expand(sizes.to_vec()))
    }

    pub fn as_strided(&mut self, a: TRef, layout: Layout) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::AsStrided(layout))
    }

    pub fn alias(&mut self, a: TRef) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::Alias)
    }

    pub fn view_dtype(&mut self, a: TRef, dtype: DType) -> Result<TRef, Error> {
        self.view_op(a, ViewOp::Reinterpret(dtype))
    }

    pub fn add_(&mut self, a: TRef, b: TRef) -> Result<TRef, Error> {
        self.op(Op::AddInplace, &[a, b])
    }

    pub fn mul_(&mut self, a: TRef, b: TRef) -> Result<TRef, Error> {
        self.op(Op::MulInplace, &[a, b])
    }

    pub fn add_scalar_(&mut self, a: TRef, s: f64) -> Result<TRef, Error> {
        self.op(Op::AddScalarInplace(s), &[a])
    }

    pub fn mul_scalar_(&mut self, a: TRef, s: f64) -> Result<TRef, Error> {
        self.op(Op::MulScalarInplace(s), &[a])
    }

    pub fn copy_(&mut self, dst: TRef, src: TRef) -> Result<TRef, Error> {
        self.op(Op::CopyInplace, &[dst, src])
    }

    pub fn zero_(&mut self, a: TRef) -> Result<TRef, Error> {
        self.op(Op::ZeroInplace, &[a])
    }

    pub fn transpose_(&mut self, a: TRef, d0: usize, d1: usize) -> Result<TRef, Error> {
        self.op(Op::TransposeInplace(d0, d1), &[a])
    }

    pub fn t_(&mut self, a: TRef) -> Result<TRef, Error> {
        self.transpose_(a, 0, 1)
    }

    pub fn unsqueeze_(&mut self, a: TRef, dim: usize) -> Result<TRef, Error> {
        self.op(Op::UnsqueezeInplace(dim), &[a])
    }

    pub fn as_strided_(&mut self, a: TRef, layout: Layout) -> Result<TRef, Error> {
        self.op(Op::AsStridedInplace(layout), &[a])
    }

    pub fn size(&mut self, a: TRef, dim: usize) -> Result<i64, Error> {
        match self.call(&Op::Size(dim), &[Value::Tensor(a)])? {
            Value::Int(size) => Ok(size),
            other => Err(Error::Invariant(format!(
                "size() returned {:?}",
                other.kind()
            ))),
        }
    }
}

/// Runs functions directly on tensors.
pub struct EagerInterpreter {
    tensors: IdVec<TRef, Tensor>,
}

impl Default for EagerInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl EagerInterpreter {
    pub fn new() -> Self {
        EagerInterpreter {
            tensors: IdVec::new(),
        }
    }

    pub fn import(&mut self, value: &Value<Tensor>) -> Val {
        value.clone().map(|t| self.tensors.push(t))
    }

    pub fn export(&self, value: &Val) -> Value<Tensor> {
        value.clone().map(|t| self.tensors[t].clone())
    }

    pub fn tensor(&self, t: TRef) -> &Tensor {
        &self.tensors[t]
    }
}

impl Interpreter for EagerInterpreter {
    fn call(&mut self, op: &Op, args: &[Val]) -> Result<Val, Error> {
        let args: Vec<_> = args.iter().map(|arg| self.export(arg)).collect();
        let result = dispatch::call(op, &args)?;
        Ok(self.import(&result))
    }

    fn meta(&self, tensor: TRef) -> TensorMeta {
        self.tensors[tensor].meta()
    }

    fn requires_grad(&self, tensor: TRef) -> bool {
        self.tensors[tensor].requires_grad()
    }

    fn set_requires_grad(&mut self, tensor: TRef, requires_grad: bool) -> Result<(), Error> {
        self.tensors[tensor].set_requires_grad(requires_grad)
    }

    fn view_base(&mut self, tensor: TRef) -> Option<ViewBase> {
        let info = self.tensors[tensor].view_info()?;
        Some(ViewBase {
            base: self.tensors.push(info.base),
            chain: info.chain,
        })
    }
}

/// Calls `f` eagerly on `args`.
pub fn run_eager(f: &FlatFn, args: &[Value<Tensor>]) -> Result<Vec<Value<Tensor>>, Error> {
    let mut cx = EagerInterpreter::new();
    let args: Vec<Val> = args.iter().map(|arg| cx.import(arg)).collect();
    let outs = f(&mut cx, &args)?;
    Ok(outs.iter().map(|out| cx.export(out)).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eager_functions_mutate_their_arguments() {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            cx.mul_scalar_(x, 2.0)?;
            let out = cx.mul_scalar(x, 3.0)?;
            Ok(vec![Value::Tensor(out)])
        });
        let x = Tensor::from_vec(&[3], vec![1.0, 2.0, 3.0]).unwrap();
        let outs = run_eager(&f, &[Value::Tensor(x.clone())]).unwrap();
        assert_eq!(x.to_vec(), vec![2.0, 4.0, 6.0]);
        assert_eq!(outs[0].tensor().unwrap().to_vec(), vec![6.0, 12.0, 18.0]);
    }

    #[test]
    fn view_base_reports_root_and_chain() {
        let x = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut cx = EagerInterpreter::new();
        let xr = cx.import(&Value::Tensor(x.clone())).tensor().unwrap();
        let cx_dyn: &mut dyn Interpreter = &mut cx;
        let t = cx_dyn.t(xr).unwrap();
        let row = cx_dyn.select(t, 0, 0).unwrap();

        let base = cx_dyn.view_base(row).unwrap();
        assert_eq!(base.chain.len(), 2);
        assert!(cx.tensor(base.base).same(&x));
    }
}
