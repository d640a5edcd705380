use std::rc::Weak;

use crate::autograd::{is_grad_enabled, Edge, GradNode};
use crate::derivatives::{vjp, Emit};
use crate::dispatch;
use crate::error::Error;
use crate::layout::{DType, Layout, TensorMeta};
use crate::op::Op;
use crate::tensor::{Tensor, TensorImpl};
use crate::value::Value;

pub(crate) struct EagerEmit;

impl Emit for EagerEmit {
    type Handle = Tensor;

    fn emit(&mut self, op: Op, args: &[Tensor]) -> Result<Tensor, Error> {
        let args: Vec<_> = args.iter().cloned().map(Value::Tensor).collect();
        dispatch::call(&op, &args)?.tensor()
    }

    fn meta(&self, handle: &Tensor) -> Result<TensorMeta, Error> {
        Ok(handle.meta())
    }
}

fn call1(op: Op, arg: &Tensor) -> Result<Tensor, Error> {
    EagerEmit.emit(op, std::slice::from_ref(arg))
}

fn zeros(sizes: &[usize], dtype: DType) -> Result<Tensor, Error> {
    EagerEmit.emit(
        Op::Full {
            sizes: sizes.to_vec(),
            value: 0.0,
            dtype,
        },
        &[],
    )
}

/// Sink for the gradient of a leaf.
pub struct AccumulateGrad {
    target: Weak<TensorImpl>,
}

impl AccumulateGrad {
    pub(crate) fn new(target: Weak<TensorImpl>) -> Self {
        AccumulateGrad { target }
    }
}

impl GradNode for AccumulateGrad {
    fn name(&self) -> String {
        "AccumulateGrad".to_owned()
    }

    fn next_edges(&self) -> Vec<Option<Edge>> {
        Vec::new()
    }

    fn apply(&self, mut grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error> {
        let (Some(target), Some(Some(grad))) = (Tensor::from_weak(&self.target), grads.pop())
        else {
            return Ok(Vec::new());
        };
        let grad = if is_grad_enabled() { grad } else { grad.detach() };
        let total = match target.grad() {
            None => grad,
            Some(prev) => EagerEmit.emit(Op::Add, &[prev, grad])?,
        };
        target.set_grad(Some(total));
        Ok(Vec::new())
    }
}

/// Backward of an out-of-place operator.
pub struct OpBackward {
    op: Op,
    inputs: Vec<Tensor>,
    edges: Vec<Option<Edge>>,
}

impl OpBackward {
    pub(crate) fn new(op: Op, inputs: Vec<Tensor>) -> Self {
        let edges = inputs.iter().map(Tensor::grad_edge).collect();
        OpBackward { op, inputs, edges }
    }
}

impl GradNode for OpBackward {
    fn name(&self) -> String {
        format!("{}Backward", self.op.name())
    }

    fn next_edges(&self) -> Vec<Option<Edge>> {
        self.edges.clone()
    }

    fn apply(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error> {
        let Some(Some(grad)) = grads.into_iter().next() else {
            return Ok(vec![None; self.edges.len()]);
        };
        let mut input_grads = vjp(&mut EagerEmit, &self.op, &self.inputs, &grad)?;
        for (input_grad, edge) in input_grads.iter_mut().zip(&self.edges) {
            if edge.is_none() {
                *input_grad = None;
            }
        }
        Ok(input_grads)
    }
}

/// Routes the gradient of a view to its root, in storage coordinates.
pub struct ViewBackward {
    root_edge: Edge,
    storage_len: usize,
    root_layout: Layout,
    view_layout: Layout,
}

impl ViewBackward {
    pub(crate) fn new(
        root_edge: Edge,
        storage_len: usize,
        root_layout: Layout,
        view_layout: Layout,
    ) -> Self {
        ViewBackward {
            root_edge,
            storage_len,
            root_layout,
            view_layout,
        }
    }
}

impl GradNode for ViewBackward {
    fn name(&self) -> String {
        "ViewBackward".to_owned()
    }

    fn next_edges(&self) -> Vec<Option<Edge>> {
        vec![Some(self.root_edge.clone())]
    }

    fn apply(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error> {
        let Some(Some(grad)) = grads.into_iter().next() else {
            return Ok(vec![None]);
        };
        let flat = call1(
            Op::StridedGradient {
                sizes: vec![self.storage_len],
                layout: self.view_layout.clone(),
            },
            &grad,
        )?;
        Ok(vec![Some(call1(
            Op::StridedGather(self.root_layout.clone()),
            &flat,
        )?)])
    }
}

/// Backward of a write through a view: the root's new history.
///
/// Edge 0 is the root's history before the write, edge 1 the written value's.
pub struct CopySlices {
    edges: [Option<Edge>; 2],
    storage_len: usize,
    root_layout: Layout,
    view_layout: Layout,
}

impl CopySlices {
    pub(crate) fn new(
        root_edge: Option<Edge>,
        src_edge: Option<Edge>,
        storage_len: usize,
        root_layout: Layout,
        view_layout: Layout,
    ) -> Self {
        CopySlices {
            edges: [root_edge, src_edge],
            storage_len,
            root_layout,
            view_layout,
        }
    }
}

impl GradNode for CopySlices {
    fn name(&self) -> String {
        "CopySlices".to_owned()
    }

    fn next_edges(&self) -> Vec<Option<Edge>> {
        self.edges.to_vec()
    }

    fn apply(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error> {
        let Some(Some(grad)) = grads.into_iter().next() else {
            return Ok(vec![None, None]);
        };
        let flat = call1(
            Op::StridedGradient {
                sizes: vec![self.storage_len],
                layout: self.root_layout.clone(),
            },
            &grad,
        )?;
        let src_grad = call1(Op::StridedGather(self.view_layout.clone()), &flat)?;
        let cleared = EagerEmit.emit(
            Op::StridedScatter(self.view_layout.clone()),
            &[flat, zeros(&self.view_layout.sizes, grad.dtype())?],
        )?;
        let root_grad = call1(Op::StridedGather(self.root_layout.clone()), &cleared)?;
        Ok(vec![Some(root_grad), Some(src_grad)])
    }
}

/// Backward of a write to a whole tensor: the old value receives nothing.
pub struct CopyBackward {
    edges: [Option<Edge>; 2],
}

impl CopyBackward {
    pub(crate) fn new(dst_edge: Option<Edge>, src_edge: Option<Edge>) -> Self {
        CopyBackward {
            edges: [dst_edge, src_edge],
        }
    }
}

impl GradNode for CopyBackward {
    fn name(&self) -> String {
        "CopyBackward".to_owned()
    }

    fn next_edges(&self) -> Vec<Option<Edge>> {
        self.edges.to_vec()
    }

    fn apply(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error> {
        let Some(Some(grad)) = grads.into_iter().next() else {
            return Ok(vec![None, None]);
        };
        Ok(vec![Some(zeros(&grad.sizes(), grad.dtype())?), Some(grad)])
    }
}
