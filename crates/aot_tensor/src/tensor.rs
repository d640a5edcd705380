use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use im_rc::Vector;

use crate::autograd::nodes::{AccumulateGrad, ViewBackward};
use crate::autograd::{is_grad_enabled, Edge, GradNode};
use crate::error::Error;
use crate::layout::{numel, DType, Layout, TensorMeta};
use crate::op::ViewOp;
use crate::storage::{Storage, StorageKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
pub(crate) struct AutogradMeta {
    /// Only meaningful for leaves.
    requires_grad: bool,
    edge: Option<Edge>,
    grad: Option<Tensor>,
    accumulator: Option<Rc<AccumulateGrad>>,
}

/// How a view was derived from the root tensor owning its storage.
#[derive(Clone)]
pub struct ViewInfo {
    pub base: Tensor,
    pub chain: Vector<ViewOp>,
    /// Views created while grad mode was off do not route gradients to their base.
    pub tracks_grad: bool,
}

pub(crate) struct TensorImpl {
    id: TensorId,
    storage: Storage,
    layout: RefCell<Layout>,
    dtype: Cell<DType>,
    view: RefCell<Option<ViewInfo>>,
    autograd: RefCell<AutogradMeta>,
}

/// A strided window onto a shared storage, with optional autograd history.
///
/// Cloning a `Tensor` clones the handle, not the data: both clones are the same tensor.
#[derive(Clone)]
pub struct Tensor(pub(crate) Rc<TensorImpl>);

impl Tensor {
    fn from_parts(storage: Storage, layout: Layout, dtype: DType, view: Option<ViewInfo>) -> Self {
        Tensor(Rc::new(TensorImpl {
            id: TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)),
            storage,
            layout: RefCell::new(layout),
            dtype: Cell::new(dtype),
            view: RefCell::new(view),
            autograd: RefCell::new(AutogradMeta::default()),
        }))
    }

    pub fn from_vec_dtype(sizes: &[usize], data: Vec<f64>, dtype: DType) -> Result<Self, Error> {
        if data.len() != numel(sizes) {
            return Err(Error::invalid(
                "tensor",
                format!("{} elements cannot have shape {:?}", data.len(), sizes),
            ));
        }
        Ok(Tensor::from_parts(
            Storage::new(data),
            Layout::contiguous(sizes),
            dtype,
            None,
        ))
    }

    pub fn from_vec(sizes: &[usize], data: Vec<f64>) -> Result<Self, Error> {
        Tensor::from_vec_dtype(sizes, data, DType::F32)
    }

    pub fn scalar(value: f64) -> Self {
        Tensor::full(&[], value, DType::F32)
    }

    pub fn full(sizes: &[usize], value: f64, dtype: DType) -> Self {
        Tensor::from_parts(
            Storage::new(vec![value; numel(sizes)]),
            Layout::contiguous(sizes),
            dtype,
            None,
        )
    }

    pub fn zeros(meta: &TensorMeta) -> Self {
        Tensor::full(meta.sizes(), 0.0, meta.dtype)
    }

    /// A new root tensor over an existing storage.
    pub fn from_storage(storage: &Storage, layout: Layout, dtype: DType) -> Result<Self, Error> {
        check_in_bounds("set_", &layout, storage)?;
        Ok(Tensor::from_parts(storage.clone(), layout, dtype, None))
    }

    pub fn id(&self) -> TensorId {
        self.0.id
    }

    pub fn same(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn storage(&self) -> &Storage {
        &self.0.storage
    }

    pub fn storage_key(&self) -> StorageKey {
        self.0.storage.key()
    }

    pub fn layout(&self) -> Layout {
        self.0.layout.borrow().clone()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.0.layout.borrow().sizes.clone()
    }

    pub fn numel(&self) -> usize {
        self.0.layout.borrow().numel()
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype.get()
    }

    pub fn meta(&self) -> TensorMeta {
        TensorMeta {
            layout: self.layout(),
            dtype: self.dtype(),
        }
    }

    pub fn is_contiguous(&self) -> bool {
        self.0.layout.borrow().is_contiguous()
    }

    /// Elements in logical order.
    pub fn to_vec(&self) -> Vec<f64> {
        let data = self.0.storage.data();
        self.0
            .layout
            .borrow()
            .positions()
            .into_iter()
            .map(|pos| data[pos])
            .collect()
    }

    /// Overwrites the elements of this tensor without recording autograd history.
    pub(crate) fn write(&self, values: &[f64]) -> Result<(), Error> {
        let layout = self.layout();
        if values.len() != layout.numel() {
            return Err(Error::invalid(
                "copy_",
                format!(
                    "cannot write {} elements into a tensor of shape {:?}",
                    values.len(),
                    layout.sizes
                ),
            ));
        }
        if layout.has_internal_overlap() {
            return Err(Error::Unsupported(
                "more than one element of the written-to tensor refers to a single memory \
                 location; clone the tensor before writing to it"
                    .to_owned(),
            ));
        }
        let mut data = self.0.storage.data_mut();
        for (pos, &value) in layout.positions().into_iter().zip(values) {
            data[pos] = value;
        }
        Ok(())
    }

    pub fn view_info(&self) -> Option<ViewInfo> {
        self.0.view.borrow().clone()
    }

    pub fn is_view(&self) -> bool {
        self.0.view.borrow().is_some()
    }

    /// The root tensor this tensor is a view of.
    pub fn base(&self) -> Option<Tensor> {
        self.0.view.borrow().as_ref().map(|info| info.base.clone())
    }

    pub(crate) fn make_view(&self, op: &ViewOp) -> Result<Tensor, Error> {
        let layout = op.apply(&self.layout())?;
        check_in_bounds(op.name(), &layout, &self.0.storage)?;
        let dtype = op.output_dtype(self.dtype())?;

        let info = match self.view_info() {
            Some(parent) => ViewInfo {
                base: parent.base,
                chain: {
                    let mut chain = parent.chain;
                    chain.push_back(op.clone());
                    chain
                },
                tracks_grad: parent.tracks_grad && is_grad_enabled(),
            },
            None => ViewInfo {
                base: self.clone(),
                chain: Vector::unit(op.clone()),
                tracks_grad: is_grad_enabled(),
            },
        };

        Ok(Tensor::from_parts(
            self.0.storage.clone(),
            layout,
            dtype,
            Some(info),
        ))
    }

    /// Applies a view to this tensor's own metadata.
    pub(crate) fn restride(&self, op: &ViewOp) -> Result<(), Error> {
        let layout = op.apply(&self.layout())?;
        check_in_bounds(op.name(), &layout, &self.0.storage)?;
        let dtype = op.output_dtype(self.dtype())?;
        *self.0.layout.borrow_mut() = layout;
        self.0.dtype.set(dtype);
        if let Some(info) = self.0.view.borrow_mut().as_mut() {
            info.chain.push_back(op.clone());
        }
        Ok(())
    }

    /// Shares storage and metadata, but neither view-ness nor autograd history.
    pub fn detach(&self) -> Tensor {
        Tensor::from_parts(self.0.storage.clone(), self.layout(), self.dtype(), None)
    }

    fn tracking_base(&self) -> Option<Tensor> {
        match &*self.0.view.borrow() {
            Some(info) if info.tracks_grad => Some(info.base.clone()),
            _ => None,
        }
    }

    pub fn requires_grad(&self) -> bool {
        {
            let meta = self.0.autograd.borrow();
            if meta.requires_grad || meta.edge.is_some() {
                return true;
            }
        }
        self.tracking_base()
            .map_or(false, |base| base.requires_grad())
    }

    /// A tensor is a leaf unless it was produced by a differentiable computation.
    pub fn is_leaf(&self) -> bool {
        if self.0.autograd.borrow().edge.is_some() {
            return false;
        }
        self.tracking_base()
            .map_or(true, |base| !base.requires_grad())
    }

    pub fn set_requires_grad(&self, requires_grad: bool) -> Result<(), Error> {
        if !self.is_leaf() {
            if requires_grad {
                return Ok(());
            }
            return Err(Error::invalid(
                "requires_grad_",
                "requires_grad can only be turned off on leaf tensors; use detach() instead",
            ));
        }
        let mut meta = self.0.autograd.borrow_mut();
        meta.requires_grad = requires_grad;
        if !requires_grad {
            meta.accumulator = None;
        }
        Ok(())
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.0.autograd.borrow().grad.clone()
    }

    pub fn set_grad(&self, grad: Option<Tensor>) {
        self.0.autograd.borrow_mut().grad = grad;
    }

    /// Makes `edge` the source of this tensor's gradient history.
    pub fn set_history(&self, edge: Edge) -> Result<(), Error> {
        if self.is_leaf() && self.0.autograd.borrow().requires_grad {
            return Err(Error::LeafMutation);
        }
        let mut meta = self.0.autograd.borrow_mut();
        meta.edge = Some(edge);
        meta.requires_grad = false;
        meta.accumulator = None;
        Ok(())
    }

    /// Where gradients flowing into this tensor should be sent, if anywhere.
    pub fn grad_edge(&self) -> Option<Edge> {
        if let Some(edge) = self.0.autograd.borrow().edge.clone() {
            return Some(edge);
        }

        if let Some(base) = self.tracking_base() {
            if let Some(root_edge) = base.grad_edge() {
                let node: Rc<dyn GradNode> = Rc::new(ViewBackward::new(
                    root_edge,
                    self.0.storage.len(),
                    base.layout(),
                    self.layout(),
                ));
                return Some(Edge::new(node, 0));
            }
        }

        let mut meta = self.0.autograd.borrow_mut();
        if !meta.requires_grad {
            return None;
        }
        let accumulator = meta
            .accumulator
            .get_or_insert_with(|| Rc::new(AccumulateGrad::new(Rc::downgrade(&self.0))))
            .clone();
        Some(Edge::new(accumulator, 0))
    }

    pub(crate) fn from_weak(weak: &Weak<TensorImpl>) -> Option<Tensor> {
        weak.upgrade().map(Tensor)
    }
}

fn check_in_bounds(op: &'static str, layout: &Layout, storage: &Storage) -> Result<(), Error> {
    if layout.extent() > storage.len() {
        return Err(Error::invalid(
            op,
            format!(
                "layout {:?} is out of bounds for a storage of {} elements",
                layout,
                storage.len()
            ),
        ));
    }
    Ok(())
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_struct("Tensor");
        tuple
            .field("sizes", &self.sizes())
            .field("dtype", &self.dtype())
            .field("data", &self.to_vec());
        if self.requires_grad() {
            tuple.field("requires_grad", &true);
        }
        tuple.finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_vec())
    }
}
