//! Tracing interpreter which turns every mutation into an out-of-place operation.
//!
//! Each traced tensor belongs to a functional storage whose contents are, at any point, the value
//! of one graph node (the storage's root value). A view remembers the chain of view operations
//! leading from the root to itself. Writing through a tensor records a new root value (a
//! `strided_scatter` when the tensor is not the whole root) and bumps the storage's generation,
//! which makes every other tensor on that storage re-derive its value by replaying its chain
//! the next time it is read.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use id_collections::IdVec;
use im_rc::Vector;
use rustc_hash::{FxHashMap, FxHashSet};

use aot_tensor::autograd::is_grad_enabled;
use aot_tensor::interp::ViewBase;
use aot_tensor::storage::{StorageHandle, StorageKey};
use aot_tensor::tensor::TensorId;
use aot_tensor::{
    Error, Interpreter, Op, OpKind, TRef, Tensor, TensorMeta, Val, Value, ViewOp,
};

use crate::decomp::DecompositionTable;
use crate::graph::{Graph, NodeId, PlaceholderRole};

struct FStorage {
    handle: StorageHandle,
    value: Cell<NodeId>,
    generation: Cell<u64>,
    root: TensorMeta,
}

struct FTensor {
    id: usize,
    storage: Rc<FStorage>,
    /// Views applied to the storage's root value to produce this tensor.
    chain: RefCell<Vector<ViewOp>>,
    /// Layout relative to the logical elements of the root value.
    meta: RefCell<TensorMeta>,
    cached: Cell<(u64, NodeId)>,
    requires_grad: Cell<bool>,
    /// A leaf that requires grad may not be written to while grad mode is on.
    grad_leaf: Cell<bool>,
    base: Option<Rc<FTensor>>,
    tracks_grad: bool,
    /// Values read through this tensor never carry gradients.
    detached: bool,
    metadata_mutated: Cell<bool>,
}

struct InputSlot {
    tensor: Rc<FTensor>,
    placeholder: NodeId,
    initial_meta: TensorMeta,
}

/// What tracing observed about one traced tensor.
#[derive(Clone, Debug)]
pub struct TracedTensor {
    /// Equal for two references to the same traced tensor.
    pub identity: usize,
    pub storage: StorageKey,
    pub meta: TensorMeta,
    pub requires_grad: bool,
    /// Identity and requires-grad of the root this tensor is a view of.
    pub base: Option<(usize, bool)>,
}

/// The state of an input after tracing.
#[derive(Clone, Debug)]
pub struct InputState {
    pub identity: usize,
    pub storage: StorageKey,
    pub mutates_data: bool,
    pub mutates_metadata: bool,
    pub requires_grad: bool,
}

pub struct Functionalizer {
    graph: Graph,
    tensors: IdVec<TRef, Rc<FTensor>>,
    inputs: Vec<Option<InputSlot>>,
    memo: FxHashMap<TensorId, Rc<FTensor>>,
    next_id: usize,
    decompositions: DecompositionTable,
    active_decompositions: FxHashSet<OpKind>,
}

impl Functionalizer {
    pub fn new(decompositions: DecompositionTable) -> Self {
        Functionalizer {
            graph: Graph::new(),
            tensors: IdVec::new(),
            inputs: Vec::new(),
            memo: FxHashMap::default(),
            next_id: 0,
            decompositions,
            active_decompositions: FxHashSet::default(),
        }
    }

    fn register(&mut self, tensor: Rc<FTensor>) -> TRef {
        self.tensors.push(tensor)
    }

    fn new_root(&mut self, node: NodeId, meta: TensorMeta, requires_grad: bool) -> Rc<FTensor> {
        let id = self.next_id;
        self.next_id += 1;
        Rc::new(FTensor {
            id,
            storage: Rc::new(FStorage {
                handle: StorageHandle::acquire(),
                value: Cell::new(node),
                generation: Cell::new(0),
                root: meta.clone(),
            }),
            chain: RefCell::new(Vector::new()),
            meta: RefCell::new(meta),
            cached: Cell::new((0, node)),
            requires_grad: Cell::new(requires_grad),
            grad_leaf: Cell::new(false),
            base: None,
            tracks_grad: true,
            detached: false,
            metadata_mutated: Cell::new(false),
        })
    }

    /// Adds a placeholder for a real argument. The same tensor passed twice is traced as one
    /// tensor.
    pub fn import(&mut self, value: &Value<Tensor>, name: &str) -> Val {
        let Value::Tensor(tensor) = value else {
            let meta = value.clone().map(|t| t.meta());
            self.graph
                .add_placeholder(name, PlaceholderRole::Primal, meta);
            self.inputs.push(None);
            return value.scalar().unwrap_or(Value::None);
        };

        let meta = TensorMeta::contiguous(&tensor.sizes(), tensor.dtype());
        let placeholder = self.graph.add_placeholder(
            name,
            PlaceholderRole::Primal,
            Value::Tensor(meta.clone()),
        );

        let traced = match self.memo.get(&tensor.id()) {
            Some(existing) => existing.clone(),
            None => {
                let traced = self.new_root(placeholder, meta.clone(), tensor.requires_grad());
                traced
                    .grad_leaf
                    .set(tensor.is_leaf() && tensor.requires_grad());
                self.memo.insert(tensor.id(), traced.clone());
                traced
            }
        };
        self.inputs.push(Some(InputSlot {
            tensor: traced.clone(),
            placeholder,
            initial_meta: meta,
        }));
        Value::Tensor(self.register(traced))
    }

    /// Adds a placeholder for an argument known only by its metadata.
    pub fn import_meta(
        &mut self,
        meta: &Value<TensorMeta>,
        requires_grad: bool,
        name: &str,
        role: PlaceholderRole,
    ) -> Val {
        let placeholder = self.graph.add_placeholder(name, role, meta.clone());
        let Value::Tensor(meta) = meta else {
            self.inputs.push(None);
            return meta.scalar().unwrap_or(Value::None);
        };
        let meta = TensorMeta::contiguous(meta.sizes(), meta.dtype);
        let traced = self.new_root(placeholder, meta.clone(), requires_grad);
        traced.grad_leaf.set(requires_grad);
        self.inputs.push(Some(InputSlot {
            tensor: traced.clone(),
            placeholder,
            initial_meta: meta,
        }));
        Value::Tensor(self.register(traced))
    }

    fn traced(&self, t: TRef) -> Result<Rc<FTensor>, Error> {
        if t.0 >= self.tensors.len() {
            return Err(Error::Invariant(format!(
                "tensor reference {} does not belong to this trace",
                t.0
            )));
        }
        Ok(self.tensors[t].clone())
    }

    /// The graph node holding the current value of `tensor`.
    fn sync(&mut self, tensor: &FTensor) -> Result<NodeId, Error> {
        let storage = &tensor.storage;
        let (generation, node) = tensor.cached.get();
        if generation == storage.generation.get() {
            return Ok(node);
        }

        let mut node = storage.value.get();
        let mut meta = storage.root.clone();
        for view in tensor.chain.borrow().iter() {
            meta = view.apply_meta(&meta)?;
            node = self
                .graph
                .add_call(Op::View(view.clone()), vec![node], Value::Tensor(meta.clone()));
        }
        if tensor.detached {
            node = self
                .graph
                .add_call(Op::Detach, vec![node], Value::Tensor(meta));
        }
        tensor.cached.set((storage.generation.get(), node));
        Ok(node)
    }

    pub fn value_node(&mut self, t: TRef) -> Result<NodeId, Error> {
        let tensor = self.traced(t)?;
        self.sync(&tensor)
    }

    pub fn outputs(&mut self, outs: &[Val]) -> Result<Vec<Value<NodeId>>, Error> {
        outs.iter()
            .map(|out| out.clone().try_map(|t| self.value_node(t)))
            .collect()
    }

    pub fn info(&self, t: TRef) -> Result<TracedTensor, Error> {
        let tensor = self.traced(t)?;
        let meta = tensor.meta.borrow().clone();
        Ok(TracedTensor {
            identity: tensor.id,
            storage: tensor.storage.handle.key(),
            meta,
            requires_grad: tensor.requires_grad.get(),
            base: tensor
                .base
                .as_ref()
                .map(|base| (base.id, base.requires_grad.get())),
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input_state(&self, index: usize) -> Option<InputState> {
        let slot = self.inputs.get(index)?.as_ref()?;
        let tensor = &slot.tensor;
        Some(InputState {
            identity: tensor.id,
            storage: tensor.storage.handle.key(),
            mutates_data: tensor.storage.generation.get() > 0,
            mutates_metadata: tensor.metadata_mutated.get()
                && *tensor.meta.borrow() != slot.initial_meta,
            requires_grad: tensor.requires_grad.get(),
        })
    }

    /// Records `input.copy_(final value of input)` into the graph.
    pub fn copy_back_input(&mut self, index: usize) -> Result<NodeId, Error> {
        let (tensor, placeholder) = match self.inputs.get(index) {
            Some(Some(slot)) => (slot.tensor.clone(), slot.placeholder),
            _ => {
                return Err(Error::Invariant(format!(
                    "input {} is not a traced tensor",
                    index
                )))
            }
        };
        let value = self.sync(&tensor)?;
        self.graph
            .add_call_inferred(Op::CopyInplace, vec![placeholder, value])
    }

    pub fn finish(mut self, outputs: Vec<Value<NodeId>>) -> Graph {
        self.graph.outputs = outputs;
        self.graph
    }

    fn guards_leaf(tensor: &FTensor) -> bool {
        tensor.grad_leaf.get()
            || (tensor.tracks_grad
                && tensor
                    .base
                    .as_ref()
                    .map_or(false, |base| base.grad_leaf.get()))
    }

    fn functional(&mut self, op: &Op, args: &[Rc<FTensor>]) -> Result<Val, Error> {
        let nodes = args
            .iter()
            .map(|arg| self.sync(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let mut node = self.graph.add_call_inferred(op.clone(), nodes)?;
        let meta = self.graph.tensor_meta(node)?.clone();

        let inputs_require_grad = args.iter().any(|arg| arg.requires_grad.get());
        if !is_grad_enabled() && inputs_require_grad && op.is_differentiable() {
            node = self
                .graph
                .add_call(Op::Detach, vec![node], Value::Tensor(meta.clone()));
        }
        let requires_grad = is_grad_enabled() && op.is_differentiable() && inputs_require_grad;
        let result = self.new_root(node, meta, requires_grad);
        Ok(Value::Tensor(self.register(result)))
    }

    fn view(&mut self, tensor: &Rc<FTensor>, view: &ViewOp) -> Result<Val, Error> {
        let meta = view.apply_meta(&tensor.meta.borrow())?;
        if meta.layout.extent() > tensor.storage.root.layout.numel() {
            return Err(Error::invalid(
                view.name(),
                format!("{:?} is out of bounds for its storage", meta.layout),
            ));
        }
        let source = self.sync(tensor)?;
        let tracks_grad = is_grad_enabled() && tensor.tracks_grad;
        let mut node = self
            .graph
            .add_call(Op::View(view.clone()), vec![source], Value::Tensor(meta.clone()));
        let detached = tensor.detached || (!tracks_grad && tensor.requires_grad.get());
        if detached && !tensor.detached {
            node = self
                .graph
                .add_call(Op::Detach, vec![node], Value::Tensor(meta.clone()));
        }

        let mut chain = tensor.chain.borrow().clone();
        chain.push_back(view.clone());
        let id = self.next_id;
        self.next_id += 1;
        let result = Rc::new(FTensor {
            id,
            storage: tensor.storage.clone(),
            chain: RefCell::new(chain),
            meta: RefCell::new(meta),
            cached: Cell::new((tensor.storage.generation.get(), node)),
            requires_grad: Cell::new(tracks_grad && tensor.requires_grad.get()),
            grad_leaf: Cell::new(false),
            base: Some(tensor.base.clone().unwrap_or_else(|| tensor.clone())),
            tracks_grad,
            detached,
            metadata_mutated: Cell::new(false),
        });
        Ok(Value::Tensor(self.register(result)))
    }

    fn detach(&mut self, tensor: &Rc<FTensor>) -> Result<Val, Error> {
        let source = self.sync(tensor)?;
        let meta = tensor.meta.borrow().clone();
        let node = self
            .graph
            .add_call(Op::Detach, vec![source], Value::Tensor(meta.clone()));
        let id = self.next_id;
        self.next_id += 1;
        let result = Rc::new(FTensor {
            id,
            storage: tensor.storage.clone(),
            chain: RefCell::new(tensor.chain.borrow().clone()),
            meta: RefCell::new(meta),
            cached: Cell::new((tensor.storage.generation.get(), node)),
            requires_grad: Cell::new(false),
            grad_leaf: Cell::new(false),
            base: None,
            tracks_grad: false,
            detached: true,
            metadata_mutated: Cell::new(false),
        });
        Ok(Value::Tensor(self.register(result)))
    }

    fn write_back(&mut self, target: &FTensor, value: NodeId) -> Result<(), Error> {
        let storage = target.storage.clone();
        let is_root = target.chain.borrow().is_empty();
        let root_value = if is_root {
            value
        } else {
            let layout = target.meta.borrow().layout.clone();
            if layout.has_internal_overlap() {
                return Err(Error::Unsupported(
                    "in-place write into a view in which several elements share one memory \
                     location"
                        .to_owned(),
                ));
            }
            self.graph.add_call(
                Op::StridedScatter(layout),
                vec![storage.value.get(), value],
                Value::Tensor(storage.root.clone()),
            )
        };
        storage.value.set(root_value);
        let generation = storage.generation.get() + 1;
        storage.generation.set(generation);
        // A view's value must stay a view of the new root, so it is re-derived on the next read.
        if is_root {
            target.cached.set((generation, value));
        }
        Ok(())
    }

    fn mutate(&mut self, op: &Op, args: &[Rc<FTensor>]) -> Result<Val, Error> {
        let target = &args[0];
        if is_grad_enabled() && Self::guards_leaf(target) {
            return Err(Error::LeafMutation);
        }

        let target_meta = target.meta.borrow().clone();
        let new_value = match op {
            Op::CopyInplace => {
                let src_meta = args[1].meta.borrow().clone();
                if src_meta.sizes() != target_meta.sizes() {
                    return Err(Error::ShapeMismatch {
                        op: "copy_",
                        expected: target_meta.sizes().to_vec(),
                        found: src_meta.sizes().to_vec(),
                    });
                }
                let src = self.sync(&args[1])?;
                self.graph.add_call_inferred(Op::Clone, vec![src])?
            }
            Op::ZeroInplace => self.graph.add_call_inferred(
                Op::Full {
                    sizes: target_meta.sizes().to_vec(),
                    value: 0.0,
                    dtype: target_meta.dtype,
                },
                vec![],
            )?,
            _ => {
                let functional_op = op.functional_counterpart().ok_or_else(|| {
                    Error::Invariant(format!("'{}' has no functional counterpart", op.name()))
                })?;
                let nodes = args
                    .iter()
                    .map(|arg| self.sync(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.graph.add_call_inferred(functional_op, nodes)?
            }
        };

        if is_grad_enabled() && args[1..].iter().any(|arg| arg.requires_grad.get()) {
            target.requires_grad.set(true);
            if let Some(base) = &target.base {
                base.requires_grad.set(true);
            }
        }

        self.write_back(target, new_value)?;
        Ok(Value::Tensor(self.register(target.clone())))
    }

    fn restride(&mut self, tensor: &Rc<FTensor>, view: ViewOp) -> Result<Val, Error> {
        let meta = view.apply_meta(&tensor.meta.borrow())?;
        if meta.layout.extent() > tensor.storage.root.layout.numel() {
            return Err(Error::invalid(
                view.name(),
                format!("{:?} is out of bounds for its storage", meta.layout),
            ));
        }
        let source = self.sync(tensor)?;
        let node = self
            .graph
            .add_call(Op::View(view.clone()), vec![source], Value::Tensor(meta.clone()));
        tensor.chain.borrow_mut().push_back(view);
        *tensor.meta.borrow_mut() = meta;
        tensor.metadata_mutated.set(true);
        tensor
            .cached
            .set((tensor.storage.generation.get(), node));
        Ok(Value::Tensor(self.register(tensor.clone())))
    }
}

impl Interpreter for Functionalizer {
    fn call(&mut self, op: &Op, args: &[Val]) -> Result<Val, Error> {
        let kind = op.kind();
        if let Some(decomposition) = self.decompositions.get(&kind).cloned() {
            if self.active_decompositions.insert(kind) {
                let result = decomposition(self as &mut dyn Interpreter, op, args);
                self.active_decompositions.remove(&kind);
                return result;
            }
        }

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
        let tensors = args
            .iter()
            .map(|arg| self.traced(arg.tensor()?))
            .collect::<Result<Vec<_>, _>>()?;

        match op {
            Op::Size(_) => {
                let meta = tensors[0].meta.borrow().clone();
                op.infer_meta(&[&meta])?.scalar().ok_or_else(|| {
                    Error::Invariant("size() produced a tensor".to_owned())
                })
            }
            Op::View(view) => self.view(&tensors[0], view),
            Op::Detach => self.detach(&tensors[0]),
            _ if op.mutates_data() => self.mutate(op, &tensors),
            _ => match op.metadata_view() {
                Some(view) => self.restride(&tensors[0], view),
                None => self.functional(op, &tensors),
            },
        }
    }

    fn meta(&self, tensor: TRef) -> TensorMeta {
        self.tensors[tensor].meta.borrow().clone()
    }

    fn requires_grad(&self, tensor: TRef) -> bool {
        self.tensors[tensor].requires_grad.get()
    }

    fn set_requires_grad(&mut self, tensor: TRef, requires_grad: bool) -> Result<(), Error> {
        let tensor = self.traced(tensor)?;
        if requires_grad && !tensor.requires_grad.get() {
            tensor.grad_leaf.set(true);
        }
        if !requires_grad {
            tensor.grad_leaf.set(false);
        }
        tensor.requires_grad.set(requires_grad);
        Ok(())
    }

    fn view_base(&mut self, tensor: TRef) -> Option<ViewBase> {
        let tensor = self.traced(tensor).ok()?;
        let base = tensor.base.clone()?;
        let chain = tensor.chain.borrow().clone();
        Some(ViewBase {
            base: self.register(base),
            chain,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::NodeKind;
    use crate::pretty_print::graph_to_string;
    use crate::run_graph::run_graph;
    use aot_tensor::autograd::no_grad;

    fn input(data: &[f64]) -> Value<Tensor> {
        Value::Tensor(Tensor::from_vec(&[data.len()], data.to_vec()).unwrap())
    }

    #[test]
    fn mutation_becomes_new_value() {
        let _guard = no_grad();
        let mut fz = Functionalizer::new(DecompositionTable::default());
        let x = fz.import(&input(&[1.0, 2.0, 3.0]), "arg0_1").tensor().unwrap();
        let cx: &mut dyn Interpreter = &mut fz;
        cx.mul_scalar_(x, 2.0).unwrap();
        let out = cx.mul_scalar(x, 3.0).unwrap();

        let state = fz.input_state(0).unwrap();
        assert!(state.mutates_data);
        assert!(!state.mutates_metadata);

        let outputs = fz.outputs(&[Value::Tensor(out)]).unwrap();
        let graph = fz.finish(outputs);
        assert!(graph.calls().all(|(_, op)| !op.is_mutable()));
    }

    #[test]
    fn writes_through_views_scatter_into_the_root() {
        let _guard = no_grad();
        let mut fz = Functionalizer::new(DecompositionTable::default());
        let x = fz.import(&input(&[1.0, 2.0, 3.0, 4.0]), "arg0_1").tensor().unwrap();
        let cx: &mut dyn Interpreter = &mut fz;
        let head = cx.slice(x, 0, 0, 2, 1).unwrap();
        let tail = cx.slice(x, 0, 2, 4, 1).unwrap();
        cx.add_scalar_(head, 1.0).unwrap();

        let head_info = fz.info(head).unwrap();
        let x_info = fz.info(x).unwrap();
        assert_eq!(head_info.storage, x_info.storage);
        assert_eq!(head_info.base.map(|(id, _)| id), Some(x_info.identity));

        let outputs = fz.outputs(&[Value::Tensor(tail)]).unwrap();
        let graph = fz.finish(outputs);
        let text = graph_to_string(&graph);
        assert!(text.contains("strided_scatter"), "{}", text);
    }

    #[test]
    fn mutated_views_stay_views_of_the_root() {
        let _guard = no_grad();
        let mut fz = Functionalizer::new(DecompositionTable::default());
        let x = input(&[1.0, 2.0, 3.0, 4.0]);
        let xr = fz.import(&x, "arg0_1").tensor().unwrap();
        let cx: &mut dyn Interpreter = &mut fz;
        let v = cx.slice(xr, 0, 1, 3, 1).unwrap();
        cx.add_scalar_(v, 10.0).unwrap();

        let outputs = fz.outputs(&[Value::Tensor(v)]).unwrap();
        let graph = fz.finish(outputs);
        let out_node = graph.outputs[0].tensor().unwrap();
        assert!(matches!(graph.node(out_node).kind, NodeKind::Call(Op::View(_))));

        let out = run_graph(&graph, vec![x]).unwrap()[0].tensor().unwrap();
        assert_eq!(out.to_vec(), vec![12.0, 13.0]);
        assert_eq!(out.layout().offset, 1);
        assert!(out.is_view());
    }

    #[test]
    fn metadata_mutation_is_tracked() {
        let _guard = no_grad();
        let mut fz = Functionalizer::new(DecompositionTable::default());
        let x = Tensor::from_vec(&[2, 3], vec![0.0; 6]).unwrap();
        let x = fz.import(&Value::Tensor(x), "arg0_1").tensor().unwrap();
        let cx: &mut dyn Interpreter = &mut fz;
        cx.t_(x).unwrap();
        assert_eq!(cx.sizes(x), vec![3, 2]);

        let state = fz.input_state(0).unwrap();
        assert!(state.mutates_metadata);
        assert!(!state.mutates_data);
    }

    #[test]
    fn same_tensor_is_traced_once() {
        let mut fz = Functionalizer::new(DecompositionTable::default());
        let x = input(&[1.0]);
        let a = fz.import(&x, "arg0_1").tensor().unwrap();
        let b = fz.import(&x, "arg1_1").tensor().unwrap();
        assert_eq!(fz.info(a).unwrap().identity, fz.info(b).unwrap().identity);
    }

    #[test]
    fn decompositions_apply_once_per_call() {
        let _guard = no_grad();
        let mut fz = Functionalizer::new(crate::decomp::core_decompositions());
        let x = fz.import(&input(&[1.0, 2.0]), "arg0_1").tensor().unwrap();
        let y = fz.import(&input(&[3.0, 4.0]), "arg1_1").tensor().unwrap();
        let cx: &mut dyn Interpreter = &mut fz;
        let out = cx.sub(x, y).unwrap();
        let outputs = fz.outputs(&[Value::Tensor(out)]).unwrap();
        let graph = fz.finish(outputs);
        let ops: Vec<_> = graph.calls().map(|(_, op)| op.kind()).collect();
        assert_eq!(ops, vec![OpKind::MulScalar, OpKind::Add]);
    }

    #[test]
    fn leaf_inputs_requiring_grad_cannot_be_mutated() {
        let mut fz = Functionalizer::new(DecompositionTable::default());
        let x = Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap();
        x.set_requires_grad(true).unwrap();
        let x = fz.import(&Value::Tensor(x), "arg0_1").tensor().unwrap();
        let cx: &mut dyn Interpreter = &mut fz;
        assert!(matches!(cx.mul_scalar_(x, 2.0), Err(Error::LeafMutation)));

        let detached = cx.detach(x).unwrap();
        cx.mul_scalar_(detached, 2.0).unwrap();
        assert!(fz.input_state(0).unwrap().mutates_data);
    }
}
