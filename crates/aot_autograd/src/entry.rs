//! Entry points for embedders.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use aot_tensor::{flat_fn, Error, Interpreter, Tensor, Val, Value};

use crate::compiler::CompiledFn;
use crate::config::AotConfig;
use crate::pipeline::create_aot_dispatcher_function;
use crate::pytree::{tree_flatten, tree_unflatten, Tree, TreeSpec};

pub type TreeFn = Rc<dyn Fn(&mut dyn Interpreter, Tree<Val>) -> Result<Tree<Val>, Error>>;

pub fn tree_fn(
    f: impl Fn(&mut dyn Interpreter, Tree<Val>) -> Result<Tree<Val>, Error> + 'static,
) -> TreeFn {
    Rc::new(f)
}

struct Cached {
    compiled: CompiledFn,
    in_spec: TreeSpec,
    out_spec: Rc<RefCell<Option<TreeSpec>>>,
}

/// A function compiled on its first call, taking and returning arbitrary trees.
pub struct AotFunction {
    f: TreeFn,
    config: AotConfig,
    cached: RefCell<Option<Rc<Cached>>>,
}

pub fn aot_function(f: TreeFn, config: AotConfig) -> AotFunction {
    AotFunction {
        f,
        config,
        cached: RefCell::new(None),
    }
}

impl AotFunction {
    pub fn config(&self) -> &AotConfig {
        &self.config
    }

    pub fn is_compiled(&self) -> bool {
        self.cached.borrow().is_some()
    }

    fn compile(&self, flat_args: &[Value<Tensor>], in_spec: TreeSpec) -> Result<Rc<Cached>, Error> {
        let out_spec = Rc::new(RefCell::new(None));
        let flat = {
            let f = self.f.clone();
            let in_spec = in_spec.clone();
            let out_spec = out_spec.clone();
            flat_fn(move |cx, args| {
                let tree = tree_unflatten(args.to_vec(), &in_spec)?;
                let (outs, spec) = tree_flatten(f(cx, tree)?);
                let mut recorded = out_spec.borrow_mut();
                match &*recorded {
                    Some(existing) if *existing != spec => {
                        return Err(Error::Invariant(
                            "the function returned differently structured results when traced \
                             again"
                                .to_owned(),
                        ))
                    }
                    Some(_) => {}
                    None => *recorded = Some(spec),
                }
                Ok(outs)
            })
        };
        let compiled = create_aot_dispatcher_function(flat, flat_args, &self.config)?;
        Ok(Rc::new(Cached {
            compiled,
            in_spec,
            out_spec,
        }))
    }

    pub fn call(&self, args: Tree<Value<Tensor>>) -> Result<Tree<Value<Tensor>>, Error> {
        let (flat_args, in_spec) = tree_flatten(args);
        let existing = self.cached.borrow().clone();
        let cached = match existing {
            Some(cached) => {
                if cached.in_spec != in_spec {
                    return Err(Error::GuardViolation(
                        "the compiled function was called with differently structured arguments"
                            .to_owned(),
                    ));
                }
                cached
            }
            None => {
                debug!("compiling aot function {} on first call", self.config.aot_id);
                let cached = self.compile(&flat_args, in_spec)?;
                *self.cached.borrow_mut() = Some(cached.clone());
                cached
            }
        };
        let outs = (cached.compiled)(flat_args)?;
        let out_spec = cached
            .out_spec
            .borrow()
            .clone()
            .ok_or_else(|| Error::Invariant("the output structure was never recorded".to_owned()))?;
        tree_unflatten(outs, &out_spec)
    }
}

pub type ModuleFn =
    Rc<dyn Fn(&mut dyn Interpreter, &[Val], Tree<Val>) -> Result<Tree<Val>, Error>>;

/// Named parameters and buffers, and a forward function receiving them (parameters first) ahead of
/// its inputs.
#[derive(Clone)]
pub struct Module {
    pub params: Vec<(String, Tensor)>,
    pub buffers: Vec<(String, Tensor)>,
    pub forward: ModuleFn,
}

impl Module {
    pub fn params_and_buffers(&self) -> Vec<Value<Tensor>> {
        self.params
            .iter()
            .chain(&self.buffers)
            .map(|(_, t)| Value::Tensor(t.clone()))
            .collect()
    }
}

pub struct AotModule {
    inner: AotFunction,
    params_and_buffers: Vec<Value<Tensor>>,
}

/// Compiles `module` on its first call. Parameters and buffers are passed to the compiled function
/// as its leading arguments.
pub fn aot_module(module: &Module, mut config: AotConfig) -> AotModule {
    let params_and_buffers = module.params_and_buffers();
    config.num_params_buffers = params_and_buffers.len();
    let forward = module.forward.clone();
    let f = tree_fn(move |cx, tree| {
        let mut parts = tree.into_list()?.into_iter();
        let (Some(params), Some(inputs)) = (parts.next(), parts.next()) else {
            return Err(Error::Invariant(
                "module arguments must be parameters followed by inputs".to_owned(),
            ));
        };
        let params = params
            .into_list()?
            .into_iter()
            .map(Tree::into_leaf)
            .collect::<Result<Vec<_>, _>>()?;
        forward(cx, &params, inputs)
    });
    AotModule {
        inner: aot_function(f, config),
        params_and_buffers,
    }
}

impl AotModule {
    pub fn call(&self, inputs: Tree<Value<Tensor>>) -> Result<Tree<Value<Tensor>>, Error> {
        let params = Tree::list(self.params_and_buffers.iter().cloned());
        self.inner.call(Tree::List(vec![params, inputs]))
    }
}

/// Compiles `module` for flat positional inputs like `example_inputs`, right away and without
/// caching. The returned function takes only the inputs.
pub fn aot_module_simplified(
    module: &Module,
    example_inputs: &[Value<Tensor>],
    mut config: AotConfig,
) -> Result<CompiledFn, Error> {
    let params_and_buffers = module.params_and_buffers();
    let num_params_buffers = params_and_buffers.len();
    config.num_params_buffers = num_params_buffers;

    let forward = module.forward.clone();
    let flat = flat_fn(move |cx, args| {
        let (params, inputs) = args.split_at(num_params_buffers);
        let out = forward(cx, params, Tree::list(inputs.iter().cloned()))?;
        Ok(tree_flatten(out).0)
    });

    let mut full_args = params_and_buffers.clone();
    full_args.extend_from_slice(example_inputs);
    let compiled = create_aot_dispatcher_function(flat, &full_args, &config)?;
    Ok(Rc::new(move |inputs: Vec<Value<Tensor>>| {
        let mut args = params_and_buffers.clone();
        args.extend(inputs);
        compiled(args)
    }))
}
