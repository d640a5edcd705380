//! Backend compilers and the boxed calling convention.
//!
//! A compiled function takes ownership of its whole argument list ("boxed"), so it may release
//! arguments as soon as it no longer needs them.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use aot_tensor::{Error, Tensor, TensorMeta, Value};
use aot_trace::pretty_print::graph_to_string;
use aot_trace::run_graph::run_graph;
use aot_trace::Graph;

use crate::compile_context::get_aot_graph_name;

pub type CompiledFn = Rc<dyn Fn(Vec<Value<Tensor>>) -> Result<Vec<Value<Tensor>>, Error>>;

/// Turns a graph, plus the metadata of the arguments it will be called with, into a function.
pub type Compiler = Rc<dyn Fn(&Graph, &[Value<TensorMeta>]) -> Result<CompiledFn, Error>>;

/// Adapts a function over borrowed arguments to the boxed convention.
pub fn make_boxed_func(
    f: impl Fn(&[Value<Tensor>]) -> Result<Vec<Value<Tensor>>, Error> + 'static,
) -> CompiledFn {
    Rc::new(move |args: Vec<Value<Tensor>>| f(&args))
}

/// Adapts a compiler producing functions over borrowed arguments to the boxed convention.
pub fn make_boxed_compiler<F>(
    compiler: impl Fn(&Graph, &[Value<TensorMeta>]) -> Result<F, Error> + 'static,
) -> Compiler
where
    F: Fn(&[Value<Tensor>]) -> Result<Vec<Value<Tensor>>, Error> + 'static,
{
    Rc::new(move |graph: &Graph, metas: &[Value<TensorMeta>]| {
        Ok(make_boxed_func(compiler(graph, metas)?))
    })
}

/// Compiles a graph by interpreting it.
pub fn interpreter_compiler() -> Compiler {
    Rc::new(|graph: &Graph, _metas: &[Value<TensorMeta>]| {
        debug!(
            "compiling {}:\n{}",
            get_aot_graph_name().unwrap_or_else(|| "graph".to_owned()),
            graph_to_string(graph)
        );
        let graph = Rc::new(graph.clone());
        let compiled: CompiledFn = Rc::new(move |args| run_graph(&graph, args));
        Ok(compiled)
    })
}

/// Graphs handed to a [`recording_compiler`], with the compile-context name they were compiled
/// under.
#[derive(Clone, Default)]
pub struct GraphSink {
    graphs: Rc<RefCell<Vec<(String, Graph)>>>,
}

impl GraphSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graphs(&self) -> Vec<(String, Graph)> {
        self.graphs.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.graphs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.borrow().is_empty()
    }

    pub fn last(&self) -> Option<Graph> {
        self.graphs.borrow().last().map(|(_, graph)| graph.clone())
    }
}

/// Records every graph into `sink`, then compiles it with `inner`.
pub fn recording_compiler(sink: &GraphSink, inner: Compiler) -> Compiler {
    let sink = sink.clone();
    Rc::new(move |graph: &Graph, metas: &[Value<TensorMeta>]| {
        let name = get_aot_graph_name().unwrap_or_else(|| "graph".to_owned());
        sink.graphs.borrow_mut().push((name, graph.clone()));
        inner(graph, metas)
    })
}
