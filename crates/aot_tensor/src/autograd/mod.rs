//! Eager reverse-mode differentiation.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::error::Error;
use crate::tensor::Tensor;

pub mod engine;
pub mod nodes;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Restores the previous grad mode when dropped.
#[must_use]
pub struct GradMode {
    prev: bool,
}

impl GradMode {
    pub fn set(enabled: bool) -> Self {
        let prev = GRAD_ENABLED.with(|mode| mode.replace(enabled));
        GradMode { prev }
    }
}

impl Drop for GradMode {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|mode| mode.set(self.prev));
    }
}

pub fn no_grad() -> GradMode {
    GradMode::set(false)
}

pub fn enable_grad() -> GradMode {
    GradMode::set(true)
}

/// A node in the backward graph. `apply` maps one optional gradient per input of the node to one
/// optional gradient per edge returned by `next_edges`.
pub trait GradNode {
    fn name(&self) -> String;

    fn num_inputs(&self) -> usize {
        1
    }

    fn next_edges(&self) -> Vec<Option<Edge>>;

    fn apply(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error>;
}

#[derive(Clone)]
pub struct Edge {
    pub node: Rc<dyn GradNode>,
    pub input_nr: usize,
}

impl Edge {
    pub fn new(node: Rc<dyn GradNode>, input_nr: usize) -> Self {
        Edge { node, input_nr }
    }

    pub(crate) fn node_key(&self) -> usize {
        Rc::as_ptr(&self.node) as *const u8 as usize
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node.name(), self.input_nr)
    }
}

pub use engine::{backward, grad};
