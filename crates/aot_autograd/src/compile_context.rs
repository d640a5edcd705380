//! Naming of the graph currently being compiled.
//!
//! Compilations push the name of the graph they are compiling for the duration of a
//! [`GraphCompiling`] handle. The stack is per thread, so concurrent compilations on different
//! threads never observe each other's names. The graph counter and model name are process-wide.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use log::trace;
use once_cell::sync::Lazy;

static NTH_GRAPH: AtomicUsize = AtomicUsize::new(0);

static NEXT_AOT_ID: AtomicUsize = AtomicUsize::new(0);

static MODEL_NAME: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new("model".to_owned()));

thread_local! {
    static GRAPH_BEING_COMPILED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub fn next_aot_id() -> usize {
    NEXT_AOT_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn set_model_name(name: &str) {
    let mut model_name = MODEL_NAME.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *model_name = name.to_owned();
}

fn model_name() -> String {
    MODEL_NAME
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// The name of the graph currently being compiled on this thread, if any.
pub fn get_aot_graph_name() -> Option<String> {
    let name = GRAPH_BEING_COMPILED.with(|stack| stack.borrow().last().cloned())?;
    Some(format!(
        "{}__{}_{}",
        model_name(),
        name,
        NTH_GRAPH.load(Ordering::Relaxed)
    ))
}

/// Pops its graph name and advances the graph counter when dropped.
#[must_use]
pub struct GraphCompiling {
    depth: usize,
}

pub fn track_graph_compiling(aot_id: usize, graph_name: &str) -> GraphCompiling {
    let depth = GRAPH_BEING_COMPILED.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(format!("{}_{}", aot_id, graph_name));
        stack.len()
    });
    trace!("compiling {}", get_aot_graph_name().unwrap_or_default());
    GraphCompiling { depth }
}

impl Drop for GraphCompiling {
    fn drop(&mut self) {
        GRAPH_BEING_COMPILED.with(|stack| stack.borrow_mut().truncate(self.depth - 1));
        NTH_GRAPH.fetch_add(1, Ordering::Relaxed);
    }
}
