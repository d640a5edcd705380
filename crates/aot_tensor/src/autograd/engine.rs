use std::rc::Rc;

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::autograd::{Edge, GradMode, GradNode};
use crate::dispatch;
use crate::error::Error;
use crate::op::Op;
use crate::tensor::Tensor;
use crate::value::Value;

struct Task {
    node: Rc<dyn GradNode>,
    edges: Vec<Option<Edge>>,
    buffer: Vec<Option<Tensor>>,
    dependencies: usize,
}

fn accumulate(slot: &mut Option<Tensor>, grad: Tensor) -> Result<(), Error> {
    *slot = Some(match slot.take() {
        None => grad,
        Some(prev) => {
            dispatch::call(&Op::Add, &[Value::Tensor(prev), Value::Tensor(grad)])?.tensor()?
        }
    });
    Ok(())
}

fn discover(roots: &[Edge]) -> FxHashMap<usize, Task> {
    let mut tasks = FxHashMap::default();
    let mut stack: Vec<Edge> = roots.to_vec();
    while let Some(edge) = stack.pop() {
        let key = edge.node_key();
        if tasks.contains_key(&key) {
            continue;
        }
        let edges = edge.node.next_edges();
        stack.extend(edges.iter().flatten().cloned());
        tasks.insert(
            key,
            Task {
                buffer: vec![None; edge.node.num_inputs()],
                node: edge.node,
                edges,
                dependencies: 0,
            },
        );
    }

    let children: Vec<usize> = tasks
        .values()
        .flat_map(|task| task.edges.iter().flatten().map(Edge::node_key))
        .collect();
    for child in children {
        if let Some(task) = tasks.get_mut(&child) {
            task.dependencies += 1;
        }
    }
    tasks
}

/// Whether some node strictly below `key` is a capture target.
fn leads_to_target(
    key: usize,
    tasks: &FxHashMap<usize, Task>,
    targets: &FxHashSet<usize>,
    memo: &mut FxHashMap<usize, bool>,
) -> bool {
    if let Some(&known) = memo.get(&key) {
        return known;
    }
    let mut result = false;
    if let Some(task) = tasks.get(&key) {
        for child in task.edges.iter().flatten().map(Edge::node_key) {
            if targets.contains(&child) || leads_to_target(child, tasks, targets, memo) {
                result = true;
                break;
            }
        }
    }
    memo.insert(key, result);
    result
}

/// Runs the backward graph reachable from `roots`. When `captures` is non-empty, returns the
/// gradient arriving at each captured edge and skips all work that cannot reach one.
fn execute(
    roots: Vec<(Edge, Tensor)>,
    captures: &[Edge],
    create_graph: bool,
) -> Result<Vec<Option<Tensor>>, Error> {
    let _mode = GradMode::set(create_graph);

    let root_edges: Vec<Edge> = roots.iter().map(|(edge, _)| edge.clone()).collect();
    let mut tasks = discover(&root_edges);

    let mut capture_slots: FxHashMap<(usize, usize), Vec<usize>> = FxHashMap::default();
    for (i, edge) in captures.iter().enumerate() {
        capture_slots
            .entry((edge.node_key(), edge.input_nr))
            .or_default()
            .push(i);
    }
    let targets: FxHashSet<usize> = captures.iter().map(Edge::node_key).collect();
    let mut memo = FxHashMap::default();
    let needed: FxHashSet<usize> = if captures.is_empty() {
        tasks.keys().copied().collect()
    } else {
        let keys: Vec<usize> = tasks.keys().copied().collect();
        keys.into_iter()
            .filter(|&key| leads_to_target(key, &tasks, &targets, &mut memo))
            .collect()
    };
    trace!(
        "backward pass over {} of {} reachable nodes (create_graph: {})",
        needed.len(),
        tasks.len(),
        create_graph
    );

    for (edge, grad) in roots {
        if let Some(task) = tasks.get_mut(&edge.node_key()) {
            accumulate(&mut task.buffer[edge.input_nr], grad)?;
        }
    }

    let mut results: Vec<Option<Tensor>> = vec![None; captures.len()];
    let mut ready: Vec<usize> = tasks
        .iter()
        .filter(|(_, task)| task.dependencies == 0)
        .map(|(&key, _)| key)
        .collect();
    ready.sort_unstable();

    while let Some(key) = ready.pop() {
        let (node, edges, buffer) = match tasks.get_mut(&key) {
            Some(task) => (
                task.node.clone(),
                task.edges.clone(),
                std::mem::take(&mut task.buffer),
            ),
            None => continue,
        };

        for (input_nr, grad) in buffer.iter().enumerate() {
            if let (Some(slots), Some(grad)) = (capture_slots.get(&(key, input_nr)), grad) {
                for &slot in slots {
                    accumulate(&mut results[slot], grad.clone())?;
                }
            }
        }

        let outputs = if needed.contains(&key) && buffer.iter().any(Option::is_some) {
            let outputs = node.apply(buffer)?;
            if outputs.len() != edges.len() {
                return Err(Error::Invariant(format!(
                    "{} produced {} gradients for {} edges",
                    node.name(),
                    outputs.len(),
                    edges.len()
                )));
            }
            outputs
        } else {
            vec![None; edges.len()]
        };

        for (edge, grad) in edges.into_iter().zip(outputs) {
            let Some(edge) = edge else { continue };
            let child_key = edge.node_key();
            let Some(child) = tasks.get_mut(&child_key) else {
                continue;
            };
            if let Some(grad) = grad {
                accumulate(&mut child.buffer[edge.input_nr], grad)?;
            }
            child.dependencies -= 1;
            if child.dependencies == 0 {
                ready.push(child_key);
            }
        }
    }

    Ok(results)
}

fn seed_roots(
    op: &'static str,
    outputs: &[Tensor],
    grad_outputs: &[Option<Tensor>],
) -> Result<Vec<(Edge, Tensor)>, Error> {
    if outputs.len() != grad_outputs.len() {
        return Err(Error::invalid(
            op,
            format!(
                "got {} outputs but {} gradients for them",
                outputs.len(),
                grad_outputs.len()
            ),
        ));
    }

    let mut roots = Vec::new();
    for (i, (output, grad)) in outputs.iter().zip(grad_outputs).enumerate() {
        let edge = output.grad_edge().ok_or_else(|| {
            Error::invalid(
                op,
                format!("element {} of outputs does not require grad", i),
            )
        })?;
        let grad = match grad {
            Some(grad) => grad.clone(),
            None if output.numel() == 1 => Tensor::full(&output.sizes(), 1.0, output.dtype()),
            None => {
                return Err(Error::invalid(
                    op,
                    "a gradient can only be created implicitly for outputs with one element",
                ))
            }
        };
        roots.push((edge, grad));
    }
    Ok(roots)
}

/// Accumulates gradients of `outputs` into the `.grad` of every leaf they depend on.
pub fn backward(outputs: &[Tensor], grad_outputs: &[Option<Tensor>]) -> Result<(), Error> {
    let roots = seed_roots("backward", outputs, grad_outputs)?;
    execute(roots, &[], false)?;
    Ok(())
}

/// Gradients of `outputs` with respect to `inputs`, without touching any `.grad`.
///
/// Inputs the outputs do not depend on get `None`.
pub fn grad(
    outputs: &[Tensor],
    grad_outputs: &[Option<Tensor>],
    inputs: &[Tensor],
    create_graph: bool,
) -> Result<Vec<Option<Tensor>>, Error> {
    let roots = seed_roots("grad", outputs, grad_outputs)?;
    let captures = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            input.grad_edge().ok_or_else(|| {
                Error::invalid("grad", format!("input {} does not require grad", i))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    execute(roots, &captures, create_graph)
}

