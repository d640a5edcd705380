//! Reverse-mode differentiation of traced graphs.

use aot_tensor::derivatives::{vjp, Emit};
use aot_tensor::{Error, Op, TensorMeta, Value};

use crate::graph::{Graph, NodeId, NodeKind, PlaceholderRole};

struct GraphEmit<'a> {
    graph: &'a mut Graph,
}

impl Emit for GraphEmit<'_> {
    type Handle = NodeId;

    fn emit(&mut self, op: Op, args: &[NodeId]) -> Result<NodeId, Error> {
        self.graph.add_call_inferred(op, args.to_vec())
    }

    fn meta(&self, handle: &NodeId) -> Result<TensorMeta, Error> {
        self.graph.tensor_meta(*handle).cloned()
    }
}

fn accumulate(graph: &mut Graph, slot: &mut Option<NodeId>, grad: NodeId) -> Result<(), Error> {
    *slot = Some(match *slot {
        None => grad,
        Some(prev) => graph.add_call_inferred(Op::Add, vec![prev, grad])?,
    });
    Ok(())
}

/// Builds the joint graph `(primals..., tangents...) -> (outputs..., grads...)`.
///
/// One tangent placeholder is added per output selected by `tangent_mask`, with metadata taken in
/// order from `tangent_metas`. Only selected outputs which depend differentiably on a primal
/// requiring grad are seeded. There is one gradient output per primal, `None` when the primal
/// does not require grad or receives no gradient.
pub fn differentiate(
    forward: &Graph,
    primal_requires_grad: &[bool],
    tangent_mask: &[bool],
    tangent_metas: &[TensorMeta],
) -> Result<Graph, Error> {
    if primal_requires_grad.len() != forward.placeholders.len()
        || tangent_mask.len() != forward.outputs.len()
    {
        return Err(Error::Invariant(format!(
            "graph with {} inputs and {} outputs differentiated with {} input flags and {} \
             output flags",
            forward.placeholders.len(),
            forward.outputs.len(),
            primal_requires_grad.len(),
            tangent_mask.len()
        )));
    }

    let num_forward_nodes = forward.len();
    let mut joint = forward.clone();

    let mut seeds = Vec::new();
    let mut metas = tangent_metas.iter();
    for (out, _) in forward
        .outputs
        .iter()
        .zip(tangent_mask)
        .filter(|(_, &needs_tangent)| needs_tangent)
    {
        let meta = metas.next().ok_or_else(|| {
            Error::Invariant("fewer tangents than outputs needing them".to_owned())
        })?;
        let tangent = joint.add_placeholder(
            format!("tangents_{}", seeds.len() + 1),
            PlaceholderRole::Tangent,
            Value::Tensor(meta.clone()),
        );
        seeds.push((out.as_tensor().copied(), tangent));
    }
    if metas.next().is_some() {
        return Err(Error::Invariant(
            "more tangents than outputs needing them".to_owned(),
        ));
    }

    let mut requires_grad = vec![false; num_forward_nodes];
    for (&placeholder, &flag) in forward.placeholders.iter().zip(primal_requires_grad) {
        requires_grad[placeholder.0] = flag && forward.node(placeholder).meta.is_tensor();
    }
    for (id, node) in forward.nodes.iter() {
        if let NodeKind::Call(op) = &node.kind {
            requires_grad[id.0] =
                op.is_differentiable() && node.args.iter().any(|arg| requires_grad[arg.0]);
        }
    }

    let mut grads: Vec<Option<NodeId>> = vec![None; num_forward_nodes];
    for (out, tangent) in seeds {
        if let Some(out) = out {
            if requires_grad[out.0] {
                accumulate(&mut joint, &mut grads[out.0], tangent)?;
            }
        }
    }

    for index in (0..num_forward_nodes).rev() {
        let Some(grad) = grads[index] else { continue };
        let node = forward.node(NodeId(index));
        let NodeKind::Call(op) = &node.kind else {
            continue;
        };
        if !requires_grad[index] {
            continue;
        }
        let input_grads = vjp(&mut GraphEmit { graph: &mut joint }, op, &node.args, &grad)?;
        for (arg, input_grad) in node.args.iter().zip(input_grads) {
            if let Some(input_grad) = input_grad {
                if requires_grad[arg.0] {
                    accumulate(&mut joint, &mut grads[arg.0], input_grad)?;
                }
            }
        }
    }

    for (&placeholder, &flag) in forward.placeholders.iter().zip(primal_requires_grad) {
        joint.outputs.push(match grads[placeholder.0] {
            Some(grad) if flag => Value::Tensor(grad),
            _ => Value::None,
        });
    }
    Ok(joint)
}
