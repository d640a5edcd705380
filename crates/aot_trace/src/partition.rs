//! Splitting a joint graph into a forward and a backward graph.

use log::debug;

use aot_tensor::{Error, Value};

use crate::graph::{Graph, NodeId, NodeKind, PlaceholderRole};

fn role(graph: &Graph, id: NodeId) -> Option<PlaceholderRole> {
    match graph.node(id).kind {
        NodeKind::Placeholder { role, .. } => Some(role),
        NodeKind::Call(_) => None,
    }
}

fn remap(map: &[Option<NodeId>], id: NodeId) -> Result<NodeId, Error> {
    map[id.0].ok_or_else(|| {
        Error::Invariant(format!("node %{} is missing from its partition", id.0))
    })
}

fn remap_outputs(
    map: &[Option<NodeId>],
    outputs: &[Value<NodeId>],
) -> Result<Vec<Value<NodeId>>, Error> {
    outputs
        .iter()
        .map(|out| out.clone().try_map(|id| remap(map, id)))
        .collect()
}

/// Splits `joint`, whose first `num_fwd_outputs` outputs are the forward results and whose
/// remaining outputs are gradients.
///
/// The forward graph computes only what the forward results need, and additionally returns every
/// value the backward graph uses from it: `(primals...) -> (results..., saved...)`. The backward
/// graph is `(saved..., tangents...) -> (grads...)`.
pub fn default_partition(joint: &Graph, num_fwd_outputs: usize) -> Result<(Graph, Graph), Error> {
    if num_fwd_outputs > joint.outputs.len() {
        return Err(Error::Invariant(format!(
            "{} forward outputs requested from a joint graph with {} outputs",
            num_fwd_outputs,
            joint.outputs.len()
        )));
    }
    let (fwd_outputs, bwd_outputs) = joint.outputs.split_at(num_fwd_outputs);
    let n = joint.len();

    let mut in_forward = vec![false; n];
    for id in fwd_outputs.iter().filter_map(Value::as_tensor) {
        in_forward[id.0] = true;
    }
    for index in (0..n).rev() {
        if in_forward[index] {
            for arg in &joint.node(NodeId(index)).args {
                in_forward[arg.0] = true;
            }
            if role(joint, NodeId(index)) == Some(PlaceholderRole::Tangent) {
                return Err(Error::Invariant(
                    "a forward output depends on a tangent".to_owned(),
                ));
            }
        }
    }

    let mut saved = vec![false; n];
    let mut in_backward = vec![false; n];
    let mark = |id: NodeId, saved: &mut Vec<bool>, in_backward: &mut Vec<bool>| {
        if in_forward[id.0] || role(joint, id) == Some(PlaceholderRole::Primal) {
            saved[id.0] = true;
        } else {
            in_backward[id.0] = true;
        }
    };
    for &id in bwd_outputs.iter().filter_map(Value::as_tensor) {
        mark(id, &mut saved, &mut in_backward);
    }
    for index in (0..n).rev() {
        if in_backward[index] {
            for &arg in &joint.node(NodeId(index)).args {
                mark(arg, &mut saved, &mut in_backward);
            }
        }
    }
    let saved_ids: Vec<NodeId> = (0..n).filter(|&i| saved[i]).map(NodeId).collect();
    debug!(
        "partitioning joint graph of {} nodes: {} forward outputs, {} saved values",
        n,
        num_fwd_outputs,
        saved_ids.len()
    );

    let mut fw = Graph::new();
    let mut fw_map: Vec<Option<NodeId>> = vec![None; n];
    for (id, node) in joint.nodes.iter() {
        match &node.kind {
            NodeKind::Placeholder {
                name,
                role: PlaceholderRole::Primal,
            } => {
                fw_map[id.0] = Some(fw.add_placeholder(
                    name.clone(),
                    PlaceholderRole::Primal,
                    node.meta.clone(),
                ));
            }
            NodeKind::Call(op) if in_forward[id.0] => {
                let args = node
                    .args
                    .iter()
                    .map(|&arg| remap(&fw_map, arg))
                    .collect::<Result<_, _>>()?;
                fw_map[id.0] = Some(fw.add_call(op.clone(), args, node.meta.clone()));
            }
            _ => {}
        }
    }
    fw.outputs = remap_outputs(&fw_map, fwd_outputs)?;
    for &id in &saved_ids {
        fw.outputs.push(Value::Tensor(remap(&fw_map, id)?));
    }

    let mut bw = Graph::new();
    let mut bw_map: Vec<Option<NodeId>> = vec![None; n];
    for (i, &id) in saved_ids.iter().enumerate() {
        bw_map[id.0] = Some(bw.add_placeholder(
            format!("saved_{}", i + 1),
            PlaceholderRole::Primal,
            joint.node(id).meta.clone(),
        ));
    }
    for &id in &joint.placeholders {
        if let NodeKind::Placeholder {
            name,
            role: PlaceholderRole::Tangent,
        } = &joint.node(id).kind
        {
            bw_map[id.0] = Some(bw.add_placeholder(
                name.clone(),
                PlaceholderRole::Tangent,
                joint.node(id).meta.clone(),
            ));
        }
    }
    for (id, node) in joint.nodes.iter() {
        if let NodeKind::Call(op) = &node.kind {
            if in_backward[id.0] {
                let args = node
                    .args
                    .iter()
                    .map(|&arg| remap(&bw_map, arg))
                    .collect::<Result<_, _>>()?;
                bw_map[id.0] = Some(bw.add_call(op.clone(), args, node.meta.clone()));
            }
        }
    }
    bw.outputs = remap_outputs(&bw_map, bwd_outputs)?;

    Ok((fw, bw))
}
