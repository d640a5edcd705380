use id_collections::{id_type, IdVec};

use aot_tensor::{Error, Op, TensorMeta, Value};

#[id_type]
pub struct NodeId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaceholderRole {
    Primal,
    Tangent,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Placeholder { name: String, role: PlaceholderRole },
    Call(Op),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub args: Vec<NodeId>,
    pub meta: Value<TensorMeta>,
}

/// A straight-line program. Nodes only refer to earlier nodes, so node order is a topological
/// order.
#[derive(Clone, Debug)]
pub struct Graph {
    pub nodes: IdVec<NodeId, Node>,
    pub placeholders: Vec<NodeId>,
    pub outputs: Vec<Value<NodeId>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: IdVec::new(),
            placeholders: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_placeholder(
        &mut self,
        name: impl Into<String>,
        role: PlaceholderRole,
        meta: Value<TensorMeta>,
    ) -> NodeId {
        let id = self.nodes.push(Node {
            kind: NodeKind::Placeholder {
                name: name.into(),
                role,
            },
            args: Vec::new(),
            meta,
        });
        self.placeholders.push(id);
        id
    }

    pub fn add_call(&mut self, op: Op, args: Vec<NodeId>, meta: Value<TensorMeta>) -> NodeId {
        self.nodes.push(Node {
            kind: NodeKind::Call(op),
            args,
            meta,
        })
    }

    /// Adds a call whose output metadata is inferred from its arguments.
    pub fn add_call_inferred(&mut self, op: Op, args: Vec<NodeId>) -> Result<NodeId, Error> {
        let metas = args
            .iter()
            .map(|&arg| self.tensor_meta(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let meta = op.infer_meta(&metas)?;
        Ok(self.add_call(op, args, meta))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 0
    }

    pub fn tensor_meta(&self, id: NodeId) -> Result<&TensorMeta, Error> {
        self.nodes[id].meta.as_tensor().ok_or_else(|| {
            Error::Invariant(format!("node %{} does not produce a tensor", id.0))
        })
    }

    pub fn placeholder_metas(&self) -> Vec<Value<TensorMeta>> {
        self.placeholders
            .iter()
            .map(|&id| self.nodes[id].meta.clone())
            .collect()
    }

    pub fn calls(&self) -> impl Iterator<Item = (NodeId, &Op)> + '_ {
        self.nodes.iter().filter_map(|(id, node)| match &node.kind {
            NodeKind::Call(op) => Some((id, op)),
            NodeKind::Placeholder { .. } => None,
        })
    }

    /// Removes calls whose results are unused. Mutating calls are always kept.
    pub fn eliminate_dead_code(&self) -> Graph {
        let mut live = vec![false; self.nodes.len()];
        for out in &self.outputs {
            if let Value::Tensor(id) = out {
                live[id.0] = true;
            }
        }
        for (id, node) in self.nodes.iter() {
            if let NodeKind::Call(op) = &node.kind {
                if op.is_mutable() {
                    live[id.0] = true;
                }
            }
        }
        for index in (0..self.nodes.len()).rev() {
            if live[index] {
                for arg in &self.nodes[NodeId(index)].args {
                    live[arg.0] = true;
                }
            }
        }

        let mut result = Graph::new();
        let mut remap: Vec<Option<NodeId>> = vec![None; self.nodes.len()];
        for (id, node) in self.nodes.iter() {
            let keep = match node.kind {
                NodeKind::Placeholder { .. } => true,
                NodeKind::Call(_) => live[id.0],
            };
            if !keep {
                continue;
            }
            let args = node
                .args
                .iter()
                .map(|arg| remap[arg.0].unwrap_or(*arg))
                .collect();
            let new_id = result.nodes.push(Node {
                kind: node.kind.clone(),
                args,
                meta: node.meta.clone(),
            });
            if let NodeKind::Placeholder { .. } = node.kind {
                result.placeholders.push(new_id);
            }
            remap[id.0] = Some(new_id);
        }
        result.outputs = self
            .outputs
            .iter()
            .map(|out| out.clone().map(|id| remap[id.0].unwrap_or(id)))
            .collect();
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aot_tensor::DType;

    #[test]
    fn dead_code_is_removed_but_copies_are_kept() {
        let meta = Value::Tensor(TensorMeta::contiguous(&[2], DType::F32));
        let mut graph = Graph::new();
        let x = graph.add_placeholder("arg0_1", PlaceholderRole::Primal, meta.clone());
        graph.add_call_inferred(Op::Sin, vec![x]).unwrap();
        let doubled = graph.add_call_inferred(Op::MulScalar(2.0), vec![x]).unwrap();
        graph.add_call_inferred(Op::CopyInplace, vec![x, doubled]).unwrap();
        let out = graph.add_call_inferred(Op::Neg, vec![doubled]).unwrap();
        graph.outputs = vec![Value::Tensor(out), Value::Int(3)];

        let pruned = graph.eliminate_dead_code();
        assert_eq!(pruned.len(), graph.len() - 1);
        assert!(pruned.calls().all(|(_, op)| *op != Op::Sin));
        assert_eq!(pruned.placeholders.len(), 1);
        assert_eq!(pruned.outputs[1], Value::Int(3));
    }
}
