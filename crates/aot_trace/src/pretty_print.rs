use std::fmt::Write as _;
use std::io::{self, Write};

use aot_tensor::{Layout, Op, TensorMeta, Value, ViewOp};

use crate::graph::{Graph, NodeId, NodeKind};

fn node_name(graph: &Graph, id: NodeId) -> String {
    match &graph.node(id).kind {
        NodeKind::Placeholder { name, .. } => name.clone(),
        NodeKind::Call(_) => format!("%{}", id.0),
    }
}

fn layout_params(layout: &Layout) -> String {
    format!(
        "size={:?}, stride={:?}, offset={}",
        layout.sizes, layout.strides, layout.offset
    )
}

fn view_params(view: &ViewOp) -> String {
    match view {
        ViewOp::Reshape(sizes) | ViewOp::Expand(sizes) => format!("{:?}", sizes),
        ViewOp::Transpose(d0, d1) => format!("{}, {}", d0, d1),
        ViewOp::Slice {
            dim,
            start,
            end,
            step,
        } => format!("{}, {}, {}, {}", dim, start, end, step),
        ViewOp::Select { dim, index } => format!("{}, {}", dim, index),
        ViewOp::Unsqueeze(dim) => format!("{}", dim),
        ViewOp::AsStrided(layout) => layout_params(layout),
        ViewOp::Alias => String::new(),
        ViewOp::Reinterpret(dtype) => dtype.short_name().to_owned(),
    }
}

fn op_params(op: &Op) -> String {
    match op {
        Op::Full {
            sizes,
            value,
            dtype,
        } => format!("{:?}, {:?}, {}", sizes, value, dtype.short_name()),
        Op::AddScalar(s)
        | Op::MulScalar(s)
        | Op::AddScalarInplace(s)
        | Op::MulScalarInplace(s) => format!("{:?}", s),
        Op::View(view) => view_params(view),
        Op::UnsafeView(sizes) => format!("{:?}", sizes),
        Op::StridedScatter(layout) | Op::StridedGather(layout) | Op::AsStridedInplace(layout) => {
            layout_params(layout)
        }
        Op::StridedGradient { sizes, layout } => {
            format!("{:?}, {}", sizes, layout_params(layout))
        }
        Op::TransposeInplace(d0, d1) => format!("{}, {}", d0, d1),
        Op::UnsqueezeInplace(dim) | Op::Size(dim) => format!("{}", dim),
        _ => String::new(),
    }
}

fn meta_str(meta: &Value<TensorMeta>) -> String {
    match meta {
        Value::Tensor(meta) => meta.to_string(),
        other => format!("{:?}", other.kind()).to_lowercase(),
    }
}

pub fn write_graph(w: &mut impl Write, graph: &Graph) -> io::Result<()> {
    let params = graph
        .placeholders
        .iter()
        .map(|&id| format!("{}: {}", node_name(graph, id), meta_str(&graph.node(id).meta)))
        .collect::<Vec<_>>()
        .join(", ");
    writeln!(w, "graph({}):", params)?;

    for (id, node) in graph.nodes.iter() {
        let NodeKind::Call(op) = &node.kind else {
            continue;
        };
        let mut args = node
            .args
            .iter()
            .map(|&arg| node_name(graph, arg))
            .collect::<Vec<_>>()
            .join(", ");
        let params = op_params(op);
        if !params.is_empty() {
            if !args.is_empty() {
                args.push_str(", ");
            }
            args.push_str(&params);
        }
        writeln!(
            w,
            "    {} = {}({}) : {}",
            node_name(graph, id),
            op.name(),
            args,
            meta_str(&node.meta)
        )?;
    }

    let mut outputs = String::new();
    for (i, out) in graph.outputs.iter().enumerate() {
        if i > 0 {
            outputs.push_str(", ");
        }
        match out {
            Value::Tensor(id) => outputs.push_str(&node_name(graph, *id)),
            other => {
                let _ = write!(outputs, "{}", other.as_ref().map(|_| "?"));
            }
        }
    }
    writeln!(w, "    return ({})", outputs)?;
    Ok(())
}

pub fn graph_to_string(graph: &Graph) -> String {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_graph(&mut out, graph);
    String::from_utf8_lossy(&out).into_owned()
}
