use aot_tensor::dispatch;
use aot_tensor::{Error, Tensor, Value};

use crate::graph::{Graph, NodeKind};

/// Executes `graph` eagerly.
pub fn run_graph(graph: &Graph, args: Vec<Value<Tensor>>) -> Result<Vec<Value<Tensor>>, Error> {
    if args.len() != graph.placeholders.len() {
        return Err(Error::invalid(
            "graph",
            format!(
                "expected {} arguments, found {}",
                graph.placeholders.len(),
                args.len()
            ),
        ));
    }

    let mut env: Vec<Option<Value<Tensor>>> = vec![None; graph.len()];
    for (&placeholder, arg) in graph.placeholders.iter().zip(args) {
        env[placeholder.0] = Some(arg);
    }

    let missing =
        |index: usize| Error::Invariant(format!("node %{} used before definition", index));

    for (id, node) in graph.nodes.iter() {
        let NodeKind::Call(op) = &node.kind else {
            continue;
        };
        let args = node
            .args
            .iter()
            .map(|arg| env[arg.0].clone().ok_or_else(|| missing(arg.0)))
            .collect::<Result<Vec<_>, _>>()?;
        env[id.0] = Some(dispatch::call(op, &args)?);
    }

    graph
        .outputs
        .iter()
        .map(|out| match out {
            Value::Tensor(id) => env[id.0].clone().ok_or_else(|| missing(id.0)),
            other => Ok(other.scalar().unwrap_or(Value::None)),
        })
        .collect()
}
