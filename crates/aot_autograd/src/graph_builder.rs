//! Wrapping functions so their side effects become return values, and tracing them into
//! functional graphs.

use std::rc::Rc;

use log::trace;
use rustc_hash::FxHashSet;

use aot_tensor::{flat_fn, Error, FlatFn, Interpreter, Op, Tensor, Val, Value};
use aot_trace::functionalize::Functionalizer;
use aot_trace::{Graph, NodeId};

use crate::analyze::arg_name;
use crate::config::AotConfig;
use crate::meta::{OutputType, ViewAndMutationMeta};

fn check_output_count(meta: &ViewAndMutationMeta, outs: &[Val]) -> Result<(), Error> {
    if outs.len() != meta.num_outputs() {
        return Err(Error::Invariant(format!(
            "function returned {} outputs, but {} were seen when it was analyzed",
            outs.len(),
            meta.num_outputs()
        )));
    }
    Ok(())
}

/// Returns the inputs whose mutations the runtime must apply, followed by the outputs.
pub fn fn_input_mutations_to_outputs(f: FlatFn, meta: Rc<ViewAndMutationMeta>) -> FlatFn {
    flat_fn(move |cx, args| {
        let outs = f(cx, args)?;
        check_output_count(&meta, &outs)?;
        let mut returns: Vec<Val> = meta
            .mutated_inp_runtime_indices()
            .iter()
            .map(|&i| args[i].clone())
            .collect();
        returns.extend(outs);
        Ok(returns)
    })
}

/// Mutating an input that requires grad would make it a non-leaf of the traced graph, so a
/// mutated input is replaced by a copy (data) or an alias (metadata only) first.
fn maybe_to_fresh_input(
    cx: &mut dyn Interpreter,
    index: usize,
    arg: &Val,
    meta: &ViewAndMutationMeta,
) -> Result<Val, Error> {
    let Value::Tensor(t) = arg else {
        return Ok(arg.clone());
    };
    let Some(position) = meta.mutated_inp_indices().iter().position(|&i| i == index) else {
        return Ok(arg.clone());
    };
    if !meta.requires_grad_info[position] {
        return Ok(arg.clone());
    }
    let info = &meta.input_info[index];
    if info.mutates_data {
        return Ok(Value::Tensor(cx.clone(*t)?));
    }
    if info.mutates_metadata {
        return Ok(Value::Tensor(cx.alias(*t)?));
    }
    Ok(arg.clone())
}

/// Returns `(mutated inputs, outputs, intermediate bases)`, the layout the differentiation bridge
/// expects from the compiled forward.
pub fn fn_prepped_for_autograd(f: FlatFn, meta: Rc<ViewAndMutationMeta>) -> FlatFn {
    flat_fn(move |cx, args| {
        let args = args
            .iter()
            .enumerate()
            .map(|(i, arg)| maybe_to_fresh_input(cx, i, arg, &meta))
            .collect::<Result<Vec<_>, _>>()?;
        let outs = f(cx, &args)?;
        check_output_count(&meta, &outs)?;

        let mut returns: Vec<Val> = meta
            .mutated_inp_indices()
            .iter()
            .map(|&i| args[i].clone())
            .collect();
        let mut intermediate_bases = Vec::new();
        for (out, info) in outs.into_iter().zip(&meta.output_info) {
            match info.output_type {
                OutputType::UnsafeViewAlias => {
                    let t = out.tensor()?;
                    let sizes = cx.sizes(t);
                    returns.push(Value::Tensor(cx.unsafe_view(t, &sizes)?));
                }
                OutputType::AliasOfIntermediateKeptAsOutput => {
                    let base = cx.view_base(out.tensor()?).ok_or_else(|| {
                        Error::Invariant(
                            "an output aliasing an intermediate is no longer a view".to_owned(),
                        )
                    })?;
                    intermediate_bases.push(Value::Tensor(base.base));
                    returns.push(out);
                }
                _ => returns.push(out),
            }
        }
        if intermediate_bases.len() != meta.num_intermediate_bases {
            return Err(Error::Invariant(format!(
                "found {} intermediate bases, but {} were seen when the function was analyzed",
                intermediate_bases.len(),
                meta.num_intermediate_bases
            )));
        }
        returns.extend(intermediate_bases);
        Ok(returns)
    })
}

/// Traces `f` into a graph free of mutations.
///
/// Joint traces name their inputs `primals_{i}`. Otherwise, when `meta` keeps input mutations,
/// every input with a data-only mutation receives its final value through one trailing `copy_`.
pub fn create_functionalized_graph(
    f: &FlatFn,
    args: &[Value<Tensor>],
    meta: &ViewAndMutationMeta,
    config: &AotConfig,
    trace_joint: bool,
) -> Result<Graph, Error> {
    let mut fz = Functionalizer::new(config.decompositions.clone());
    let f_args: Vec<Val> = args
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            let name = if trace_joint {
                format!("primals_{}", i + 1)
            } else {
                arg_name(i)
            };
            fz.import(arg, &name)
        })
        .collect();
    let f_outs = f(&mut fz, &f_args)?;
    let outputs = fz.outputs(&f_outs)?;

    if meta.keep_input_mutations && !trace_joint {
        for (i, info) in meta.input_info.iter().enumerate() {
            if info.mutates_data && !info.mutates_metadata && args[i].is_tensor() {
                trace!("keeping the mutation of input {} in the graph", i);
                fz.copy_back_input(i)?;
            }
        }
    }
    Ok(fz.finish(outputs))
}

/// Checks that `graph` has no mutating operator, except (when allowed) at most one `copy_` into
/// each input. Returns the number of such copies.
pub fn assert_functional_graph(graph: &Graph, allow_input_mutations: bool) -> Result<usize, Error> {
    let mut placeholders: FxHashSet<NodeId> = graph.placeholders.iter().copied().collect();
    let mut copy_count = 0;
    for (id, op) in graph.calls() {
        if allow_input_mutations && *op == Op::CopyInplace {
            let target = graph.node(id).args[0];
            if !placeholders.remove(&target) {
                return Err(Error::NonFunctionalGraph(format!(
                    "a copy_ into %{} which is not an input, or was already copied into",
                    target.0
                )));
            }
            copy_count += 1;
        } else if op.is_mutable() {
            return Err(Error::NonFunctionalGraph(format!(
                "%{} = {}",
                id.0,
                op.name()
            )));
        }
    }
    Ok(copy_count)
}

/// Checks that an inference graph is functional apart from exactly one `copy_` per input whose
/// mutation `meta` keeps in the graph.
pub fn assert_input_copies(graph: &Graph, meta: &ViewAndMutationMeta) -> Result<usize, Error> {
    let copy_count = assert_functional_graph(graph, meta.keep_input_mutations)?;
    let expected = meta.num_kept_input_mutations();
    if copy_count != expected {
        return Err(Error::NonFunctionalGraph(format!(
            "found {} copies into inputs, but {} input mutations are kept in the graph",
            copy_count, expected
        )));
    }
    Ok(copy_count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analyze::run_functionalized_fw_and_collect_metadata;
    use crate::compiler::interpreter_compiler;
    use aot_trace::PlaceholderRole;

    fn mutate_and_scale() -> FlatFn {
        flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            cx.mul_scalar_(x, 2.0)?;
            Ok(vec![Value::Tensor(cx.mul_scalar(x, 3.0)?)])
        })
    }

    fn input() -> Vec<Value<Tensor>> {
        vec![Value::Tensor(
            Tensor::from_vec(&[3], vec![1.0, 2.0, 3.0]).unwrap(),
        )]
    }

    #[test]
    fn mutations_become_leading_outputs() {
        let f = mutate_and_scale();
        let args = input();
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
        let config = AotConfig::new(interpreter_compiler());
        let wrapped = fn_input_mutations_to_outputs(f, Rc::new(meta.clone()));
        let graph = create_functionalized_graph(&wrapped, &args, &meta, &config, false).unwrap();

        assert_eq!(assert_functional_graph(&graph, false).unwrap(), 0);
        assert_eq!(graph.outputs.len(), 2);
        let outs = aot_trace::run_graph::run_graph(&graph, args.clone()).unwrap();
        assert_eq!(outs[0].tensor().unwrap().to_vec(), vec![2.0, 4.0, 6.0]);
        assert_eq!(outs[1].tensor().unwrap().to_vec(), vec![6.0, 12.0, 18.0]);
        assert_eq!(args[0].tensor().unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn kept_mutations_end_in_one_copy() {
        let f = mutate_and_scale();
        let args = input();
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, true, false).unwrap();
        let config = AotConfig::new(interpreter_compiler());
        let wrapped = fn_input_mutations_to_outputs(f, Rc::new(meta.clone()));
        let graph = create_functionalized_graph(&wrapped, &args, &meta, &config, false).unwrap();

        assert_eq!(graph.outputs.len(), 1);
        assert_eq!(assert_functional_graph(&graph, true).unwrap(), 1);
        assert_eq!(assert_input_copies(&graph, &meta).unwrap(), 1);
        assert!(matches!(
            assert_functional_graph(&graph, false),
            Err(Error::NonFunctionalGraph(_))
        ));
    }

    #[test]
    fn kept_mutations_without_a_copy_are_rejected() {
        let f = mutate_and_scale();
        let args = input();
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, true, false).unwrap();

        let mut graph = Graph::new();
        let meta_x = args[0].as_ref().map(Tensor::meta);
        let x = graph.add_placeholder("arg0_1", PlaceholderRole::Primal, meta_x);
        let doubled = graph.add_call_inferred(Op::MulScalar(2.0), vec![x]).unwrap();
        let out = graph.add_call_inferred(Op::MulScalar(3.0), vec![doubled]).unwrap();
        graph.outputs = vec![Value::Tensor(out)];

        assert_eq!(assert_functional_graph(&graph, true).unwrap(), 0);
        assert!(matches!(
            assert_input_copies(&graph, &meta),
            Err(Error::NonFunctionalGraph(msg)) if msg.contains("1 input mutations are kept")
        ));
    }
}
