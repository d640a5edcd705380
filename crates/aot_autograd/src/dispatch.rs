//! Compiling a flat function once its arguments are free of duplicates and merged aliases.

use std::rc::Rc;

use log::{debug, info};

use aot_tensor::autograd::{enable_grad, is_grad_enabled, no_grad};
use aot_tensor::{Error, FlatFn, Tensor, TensorMeta, Value};
use aot_trace::joint::differentiate;
use aot_trace::pretty_print::graph_to_string;

use crate::bridge::create_compiled_function;
use crate::compile_context::track_graph_compiling;
use crate::compiler::CompiledFn;
use crate::config::AotConfig;
use crate::graph_builder::{
    assert_functional_graph, assert_input_copies, create_functionalized_graph,
    fn_input_mutations_to_outputs, fn_prepped_for_autograd,
};
use crate::meta::ViewAndMutationMeta;
use crate::runtime_wrapper::{create_runtime_wrapper, plain_outputs};

/// Whether compiling for `args` needs a backward pass.
pub fn needs_autograd(args: &[Value<Tensor>]) -> bool {
    is_grad_enabled()
        && args
            .iter()
            .any(|arg| arg.as_tensor().map_or(false, Tensor::requires_grad))
}

fn example_metas(args: &[Value<Tensor>]) -> Vec<Value<TensorMeta>> {
    args.iter().map(|arg| arg.as_ref().map(Tensor::meta)).collect()
}

/// Compiles a function which needs no backward pass.
pub fn aot_dispatch_base(
    flat_fn: FlatFn,
    args: &[Value<Tensor>],
    config: &AotConfig,
    meta: ViewAndMutationMeta,
) -> Result<CompiledFn, Error> {
    let meta = Rc::new(meta);
    let wrapped = fn_input_mutations_to_outputs(flat_fn, meta.clone());
    let graph = create_functionalized_graph(&wrapped, args, &meta, config, false)?;

    let copy_count = assert_input_copies(&graph, &meta)?;
    let graph = graph.eliminate_dead_code();
    let copy_count_after = assert_functional_graph(&graph, meta.keep_input_mutations)?;
    if copy_count != copy_count_after {
        return Err(Error::Invariant(format!(
            "dead code elimination changed the number of input copies from {} to {}",
            copy_count, copy_count_after
        )));
    }

    let compiled = {
        let _ctx = track_graph_compiling(config.aot_id, "inference");
        (config.inference_compiler())(&graph, &example_metas(args))?
    };
    info!(
        "compiled inference graph of aot function {} ({} nodes)",
        config.aot_id,
        graph.len()
    );
    Ok(create_runtime_wrapper(plain_outputs(compiled), meta))
}

/// Compiles a function together with its backward pass.
pub fn aot_dispatch_autograd(
    flat_fn: FlatFn,
    args: &[Value<Tensor>],
    config: &AotConfig,
    meta: ViewAndMutationMeta,
) -> Result<CompiledFn, Error> {
    let meta = Rc::new(meta);
    let prepped = fn_prepped_for_autograd(flat_fn, meta.clone());
    let forward = {
        let _grad = enable_grad();
        create_functionalized_graph(&prepped, args, &meta, config, true)?
    };

    let primal_requires_grad: Vec<bool> = args
        .iter()
        .map(|arg| arg.as_tensor().map_or(false, Tensor::requires_grad))
        .collect();
    let joint = differentiate(
        &forward,
        &primal_requires_grad,
        &meta.tangent_mask(),
        &meta.traced_tangents,
    )?;
    assert_functional_graph(&joint, false)?;
    let joint = joint.eliminate_dead_code();
    debug!("joint graph:\n{}", graph_to_string(&joint));

    let (fw_graph, bw_graph) = {
        let _grad = no_grad();
        (config.partition_fn)(&joint, meta.num_forward_returns())?
    };

    let compiled_fw = {
        let _ctx = track_graph_compiling(config.aot_id, "forward");
        (config.fw_compiler)(&fw_graph, &example_metas(args))?
    };
    info!(
        "compiled forward graph of aot function {} ({} nodes, {} saved for backward)",
        config.aot_id,
        fw_graph.len(),
        fw_graph.outputs.len() - meta.num_forward_returns()
    );

    let compiled = create_compiled_function(
        compiled_fw,
        bw_graph,
        meta.clone(),
        config,
        primal_requires_grad,
    );
    Ok(create_runtime_wrapper(compiled, meta))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analyze::run_functionalized_fw_and_collect_metadata;
    use crate::compiler::interpreter_compiler;
    use aot_tensor::flat_fn;

    #[test]
    fn inference_path_mutates_inputs() {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            cx.mul_scalar_(x, 2.0)?;
            Ok(vec![Value::Tensor(cx.mul_scalar(x, 3.0)?)])
        });
        let x = Tensor::from_vec(&[3], vec![1.0, 2.0, 3.0]).unwrap();
        let args = vec![Value::Tensor(x.clone())];
        let config = AotConfig::new(interpreter_compiler());
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
        assert!(!needs_autograd(&args));

        let compiled = aot_dispatch_base(f, &args, &config, meta).unwrap();
        let outs = compiled(args).unwrap();
        assert_eq!(x.to_vec(), vec![2.0, 4.0, 6.0]);
        assert_eq!(outs[0].tensor().unwrap().to_vec(), vec![6.0, 12.0, 18.0]);
    }

    #[test]
    fn autograd_path_produces_gradients() {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            let y = cx.sin(x)?;
            Ok(vec![Value::Tensor(cx.mul_scalar(y, 2.0)?)])
        });
        let x = Tensor::from_vec(&[2], vec![0.0, 1.0]).unwrap();
        x.set_requires_grad(true).unwrap();
        let args = vec![Value::Tensor(x.clone())];
        let config = AotConfig::new(interpreter_compiler());
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
        assert!(needs_autograd(&args));

        let compiled = aot_dispatch_autograd(f, &args, &config, meta).unwrap();
        let out = compiled(args).unwrap()[0].tensor().unwrap();
        assert!(out.requires_grad());
        let grads = aot_tensor::autograd::grad(
            &[out],
            &[Some(Tensor::from_vec(&[2], vec![1.0, 1.0]).unwrap())],
            &[x],
            false,
        )
        .unwrap();
        let grad = grads[0].as_ref().unwrap().to_vec();
        assert!((grad[0] - 2.0).abs() < 1e-9);
        assert!((grad[1] - 2.0 * 1.0f64.cos()).abs() < 1e-9);
    }
}
