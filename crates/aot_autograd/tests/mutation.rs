mod common;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use aot_autograd::{
    aot_function, interpreter_compiler, recording_compiler, tree_fn, GraphSink, Tree,
};
use aot_tensor::{flat_fn, run_eager, FlatFn, Op, Tensor, Value};

use common::*;

fn mul_then_scale() -> FlatFn {
    flat_fn(|cx, args| {
        let x = args[0].tensor()?;
        cx.mul_scalar_(x, 2.0)?;
        Ok(vec![Value::Tensor(cx.mul_scalar(x, 3.0)?)])
    })
}

fn call_flat(f: FlatFn, config: aot_autograd::AotConfig, args: &[Tensor]) -> Vec<Value<Tensor>> {
    let compiled = aot_function(
        tree_fn(move |cx, tree| {
            let args = tree
                .into_list()?
                .into_iter()
                .map(Tree::into_leaf)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Tree::list(f(cx, &args)?))
        }),
        config,
    );
    compiled
        .call(Tree::list(args.iter().cloned().map(Value::Tensor)))
        .unwrap()
        .into_list()
        .unwrap()
        .into_iter()
        .map(|leaf| leaf.into_leaf().unwrap())
        .collect()
}

#[test]
fn mutated_input_is_written_back() {
    init_logging();
    let x = tensor(&[3], &[1.0, 2.0, 3.0]);
    let outs = call_flat(mul_then_scale(), config(), &[x.clone()]);
    assert_eq!(x.to_vec(), vec![2.0, 4.0, 6.0]);
    assert_eq!(outs[0].tensor().unwrap().to_vec(), vec![6.0, 12.0, 18.0]);
}

#[test]
fn kept_inference_mutation_stays_in_graph() {
    init_logging();
    let sink = GraphSink::new();
    let mut config = config();
    config.keep_inference_input_mutations = true;
    config.fw_compiler = recording_compiler(&sink, interpreter_compiler());

    let x = tensor(&[3], &[1.0, 2.0, 3.0]);
    let outs = call_flat(mul_then_scale(), config, &[x.clone()]);
    assert_eq!(x.to_vec(), vec![2.0, 4.0, 6.0]);
    assert_eq!(outs[0].tensor().unwrap().to_vec(), vec![6.0, 12.0, 18.0]);

    let graph = sink.last().unwrap();
    assert_eq!(
        graph
            .calls()
            .filter(|(_, op)| matches!(op, Op::CopyInplace))
            .count(),
        1
    );
    // Only the user output is returned; the mutation happens inside the graph.
    assert_eq!(graph.outputs.len(), 1);
}

#[test]
fn returned_mutation_is_applied_by_the_wrapper() {
    init_logging();
    let sink = GraphSink::new();
    let mut config = config();
    config.fw_compiler = recording_compiler(&sink, interpreter_compiler());

    let x = tensor(&[3], &[1.0, 2.0, 3.0]);
    call_flat(mul_then_scale(), config, &[x.clone()]);
    assert_eq!(x.to_vec(), vec![2.0, 4.0, 6.0]);

    let graph = sink.last().unwrap();
    assert!(graph.calls().all(|(_, op)| !op.is_mutable()));
    assert_eq!(graph.outputs.len(), 2);
}

#[test]
fn mutation_of_non_leaf_is_differentiable() {
    init_logging();
    let x_leaf = leaf(&[3], &[1.0, 2.0, 3.0]);
    let x = non_leaf(&x_leaf);

    let sink = GraphSink::new();
    let mut config = config();
    config.bw_compiler = recording_compiler(&sink, interpreter_compiler());

    let outs = call_flat(mul_then_scale(), config, &[x.clone()]);
    let out = outs[0].tensor().unwrap();
    assert_eq!(x.to_vec(), vec![2.0, 4.0, 6.0]);
    assert_eq!(out.to_vec(), vec![6.0, 12.0, 18.0]);
    assert!(out.requires_grad());

    assert_close(&grad_of_sum(&out, &x_leaf), &[6.0, 6.0, 6.0]);

    // One tangent for the mutated input and one for the output.
    let (_, backward) = sink.graphs().pop().unwrap();
    let num_tangents = backward
        .placeholders
        .iter()
        .filter(|&&id| {
            matches!(
                &backward.node(id).kind,
                aot_trace::NodeKind::Placeholder {
                    role: aot_trace::PlaceholderRole::Tangent,
                    ..
                }
            )
        })
        .count();
    assert_eq!(num_tangents, 2);
}

#[test]
fn metadata_mutation_restrides_the_input() {
    init_logging();
    let f = flat_fn(|cx, args| {
        let x = args[0].tensor()?;
        cx.t_(x)?;
        Ok(vec![Value::Tensor(cx.mul_scalar(x, 2.0)?)])
    });
    let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    let expected_x = tensor(&[2, 3], &data);
    let expected = run_eager(&f, &[Value::Tensor(expected_x.clone())]).unwrap();

    let x = tensor(&[2, 3], &data);
    let storage = x.storage_key();
    let outs = call_flat(f, config(), &[x.clone()]);

    assert_eq!(x.sizes(), vec![3, 2]);
    assert_eq!(x.to_vec(), expected_x.to_vec());
    assert_eq!(x.storage_key(), storage);
    let out = outs[0].tensor().unwrap();
    let expected = expected[0].tensor().unwrap();
    assert_eq!(out.sizes(), expected.sizes());
    assert_eq!(out.to_vec(), expected.to_vec());
}

/// Compiling must not change what a function does: outputs and inputs afterwards match an eager
/// run on identical data.
#[test]
fn compiling_preserves_eager_behavior() {
    init_logging();
    let functions: Vec<FlatFn> = vec![
        mul_then_scale(),
        flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            let y = args[1].tensor()?;
            cx.add_(x, y)?;
            let s = cx.sin(x)?;
            Ok(vec![Value::Tensor(cx.mul(s, y)?)])
        }),
        flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            let y = args[1].tensor()?;
            let v = cx.slice(x, 0, 1, 3, 1)?;
            cx.mul_scalar_(v, -1.0)?;
            Ok(vec![Value::Tensor(cx.add(x, y)?), Value::Tensor(v)])
        }),
        flat_fn(|cx, args| {
            let y = args[1].tensor()?;
            cx.zero_(y)?;
            Ok(vec![Value::Tensor(cx.cos(args[0].tensor()?)?)])
        }),
    ];

    let mut gen = Pcg64Mcg::seed_from_u64(0x5eed_a07f);
    for (i, f) in functions.into_iter().enumerate() {
        for _ in 0..4 {
            let xs: Vec<f64> = (0..4).map(|_| gen.random_range(-2.0..2.0)).collect();
            let ys: Vec<f64> = (0..4).map(|_| gen.random_range(-2.0..2.0)).collect();

            let eager_args = [tensor(&[4], &xs), tensor(&[4], &ys)];
            let expected = run_eager(
                &f,
                &eager_args
                    .iter()
                    .cloned()
                    .map(Value::Tensor)
                    .collect::<Vec<_>>(),
            )
            .unwrap();

            let args = [tensor(&[4], &xs), tensor(&[4], &ys)];
            let found = call_flat(f.clone(), config(), &args);

            assert_eq!(found.len(), expected.len(), "function {}", i);
            for (a, b) in found.iter().zip(&expected) {
                let (a, b) = (a.tensor().unwrap(), b.tensor().unwrap());
                assert_eq!(a.sizes(), b.sizes(), "function {}", i);
                assert_close(&a.to_vec(), &b.to_vec());
            }
            for (a, b) in args.iter().zip(&eager_args) {
                assert_close(&a.to_vec(), &b.to_vec());
            }
        }
    }
}

#[test]
fn gradients_match_eager() {
    init_logging();
    let f = flat_fn(|cx, args| {
        let x = args[0].tensor()?;
        let y = args[1].tensor()?;
        let s = cx.sin(x)?;
        let p = cx.mul(s, y)?;
        Ok(vec![Value::Tensor(cx.add_scalar(p, 1.0)?)])
    });
    let xs = [0.5, -1.0, 2.0];
    let ys = [1.5, 0.25, -3.0];

    let (ex, ey) = (leaf(&[3], &xs), leaf(&[3], &ys));
    let expected = run_eager(&f, &[Value::Tensor(ex.clone()), Value::Tensor(ey.clone())])
        .unwrap()[0]
        .tensor()
        .unwrap();

    let (x, y) = (leaf(&[3], &xs), leaf(&[3], &ys));
    let out = call_flat(f, config(), &[x.clone(), y.clone()])[0]
        .tensor()
        .unwrap();

    assert_close(&out.to_vec(), &expected.to_vec());
    assert_eq!(out.requires_grad(), expected.requires_grad());
    assert_close(&grad_of_sum(&out, &x), &grad_of_sum(&expected, &ex));
    assert_close(&grad_of_sum(&out, &y), &grad_of_sum(&expected, &ey));
}
