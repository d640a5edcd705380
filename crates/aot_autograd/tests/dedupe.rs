mod common;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use aot_autograd::analyze::check_rewritten_metadata;
use aot_autograd::dedupe::DupeMap;
use aot_autograd::entry::{AotFunction, TreeFn};
use aot_autograd::{aot_function, run_functionalized_fw_and_collect_metadata, tree_fn, Tree};
use aot_autograd::{InputAliasInfo, ViewAndMutationMeta};
use aot_tensor::tensor::TensorId;
use aot_tensor::{flat_fn, Error, Interpreter, TRef, Tensor, Value};

use common::*;

fn pair_fn(
    f: impl Fn(&mut dyn Interpreter, TRef, TRef) -> Result<TRef, Error> + 'static,
) -> TreeFn {
    tree_fn(move |cx, tree| {
        let mut args = tree.into_list()?.into_iter();
        let (Some(a), Some(b)) = (args.next(), args.next()) else {
            return Err(Error::Invariant("expected two arguments".to_owned()));
        };
        let out = f(cx, a.into_leaf()?.tensor()?, b.into_leaf()?.tensor()?)?;
        Ok(Tree::Leaf(Value::Tensor(out)))
    })
}

fn call_pair(f: &AotFunction, a: &Tensor, b: &Tensor) -> Result<Tensor, Error> {
    f.call(Tree::list([Value::Tensor(a.clone()), Value::Tensor(b.clone())]))?
        .into_leaf()?
        .tensor()
}

#[test]
fn unmutated_duplicates_receive_both_gradients() {
    init_logging();
    let compiled = aot_function(pair_fn(|cx, a, b| cx.mul(a, b)), config());
    let x = leaf(&[3], &[1.0, 2.0, 3.0]);
    let out = call_pair(&compiled, &x, &x).unwrap();
    assert_eq!(out.to_vec(), vec![1.0, 4.0, 9.0]);
    assert_close(&grad_of_sum(&out, &x), &[2.0, 4.0, 6.0]);

    // Nothing about the artifact assumed the arguments were the same tensor.
    let y = leaf(&[3], &[2.0, 2.0, 2.0]);
    let out = call_pair(&compiled, &x, &y).unwrap();
    assert_eq!(out.to_vec(), vec![2.0, 4.0, 6.0]);
}

#[test]
fn mutated_duplicates_behave_like_eager() {
    init_logging();
    let compiled = aot_function(
        pair_fn(|cx, a, b| {
            cx.mul_scalar_(a, 2.0)?;
            cx.add(a, b)
        }),
        config(),
    );
    let x = tensor(&[3], &[1.0, 2.0, 3.0]);
    let out = call_pair(&compiled, &x, &x).unwrap();
    assert_eq!(x.to_vec(), vec![2.0, 4.0, 6.0]);
    assert_eq!(out.to_vec(), vec![4.0, 8.0, 12.0]);

    let y = tensor(&[3], &[1.0, 1.0, 1.0]);
    let err = call_pair(&compiled, &x, &y).unwrap_err();
    assert!(matches!(err, Error::GuardViolation(msg) if msg.contains("a duplicate of input 0")));
}

#[test]
fn removing_then_adding_duplicates_restores_the_arguments() {
    let mut gen = Pcg64Mcg::seed_from_u64(0xd0b1_e5a9);
    for _ in 0..50 {
        let num_distinct = gen.random_range(1..5);
        let pool: Vec<Tensor> = (0..num_distinct).map(|i| tensor(&[1], &[i as f64])).collect();
        let args: Vec<Value<Tensor>> = (0..gen.random_range(1..8))
            .map(|_| {
                if gen.random_bool(0.2) {
                    Value::Int(gen.random_range(0..10))
                } else {
                    Value::Tensor(pool[gen.random_range(0..num_distinct)].clone())
                }
            })
            .collect();

        let dupes = DupeMap::of(&args);
        let ids = |values: &[Value<Tensor>]| -> Vec<Option<TensorId>> {
            values.iter().map(|v| v.as_tensor().map(Tensor::id)).collect()
        };
        let deduped = dupes.remove_dupe_args(&args);
        assert_eq!(deduped.len(), dupes.num_unique());
        let mut distinct = ids(&deduped).into_iter().flatten().collect::<Vec<_>>();
        let num_tensors = distinct.len();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), num_tensors);

        assert_eq!(ids(&dupes.add_dupe_args(&deduped)), ids(&args));
    }
}

#[test]
fn inconsistent_rewritten_metadata_is_reported() {
    init_logging();
    let f = flat_fn(|cx, args| {
        let x = args[0].tensor()?;
        cx.mul_scalar_(x, 2.0)?;
        Ok(vec![Value::Tensor(cx.sin(x)?)])
    });
    let args = vec![Value::Tensor(tensor(&[2], &[0.0, 1.0]))];
    let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
    check_rewritten_metadata(&f, &args, &meta, false, "nothing").unwrap();

    let wrong = ViewAndMutationMeta::new(
        vec![InputAliasInfo {
            is_leaf: true,
            mutates_data: false,
            mutates_metadata: false,
        }],
        meta.output_info.clone(),
        meta.requires_grad_info[1..].to_vec(),
        meta.num_intermediate_bases,
        meta.keep_input_mutations,
        meta.traced_tangents[1..].to_vec(),
    );
    let err = check_rewritten_metadata(&f, &args, &wrong, false, "a broken rewrite").unwrap_err();
    assert!(matches!(err, Error::SelfCheck(msg) if msg.starts_with("after a broken rewrite")));
}
