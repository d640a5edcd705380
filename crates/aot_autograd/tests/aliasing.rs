mod common;

use aot_autograd::{
    aot_function, run_functionalized_fw_and_collect_metadata, tree_fn, OutputType, Tree,
};
use aot_tensor::{flat_fn, run_eager, Error, FlatFn, Tensor, Value};

use common::*;

/// `(x.t(), (x * 2).view(-1))`
fn transpose_and_flattened_product() -> FlatFn {
    flat_fn(|cx, args| {
        let x = args[0].tensor()?;
        let out1 = cx.t(x)?;
        let tmp = cx.mul_scalar(x, 2.0)?;
        let out2 = cx.view(tmp, &[4])?;
        Ok(vec![Value::Tensor(out1), Value::Tensor(out2)])
    })
}

fn list_fn(f: FlatFn) -> aot_autograd::entry::TreeFn {
    tree_fn(move |cx, tree| {
        let args = tree
            .into_list()?
            .into_iter()
            .map(Tree::into_leaf)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Tree::list(f(cx, &args)?))
    })
}

fn leaves(tree: Tree<Value<Tensor>>) -> Vec<Tensor> {
    tree.into_list()
        .unwrap()
        .into_iter()
        .map(|leaf| leaf.into_leaf().unwrap().tensor().unwrap())
        .collect()
}

#[test]
fn views_of_inputs_and_intermediates_are_classified() {
    init_logging();
    let x = leaf(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let args = vec![Value::Tensor(x)];
    let meta = run_functionalized_fw_and_collect_metadata(
        &transpose_and_flattened_product(),
        &args,
        false,
        false,
    )
    .unwrap();

    let types: Vec<OutputType> = meta.output_info.iter().map(|o| o.output_type).collect();
    assert_eq!(
        types,
        vec![
            OutputType::AliasOfInput,
            OutputType::AliasOfIntermediateKeptAsOutput
        ]
    );
    assert_eq!(meta.output_info[0].base_idx, Some(0));
    assert_eq!(meta.output_info[1].base_idx, Some(0));
    assert_eq!(meta.num_intermediate_bases, 1);
    assert_eq!(meta.aliased_out_indices(), &[0, 1]);
}

#[test]
fn unsafe_view_outputs_return_fresh_tensors() {
    init_logging();
    let x = leaf(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let args = vec![Value::Tensor(x)];
    let meta = run_functionalized_fw_and_collect_metadata(
        &transpose_and_flattened_product(),
        &args,
        false,
        true,
    )
    .unwrap();
    assert_eq!(meta.output_info[1].output_type, OutputType::UnsafeViewAlias);
    assert_eq!(meta.output_info[1].base_idx, None);
    assert_eq!(meta.num_intermediate_bases, 0);
}

#[test]
fn aliases_are_regenerated_with_gradients() {
    init_logging();
    let x = leaf(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let compiled = aot_function(list_fn(transpose_and_flattened_product()), config());
    let outs = leaves(compiled.call(Tree::list([Value::Tensor(x.clone())])).unwrap());

    let (out1, out2) = (&outs[0], &outs[1]);
    assert_eq!(out1.sizes(), vec![2, 2]);
    assert_eq!(out1.to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    assert!(out1.is_view());
    assert_eq!(out1.storage_key(), x.storage_key());

    assert_eq!(out2.sizes(), vec![4]);
    assert_eq!(out2.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert!(out2.is_view());
    assert!(out2.requires_grad());

    assert_close(&grad_of_sum(out1, &x), &[1.0; 4]);
    assert_close(&grad_of_sum(out2, &x), &[2.0; 4]);
}

#[test]
fn outputs_sharing_an_intermediate_share_storage() {
    init_logging();
    let f = flat_fn(|cx, args| {
        let x = args[0].tensor()?;
        let tmp = cx.add_scalar(x, 1.0)?;
        let a = cx.view(tmp, &[4])?;
        let b = cx.t(tmp)?;
        Ok(vec![Value::Tensor(a), Value::Tensor(b)])
    });
    let x = leaf(&[2, 2], &[0.0, 1.0, 2.0, 3.0]);
    let compiled = aot_function(list_fn(f), config());
    let outs = leaves(compiled.call(Tree::list([Value::Tensor(x)])).unwrap());
    assert_eq!(outs[0].to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(outs[1].to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    assert_eq!(outs[0].storage_key(), outs[1].storage_key());
}

/// `a.mul_(2); return b + 1` where `b` may be a view of `a`.
fn mutate_first_read_second() -> aot_autograd::entry::TreeFn {
    list_fn(flat_fn(|cx, args| {
        let a = args[0].tensor()?;
        let b = args[1].tensor()?;
        cx.mul_scalar_(a, 2.0)?;
        Ok(vec![Value::Tensor(cx.add_scalar(b, 1.0)?)])
    }))
}

#[test]
fn aliased_inputs_see_each_others_mutations() {
    init_logging();
    let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = reshape(&a, &[4]);
    let compiled = aot_function(mutate_first_read_second(), config());
    let outs = leaves(
        compiled
            .call(Tree::list([Value::Tensor(a.clone()), Value::Tensor(b.clone())]))
            .unwrap(),
    );
    assert_eq!(a.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(b.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(outs[0].to_vec(), vec![3.0, 5.0, 7.0, 9.0]);
}

#[test]
fn aliased_inputs_are_differentiable() {
    init_logging();
    let x = leaf(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let a = non_leaf(&x);
    let b = reshape(&a, &[4]);
    let compiled = aot_function(mutate_first_read_second(), config());
    let outs = leaves(
        compiled
            .call(Tree::list([Value::Tensor(a.clone()), Value::Tensor(b)]))
            .unwrap(),
    );
    assert_eq!(outs[0].to_vec(), vec![3.0, 5.0, 7.0, 9.0]);
    assert_close(&grad_of_sum(&outs[0], &x), &[2.0; 4]);
}

#[test]
fn unaliased_arguments_take_the_plain_path() {
    init_logging();
    let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = tensor(&[4], &[1.0, 1.0, 1.0, 1.0]);
    let compiled = aot_function(mutate_first_read_second(), config());
    let outs = leaves(
        compiled
            .call(Tree::list([Value::Tensor(a.clone()), Value::Tensor(b.clone())]))
            .unwrap(),
    );
    assert_eq!(a.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(b.to_vec(), vec![1.0; 4]);
    assert_eq!(outs[0].to_vec(), vec![2.0; 4]);
}

#[test]
fn merged_artifact_rejects_unaliased_arguments() {
    init_logging();
    let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = reshape(&a, &[4]);
    let compiled = aot_function(mutate_first_read_second(), config());
    compiled
        .call(Tree::list([Value::Tensor(a), Value::Tensor(b)]))
        .unwrap();

    let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = tensor(&[4], &[0.0; 4]);
    let err = compiled
        .call(Tree::list([Value::Tensor(a), Value::Tensor(b)]))
        .unwrap_err();
    assert!(matches!(err, Error::GuardViolation(_)));
}

/// Functions returning a view which they mutated in place, with the sizes of their input.
fn mutated_views() -> Vec<(FlatFn, Vec<usize>)> {
    vec![
        (
            flat_fn(|cx, args| {
                let v = cx.slice(args[0].tensor()?, 0, 1, 3, 1)?;
                cx.add_scalar_(v, 10.0)?;
                Ok(vec![Value::Tensor(v)])
            }),
            vec![4],
        ),
        (
            flat_fn(|cx, args| {
                let v = cx.t(args[0].tensor()?)?;
                cx.mul_scalar_(v, 2.0)?;
                Ok(vec![Value::Tensor(v)])
            }),
            vec![2, 3],
        ),
        (
            flat_fn(|cx, args| {
                let tmp = cx.mul_scalar(args[0].tensor()?, 1.0)?;
                let v = cx.slice(tmp, 0, 2, 4, 1)?;
                cx.add_scalar_(v, 100.0)?;
                Ok(vec![Value::Tensor(v)])
            }),
            vec![4],
        ),
    ]
}

fn assert_same_tensor(found: &Tensor, expected: &Tensor, i: usize) {
    assert_eq!(found.layout(), expected.layout(), "function {}", i);
    assert_eq!(found.requires_grad(), expected.requires_grad(), "function {}", i);
    assert_close(&found.to_vec(), &expected.to_vec());
}

#[test]
fn mutated_views_match_eager() {
    init_logging();
    for (i, (f, sizes)) in mutated_views().into_iter().enumerate() {
        let data: Vec<f64> = (1..=sizes.iter().product::<usize>()).map(|v| v as f64).collect();

        let eager_x = tensor(&sizes, &data);
        let expected = run_eager(&f, &[Value::Tensor(eager_x.clone())]).unwrap()[0]
            .tensor()
            .unwrap();

        let x = tensor(&sizes, &data);
        let compiled = aot_function(list_fn(f), config());
        let outs = leaves(compiled.call(Tree::list([Value::Tensor(x.clone())])).unwrap());

        assert_same_tensor(&outs[0], &expected, i);
        assert_close(&x.to_vec(), &eager_x.to_vec());
    }
}

#[test]
fn mutated_views_are_differentiable() {
    init_logging();
    for (i, (f, sizes)) in mutated_views().into_iter().enumerate() {
        let data: Vec<f64> = (1..=sizes.iter().product::<usize>()).map(|v| v as f64).collect();

        let eager_leaf = leaf(&sizes, &data);
        let expected = run_eager(&f, &[Value::Tensor(non_leaf(&eager_leaf))]).unwrap()[0]
            .tensor()
            .unwrap();

        let x = leaf(&sizes, &data);
        let compiled = aot_function(list_fn(f), config());
        let outs = leaves(compiled.call(Tree::list([Value::Tensor(non_leaf(&x))])).unwrap());

        assert_same_tensor(&outs[0], &expected, i);
        assert_close(&grad_of_sum(&outs[0], &x), &grad_of_sum(&expected, &eager_leaf));
    }
}
