//! Runs a function once under the functionalizing tracer and records how it aliases and mutates.

use log::{debug, trace};
use rustc_hash::FxHashMap;

use aot_tensor::storage::StorageKey;
use aot_tensor::{Error, FlatFn, Interpreter, Tensor, TensorMeta, Val, Value};
use aot_trace::decomp::DecompositionTable;
use aot_trace::functionalize::Functionalizer;

use crate::meta::{InputAliasInfo, OutputAliasInfo, OutputType, ViewAndMutationMeta};

/// Placeholder name of the `index`th argument of a traced function.
pub fn arg_name(index: usize) -> String {
    format!("arg{}_1", index)
}

/// Analyzes `f` on `args`.
///
/// With `unsafe_view_outputs` set, a grad-tracked view of an intermediate whose storage no other
/// output shares is classified `UnsafeViewAlias` instead of keeping its base as an extra output.
pub fn run_functionalized_fw_and_collect_metadata(
    f: &FlatFn,
    args: &[Value<Tensor>],
    keep_input_mutations: bool,
    unsafe_view_outputs: bool,
) -> Result<ViewAndMutationMeta, Error> {
    let mut fz = Functionalizer::new(DecompositionTable::default());
    let f_args: Vec<Val> = args
        .iter()
        .enumerate()
        .map(|(i, arg)| fz.import(arg, &arg_name(i)))
        .collect();
    let f_outs = f(&mut fz, &f_args)?;

    let mut input_info = Vec::with_capacity(args.len());
    let mut mutated_requires_grad = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        let is_leaf = arg.as_tensor().map_or(false, Tensor::is_leaf);
        let info = match fz.input_state(i) {
            Some(state) => {
                let info = InputAliasInfo {
                    is_leaf,
                    mutates_data: state.mutates_data,
                    mutates_metadata: state.mutates_metadata,
                };
                if info.is_mutated() {
                    mutated_requires_grad.push(state.requires_grad);
                }
                info
            }
            None => InputAliasInfo {
                is_leaf,
                mutates_data: false,
                mutates_metadata: false,
            },
        };
        input_info.push(info);
    }

    // Later inputs win, which only matters for inputs sharing a storage.
    let mut input_storages: FxHashMap<StorageKey, usize> = FxHashMap::default();
    let mut input_identities: FxHashMap<usize, usize> = FxHashMap::default();
    for i in 0..fz.num_inputs() {
        if let Some(state) = fz.input_state(i) {
            input_storages.insert(state.storage, i);
            input_identities.insert(state.identity, i);
        }
    }

    let mut out_infos = Vec::with_capacity(f_outs.len());
    let mut storage_counts: FxHashMap<StorageKey, usize> = FxHashMap::default();
    let mut output_identities: FxHashMap<usize, usize> = FxHashMap::default();
    for (i, out) in f_outs.iter().enumerate() {
        let info = match out {
            Value::Tensor(t) => Some(fz.info(*t)?),
            _ => None,
        };
        if let Some(info) = &info {
            *storage_counts.entry(info.storage).or_insert(0) += 1;
            output_identities.entry(info.identity).or_insert(i);
        }
        out_infos.push(info);
    }

    let mut output_info = Vec::with_capacity(f_outs.len());
    let mut output_requires_grad = Vec::with_capacity(f_outs.len());
    let mut base_slots: FxHashMap<usize, usize> = FxHashMap::default();
    let mut intermediate_bases = Vec::new();
    for (out, info) in f_outs.iter().zip(&out_infos) {
        let raw_type = out.kind();
        let Some(info) = info else {
            output_info.push(OutputAliasInfo::non_alias(raw_type));
            output_requires_grad.push(false);
            continue;
        };
        output_requires_grad.push(info.requires_grad);

        let (output_type, base_idx) = if let Some(&input_idx) = input_storages.get(&info.storage)
        {
            match input_identities.get(&info.identity) {
                Some(&same) => (OutputType::IsInput, Some(same)),
                None => (OutputType::AliasOfInput, Some(input_idx)),
            }
        } else {
            match info.base {
                Some((base_identity, true)) if info.requires_grad => {
                    if unsafe_view_outputs && storage_counts[&info.storage] == 1 {
                        (OutputType::UnsafeViewAlias, None)
                    } else if let Some(&out_idx) = output_identities.get(&base_identity) {
                        (
                            OutputType::AliasOfIntermediateThatIsAlsoUserOutput,
                            Some(out_idx),
                        )
                    } else if let Some(&slot) = base_slots.get(&base_identity) {
                        (OutputType::AliasOfIntermediate, Some(slot))
                    } else {
                        let slot = intermediate_bases.len();
                        let t = out.tensor()?;
                        let base = fz.view_base(t).ok_or_else(|| {
                            Error::Invariant("a view lost track of its base".to_owned())
                        })?;
                        base_slots.insert(base_identity, slot);
                        intermediate_bases.push(base.base);
                        (OutputType::AliasOfIntermediateKeptAsOutput, Some(slot))
                    }
                }
                _ => (OutputType::NonAlias, None),
            }
        };
        trace!("output classified as {:?} (base {:?})", output_type, base_idx);
        output_info.push(OutputAliasInfo {
            output_type,
            raw_type,
            base_idx,
        });
    }

    let contiguous = |meta: TensorMeta| TensorMeta::contiguous(meta.sizes(), meta.dtype);
    let mut traced_tangents = Vec::new();
    for (i, info) in input_info.iter().enumerate() {
        if info.mutates_data {
            if let Value::Tensor(t) = &f_args[i] {
                traced_tangents.push(contiguous(fz.meta(*t)));
            }
        }
    }
    for (out, info) in f_outs.iter().zip(&output_info) {
        if info.is_tangent() {
            traced_tangents.push(contiguous(fz.meta(out.tensor()?)));
        }
    }
    for &base in &intermediate_bases {
        traced_tangents.push(contiguous(fz.meta(base)));
    }

    let mut requires_grad_info = mutated_requires_grad;
    requires_grad_info.extend(output_requires_grad);

    let meta = ViewAndMutationMeta::new(
        input_info,
        output_info,
        requires_grad_info,
        intermediate_bases.len(),
        keep_input_mutations,
        traced_tangents,
    );
    debug!(
        "collected metadata: {} mutated inputs, {} aliased outputs, {} intermediate bases",
        meta.num_mutated_inputs(),
        meta.num_outputs_aliased(),
        meta.num_intermediate_bases
    );
    Ok(meta)
}

/// Re-analyzes a rewritten function and checks that the result matches the metadata derived for
/// it incrementally.
pub fn check_rewritten_metadata(
    f: &FlatFn,
    args: &[Value<Tensor>],
    expected: &ViewAndMutationMeta,
    unsafe_view_outputs: bool,
    rewrite: &str,
) -> Result<(), Error> {
    let recomputed = run_functionalized_fw_and_collect_metadata(
        f,
        args,
        expected.keep_input_mutations,
        unsafe_view_outputs,
    )?;
    if recomputed != *expected {
        return Err(Error::SelfCheck(format!(
            "after {}, analysis found\n{:#?}\nbut the updated metadata is\n{:#?}",
            rewrite, recomputed, expected
        )));
    }
    trace!("metadata after {} agrees with a fresh analysis", rewrite);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use aot_tensor::{flat_fn, DType};

    fn tensor(sizes: &[usize], data: &[f64]) -> Tensor {
        Tensor::from_vec(sizes, data.to_vec()).unwrap()
    }

    #[test]
    fn data_mutation_and_fresh_output() {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            cx.mul_scalar_(x, 2.0)?;
            Ok(vec![Value::Tensor(cx.mul_scalar(x, 3.0)?)])
        });
        let x = tensor(&[3], &[1.0, 2.0, 3.0]);
        let meta =
            run_functionalized_fw_and_collect_metadata(&f, &[Value::Tensor(x)], false, false)
                .unwrap();
        assert!(meta.input_info[0].mutates_data);
        assert!(!meta.input_info[0].mutates_metadata);
        assert_eq!(meta.output_info[0].output_type, OutputType::NonAlias);
        assert_eq!(meta.traced_tangents.len(), 2);
        assert_eq!(meta.requires_grad_info, vec![false, false]);
    }

    #[test]
    fn outputs_aliasing_inputs() {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            let y = args[1].tensor()?;
            let t = cx.t(x)?;
            Ok(vec![Value::Tensor(t), Value::Tensor(y), Value::Int(7)])
        });
        let args = [
            Value::Tensor(tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0])),
            Value::Tensor(tensor(&[1], &[0.0])),
        ];
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
        let types: Vec<_> = meta
            .output_info
            .iter()
            .map(|o| (o.output_type, o.base_idx))
            .collect();
        assert_eq!(
            types,
            vec![
                (OutputType::AliasOfInput, Some(0)),
                (OutputType::IsInput, Some(1)),
                (OutputType::NonAlias, None),
            ]
        );
        assert!(meta.traced_tangents.is_empty());
    }

    fn intermediate_views(unsafe_view_outputs: bool) -> ViewAndMutationMeta {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            let out1 = cx.t(x)?;
            let tmp = cx.mul_scalar(x, 2.0)?;
            let out2 = cx.flatten(tmp)?;
            Ok(vec![Value::Tensor(out1), Value::Tensor(out2)])
        });
        let x = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        x.set_requires_grad(true).unwrap();
        let args = [Value::Tensor(x)];
        run_functionalized_fw_and_collect_metadata(&f, &args, false, unsafe_view_outputs).unwrap()
    }

    #[test]
    fn view_of_intermediate_keeps_its_base() {
        let meta = intermediate_views(false);
        assert_eq!(meta.output_info[0].output_type, OutputType::AliasOfInput);
        assert_eq!(
            meta.output_info[1].output_type,
            OutputType::AliasOfIntermediateKeptAsOutput
        );
        assert_eq!(meta.num_intermediate_bases, 1);
        assert_eq!(meta.traced_tangents, vec![TensorMeta::contiguous(&[2, 2], DType::F32)]);
    }

    #[test]
    fn lone_view_of_intermediate_can_be_unsafe() {
        let meta = intermediate_views(true);
        assert_eq!(meta.output_info[1].output_type, OutputType::UnsafeViewAlias);
        assert_eq!(meta.num_intermediate_bases, 0);
        assert_eq!(meta.traced_tangents, vec![TensorMeta::contiguous(&[4], DType::F32)]);
    }

    #[test]
    fn views_sharing_an_intermediate() {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            let tmp = cx.mul_scalar(x, 2.0)?;
            let a = cx.slice(tmp, 0, 0, 1, 1)?;
            let b = cx.slice(tmp, 0, 1, 2, 1)?;
            Ok(vec![Value::Tensor(a), Value::Tensor(b), Value::Tensor(tmp)])
        });
        let x = tensor(&[2], &[1.0, 2.0]);
        x.set_requires_grad(true).unwrap();
        let meta =
            run_functionalized_fw_and_collect_metadata(&f, &[Value::Tensor(x)], false, true)
                .unwrap();
        let types: Vec<_> = meta
            .output_info
            .iter()
            .map(|o| (o.output_type, o.base_idx))
            .collect();
        assert_eq!(
            types,
            vec![
                (OutputType::AliasOfIntermediateThatIsAlsoUserOutput, Some(2)),
                (OutputType::AliasOfIntermediateThatIsAlsoUserOutput, Some(2)),
                (OutputType::NonAlias, None),
            ]
        );
        assert_eq!(meta.requires_grad_info, vec![true, true, true]);
    }

    #[test]
    fn metadata_mutation_only() {
        let f = flat_fn(|cx, args| {
            let x = args[0].tensor()?;
            cx.t_(x)?;
            Ok(vec![Value::Tensor(cx.add_scalar(x, 1.0)?)])
        });
        let x = tensor(&[1, 2], &[1.0, 2.0]);
        let meta =
            run_functionalized_fw_and_collect_metadata(&f, &[Value::Tensor(x)], false, false)
                .unwrap();
        assert!(meta.input_info[0].mutates_metadata);
        assert!(!meta.input_info[0].mutates_data);
        assert_eq!(meta.num_mutated_metadata_only_inputs(), 1);
        assert_eq!(meta.mutated_inp_runtime_indices(), &[0]);
    }
}
