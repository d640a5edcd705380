//! Removing arguments that are passed more than once.
//!
//! Tracing `f(x, x)` as if both arguments were distinct is wrong as soon as one of them is
//! mutated, and differentiating it would count the gradient twice. When no duplicate is mutated,
//! each duplicate is replaced by a detached leaf, which keeps the compiled artifact valid for any
//! pattern of duplicates. Otherwise the artifact is specialized to the observed pattern: it takes
//! the deduplicated argument list, and every call checks that the pattern still holds.

use std::rc::Rc;

use log::{debug, trace};
use rustc_hash::FxHashMap;

use aot_tensor::tensor::TensorId;
use aot_tensor::{flat_fn, Error, FlatFn, Tensor, TensorMeta, Value};

use crate::analyze::check_rewritten_metadata;
use crate::compiler::CompiledFn;
use crate::config::AotConfig;
use crate::meta::{OutputAliasInfo, ViewAndMutationMeta};
use crate::pipeline::{Next, Stage};

/// Where each argument of a call lives in the deduplicated argument list.
///
/// For arguments `[a, b, a, c]`, the deduplicated list is `[a, b, c]` and `add_dupe_map` is
/// `[0, 1, 0, 2]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DupeMap {
    keep_arg_mask: Vec<bool>,
    add_dupe_map: Vec<usize>,
    num_unique: usize,
}

impl DupeMap {
    pub fn of(args: &[Value<Tensor>]) -> Self {
        let mut seen: FxHashMap<TensorId, usize> = FxHashMap::default();
        let mut keep_arg_mask = Vec::with_capacity(args.len());
        let mut add_dupe_map = Vec::with_capacity(args.len());
        let mut num_unique = 0;
        for arg in args {
            if let Value::Tensor(t) = arg {
                if let Some(&j) = seen.get(&t.id()) {
                    keep_arg_mask.push(false);
                    add_dupe_map.push(j);
                    continue;
                }
                seen.insert(t.id(), num_unique);
            }
            keep_arg_mask.push(true);
            add_dupe_map.push(num_unique);
            num_unique += 1;
        }
        DupeMap {
            keep_arg_mask,
            add_dupe_map,
            num_unique,
        }
    }

    pub fn has_dupes(&self) -> bool {
        self.num_unique != self.keep_arg_mask.len()
    }

    pub fn num_args(&self) -> usize {
        self.keep_arg_mask.len()
    }

    pub fn num_unique(&self) -> usize {
        self.num_unique
    }

    pub fn is_kept(&self, i: usize) -> bool {
        self.keep_arg_mask[i]
    }

    /// Position of argument `i` in the deduplicated list.
    pub fn dedup_index(&self, i: usize) -> usize {
        self.add_dupe_map[i]
    }

    pub fn remove_dupe_args<T: Clone>(&self, args: &[T]) -> Vec<T> {
        args.iter()
            .zip(&self.keep_arg_mask)
            .filter(|(_, &keep)| keep)
            .map(|(arg, _)| arg.clone())
            .collect()
    }

    pub fn add_dupe_args<T: Clone>(&self, args: &[T]) -> Vec<T> {
        self.add_dupe_map.iter().map(|&j| args[j].clone()).collect()
    }

    /// Checks that `args` repeats arguments exactly where the arguments this map was built from
    /// did.
    pub fn check(&self, args: &[Value<Tensor>], config: &AotConfig) -> Result<(), Error> {
        if args.len() != self.num_args() {
            return Err(Error::GuardViolation(format!(
                "the compiled function expects {} arguments, but received {}",
                self.num_args(),
                args.len()
            )));
        }
        let first_occurrence: Vec<usize> = {
            let mut first = vec![usize::MAX; self.num_unique];
            for (i, &j) in self.add_dupe_map.iter().enumerate() {
                if first[j] == usize::MAX {
                    first[j] = i;
                }
            }
            first
        };
        for (i, arg) in args.iter().enumerate() {
            if self.keep_arg_mask[i] {
                continue;
            }
            let original = first_occurrence[self.add_dupe_map[i]];
            let same = match (arg, &args[original]) {
                (Value::Tensor(a), Value::Tensor(b)) => a.same(b),
                _ => false,
            };
            if !same {
                return Err(Error::GuardViolation(config.format_guard_bug_msg(
                    &format!("a duplicate of {}", config.describe_input(original)),
                    i,
                )));
            }
        }
        Ok(())
    }
}

/// Replaces every repeated tensor by a detached leaf, unless a repeated tensor is mutated.
fn leafify(
    args: &[Value<Tensor>],
    meta: &ViewAndMutationMeta,
) -> Result<Option<Vec<Value<Tensor>>>, Error> {
    let mut seen: FxHashMap<TensorId, ()> = FxHashMap::default();
    let mut leaf_args = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let Value::Tensor(t) = arg else {
            leaf_args.push(arg.clone());
            continue;
        };
        if seen.insert(t.id(), ()).is_none() {
            leaf_args.push(arg.clone());
        } else if !meta.input_info[i].is_mutated() {
            let leaf = t.detach();
            leaf.set_requires_grad(t.requires_grad())?;
            leaf_args.push(Value::Tensor(leaf));
        } else {
            return Ok(None);
        }
    }
    Ok(Some(leaf_args))
}

/// The metadata of the function taking the deduplicated argument list.
pub fn remove_dupe_metadata(meta: &ViewAndMutationMeta, dupes: &DupeMap) -> ViewAndMutationMeta {
    let mutated = meta.mutated_inp_indices();
    let requires_grad_info = meta
        .requires_grad_info
        .iter()
        .enumerate()
        .filter(|&(k, _)| k >= mutated.len() || dupes.is_kept(mutated[k]))
        .map(|(_, &rg)| rg)
        .collect();

    let data_mutated: Vec<usize> = (0..meta.input_info.len())
        .filter(|&i| meta.input_info[i].mutates_data)
        .collect();
    let traced_tangents: Vec<TensorMeta> = meta
        .traced_tangents
        .iter()
        .enumerate()
        .filter(|&(k, _)| k >= data_mutated.len() || dupes.is_kept(data_mutated[k]))
        .map(|(_, tangent)| tangent.clone())
        .collect();

    let output_info = meta
        .output_info
        .iter()
        .map(|o| OutputAliasInfo {
            base_idx: match o.output_type {
                t if t.aliases_input() => o.base_idx.map(|i| dupes.dedup_index(i)),
                _ => o.base_idx,
            },
            ..*o
        })
        .collect();

    ViewAndMutationMeta::new(
        dupes.remove_dupe_args(&meta.input_info),
        output_info,
        requires_grad_info,
        meta.num_intermediate_bases,
        meta.keep_input_mutations,
        traced_tangents,
    )
}

/// A duplicate whose metadata is mutated cannot be specialized away when another argument aliases
/// it and is mutated through the shared storage, since the order of those mutations is lost.
fn reject_merged_metadata_mutations(
    args: &[Value<Tensor>],
    meta: &ViewAndMutationMeta,
    dupes: &DupeMap,
    config: &AotConfig,
) -> Result<(), Error> {
    for (i, arg) in args.iter().enumerate() {
        let Value::Tensor(t) = arg else {
            continue;
        };
        if dupes.is_kept(i) || !meta.input_info[i].mutates_metadata {
            continue;
        }
        let group: Vec<(usize, &Tensor)> = args
            .iter()
            .enumerate()
            .filter_map(|(j, other)| other.as_tensor().map(|other| (j, other)))
            .filter(|(_, other)| other.storage_key() == t.storage_key())
            .collect();
        let aliased = group.iter().any(|(_, other)| !other.same(t));
        let data_mutated = group.iter().any(|&(j, _)| meta.input_info[j].mutates_data);
        if aliased && data_mutated {
            return Err(Error::Unsupported(format!(
                "{} is passed more than once and has its metadata mutated, while it also aliases \
                 another argument and that storage has its data mutated",
                config.describe_input(i)
            )));
        }
    }
    Ok(())
}

pub struct DedupeStage;

impl Stage for DedupeStage {
    fn name(&self) -> &'static str {
        "dedupe"
    }

    fn compile(
        &self,
        f: FlatFn,
        args: &[Value<Tensor>],
        config: &AotConfig,
        meta: ViewAndMutationMeta,
        next: Next<'_>,
    ) -> Result<CompiledFn, Error> {
        if let Some(leaf_args) = leafify(args, &meta)? {
            return next.compile(f, &leaf_args, config, meta);
        }

        let dupes = DupeMap::of(args);
        reject_merged_metadata_mutations(args, &meta, &dupes, config)?;
        debug!(
            "specializing aot function {} to {} distinct arguments out of {}",
            config.aot_id,
            dupes.num_unique(),
            dupes.num_args()
        );
        let deduped_args = dupes.remove_dupe_args(args);
        let updated_meta = remove_dupe_metadata(&meta, &dupes);
        let dupes = Rc::new(dupes);

        let wrapped = {
            let dupes = dupes.clone();
            flat_fn(move |cx, args| f(cx, &dupes.add_dupe_args(args)))
        };
        if config.debug_assert {
            check_rewritten_metadata(
                &wrapped,
                &deduped_args,
                &updated_meta,
                config.unsafe_view_outputs,
                "removing duplicate arguments",
            )?;
        }

        let compiled = next.compile(wrapped, &deduped_args, config, updated_meta)?;
        let config = config.clone();
        Ok(Rc::new(move |args: Vec<Value<Tensor>>| {
            dupes.check(&args, &config)?;
            trace!("removing {} duplicate arguments", args.len() - dupes.num_unique());
            compiled(dupes.remove_dupe_args(&args))
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analyze::run_functionalized_fw_and_collect_metadata;
    use crate::compiler::interpreter_compiler;
    use crate::meta::OutputType;
    use crate::pipeline::{EagerStage, Pipeline};

    fn tensor(data: &[f64]) -> Tensor {
        Tensor::from_vec(&[data.len()], data.to_vec()).unwrap()
    }

    #[test]
    fn dupe_map_layout() {
        let a = tensor(&[1.0]);
        let b = tensor(&[2.0]);
        let c = tensor(&[3.0]);
        let args = vec![
            Value::Tensor(a.clone()),
            Value::Tensor(b),
            Value::Int(4),
            Value::Tensor(a),
            Value::Tensor(c),
        ];
        let dupes = DupeMap::of(&args);
        assert!(dupes.has_dupes());
        assert_eq!(dupes.num_unique(), 4);
        assert_eq!(
            (0..5).map(|i| dupes.dedup_index(i)).collect::<Vec<_>>(),
            vec![0, 1, 2, 0, 3]
        );
        assert_eq!(dupes.remove_dupe_args(&[10, 11, 12, 13, 14]), vec![10, 11, 12, 14]);
        assert_eq!(dupes.add_dupe_args(&[10, 11, 12, 14]), vec![10, 11, 12, 10, 14]);
    }

    fn mutate_first_add_second() -> FlatFn {
        flat_fn(|cx, args| {
            let a = args[0].tensor()?;
            let b = args[1].tensor()?;
            cx.mul_scalar_(a, 2.0)?;
            Ok(vec![Value::Tensor(cx.add(a, b)?), Value::Tensor(b)])
        })
    }

    #[test]
    fn metadata_follows_the_deduplicated_arguments() {
        let x = tensor(&[1.0, 2.0]);
        let args = vec![Value::Tensor(x.clone()), Value::Tensor(x)];
        let f = mutate_first_add_second();
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
        assert_eq!(meta.output_info[1].output_type, OutputType::IsInput);
        assert_eq!(meta.output_info[1].base_idx, Some(1));

        let dupes = DupeMap::of(&args);
        let updated = remove_dupe_metadata(&meta, &dupes);
        assert_eq!(updated.input_info.len(), 1);
        assert_eq!(updated.output_info[1].base_idx, Some(0));
        assert_eq!(updated.requires_grad_info.len(), 1 + 2);
        assert_eq!(updated.traced_tangents.len(), 1 + 1);
    }

    #[test]
    fn mutated_duplicates_are_specialized() {
        let x = tensor(&[1.0, 2.0]);
        let args = vec![Value::Tensor(x.clone()), Value::Tensor(x.clone())];
        let f = mutate_first_add_second();
        let mut config = AotConfig::new(interpreter_compiler());
        config.debug_assert = true;
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
        let pipeline = Pipeline::new().then(DedupeStage).then(EagerStage);
        let compiled = pipeline.compile(f, &args, &config, meta).unwrap();

        let outs = compiled(args).unwrap();
        assert_eq!(x.to_vec(), vec![2.0, 4.0]);
        assert_eq!(outs[0].tensor().unwrap().to_vec(), vec![4.0, 8.0]);

        let y = tensor(&[1.0, 2.0]);
        let err = compiled(vec![Value::Tensor(x), Value::Tensor(y)]).unwrap_err();
        assert!(matches!(
            err,
            Error::GuardViolation(msg) if msg.contains("a duplicate of input 0")
        ));
    }

    #[test]
    fn unmutated_duplicates_become_leaves() {
        let x = tensor(&[1.0, 2.0]);
        x.set_requires_grad(true).unwrap();
        let args = vec![Value::Tensor(x.clone()), Value::Tensor(x.clone())];
        let f = flat_fn(|cx, args| {
            let a = args[0].tensor()?;
            let b = args[1].tensor()?;
            Ok(vec![Value::Tensor(cx.mul(a, b)?)])
        });
        let meta = run_functionalized_fw_and_collect_metadata(&f, &args, false, false).unwrap();
        let leaf_args = leafify(&args, &meta).unwrap().unwrap();
        let leaf = leaf_args[1].tensor().unwrap();
        assert!(!leaf.same(&x));
        assert!(leaf.is_leaf() && leaf.requires_grad());
        assert_eq!(leaf.storage_key(), x.storage_key());
    }
}
