//! Merging arguments that share a storage into one base argument.
//!
//! When `f(a, b)` mutates `a` and `b` is a view of the same storage, tracing `a` and `b` as
//! unrelated inputs would lose the effect of the mutation on `b`. Such groups of arguments are
//! replaced by a single base: the compiled function takes the base, and regenerates each member as
//! a view of it before running the user's function.

use std::rc::Rc;

use log::{debug, trace};
use rustc_hash::FxHashMap;

use aot_tensor::storage::StorageKey;
use aot_tensor::{dispatch, flat_fn, Error, FlatFn, Layout, Op, Tensor, TensorMeta, Val, Value};

use crate::alias::{gen_alias_from_base, ViewDescriptor};
use crate::analyze::check_rewritten_metadata;
use crate::compiler::CompiledFn;
use crate::config::AotConfig;
use crate::meta::{InputAliasInfo, OutputAliasInfo, OutputType, ViewAndMutationMeta};
use crate::pipeline::{Next, Stage};

/// Where an argument of the caller's argument list comes from in the merged argument list.
#[derive(Clone, Debug)]
pub enum SyntheticBaseInfo {
    /// Merged argument `i`, unchanged.
    Arg(usize),
    /// A view of merged base `i`.
    ViewOf(usize, ViewDescriptor),
}

impl SyntheticBaseInfo {
    pub fn merged_index(&self) -> usize {
        match self {
            SyntheticBaseInfo::Arg(i) | SyntheticBaseInfo::ViewOf(i, _) => *i,
        }
    }
}

fn are_differentiable_views(a: &Tensor, b: &Tensor) -> bool {
    if a.same(b) {
        return true;
    }
    match (a.base(), b.base()) {
        (None, None) => false,
        (Some(x), Some(y)) => x.same(&y),
        (Some(x), None) => x.same(b),
        (None, Some(y)) => y.same(a),
    }
}

fn same_dtype_views(a: &Tensor, b: &Tensor) -> bool {
    let matches_base = |t: &Tensor| t.base().map_or(true, |base| base.dtype() == t.dtype());
    a.dtype() == b.dtype() && matches_base(a) && matches_base(b)
}

fn group_base(
    members: &[(usize, &Tensor)],
    is_inference: bool,
    config: &AotConfig,
) -> Result<Tensor, Error> {
    for pair in members.windows(2) {
        let ((i, a), (j, b)) = (pair[0], pair[1]);
        if !is_inference && !are_differentiable_views(a, b) {
            return Err(Error::Unsupported(format!(
                "{} and {} share a storage and one of them is mutated, but they are not views of \
                 a common differentiable base",
                config.describe_input(i),
                config.describe_input(j)
            )));
        }
        if !same_dtype_views(a, b) {
            return Err(Error::Unsupported(format!(
                "{} and {} share a storage and one of them is mutated, but they view it with \
                 different dtypes",
                config.describe_input(i),
                config.describe_input(j)
            )));
        }
    }

    let (first_idx, first) = members[0];
    let bases: Vec<Tensor> = members.iter().filter_map(|(_, t)| t.base()).collect();
    let Some(base) = bases.first() else {
        // Nothing records how these tensors relate, so view the whole storage.
        let storage = first.storage();
        return Tensor::from_storage(
            storage,
            Layout::contiguous(&[storage.len()]),
            first.dtype(),
        );
    };
    let shares_base = bases.iter().all(|other| other.same(base))
        && members
            .iter()
            .all(|(_, t)| t.is_view() || t.same(base));
    if !shares_base {
        return Err(Error::Unsupported(format!(
            "{} shares a storage with other arguments, one of which is mutated, but they are not \
             all views of one base",
            config.describe_input(first_idx)
        )));
    }
    Ok(base.clone())
}

/// Replaces each group of arguments that share a storage, where some member's data is mutated,
/// by one base argument.
///
/// Bases come first, ordered by the first appearance of a member of their group, followed by the
/// remaining arguments in their original order. Returns `None` for the mapping when nothing had to
/// be merged.
pub fn merge_view_inputs(
    args: &[Value<Tensor>],
    input_info: &[InputAliasInfo],
    is_inference: bool,
    config: &AotConfig,
) -> Result<(Vec<Value<Tensor>>, Option<Vec<SyntheticBaseInfo>>), Error> {
    let mut groups: Vec<Vec<(usize, &Tensor)>> = Vec::new();
    let mut group_of: FxHashMap<StorageKey, usize> = FxHashMap::default();
    for (i, arg) in args.iter().enumerate() {
        if let Value::Tensor(t) = arg {
            let group = *group_of.entry(t.storage_key()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push((i, t));
        }
    }

    let mut info: Vec<Option<SyntheticBaseInfo>> = vec![None; args.len()];
    let mut merged = Vec::new();
    for members in &groups {
        if members.len() < 2 || !members.iter().any(|&(i, _)| input_info[i].mutates_data) {
            continue;
        }
        let base = group_base(members, is_inference, config)?;
        let base_idx = merged.len();
        merged.push(Value::Tensor(base));
        for &(i, t) in members {
            info[i] = Some(SyntheticBaseInfo::ViewOf(base_idx, ViewDescriptor::of(t)));
        }
    }
    if merged.is_empty() {
        return Ok((args.to_vec(), None));
    }

    for (i, arg) in args.iter().enumerate() {
        if info[i].is_none() {
            info[i] = Some(SyntheticBaseInfo::Arg(merged.len()));
            merged.push(arg.clone());
        }
    }
    let info = info
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| Error::Invariant("an argument was lost while merging views".to_owned()))?;
    Ok((merged, Some(info)))
}

/// The metadata of the function taking merged arguments, and the caller's arguments whose metadata
/// mutations become extra outputs of that function.
pub fn create_synthetic_base_metadata(
    meta: &ViewAndMutationMeta,
    synthetic_base_info: &[SyntheticBaseInfo],
    inner_args: &[Value<Tensor>],
) -> Result<(ViewAndMutationMeta, Vec<usize>), Error> {
    let mut outer_of_inner: Vec<Vec<usize>> = vec![Vec::new(); inner_args.len()];
    for (outer, info) in synthetic_base_info.iter().enumerate() {
        outer_of_inner[info.merged_index()].push(outer);
    }
    let outer_requires_grad = |outer: usize| {
        meta.mutated_inp_indices()
            .iter()
            .position(|&i| i == outer)
            .map_or(false, |k| meta.requires_grad_info[k])
    };

    let mut input_info = Vec::with_capacity(inner_args.len());
    let mut mutated_requires_grad = Vec::new();
    let mut traced_tangents = Vec::new();
    for (inner, outers) in outer_of_inner.iter().enumerate() {
        let is_base = outers
            .iter()
            .any(|&o| matches!(synthetic_base_info[o], SyntheticBaseInfo::ViewOf(..)));
        let info = match (is_base, outers.as_slice()) {
            (true, _) => {
                let base = inner_args[inner].tensor()?;
                mutated_requires_grad.push(
                    base.requires_grad() || outers.iter().any(|&o| outer_requires_grad(o)),
                );
                InputAliasInfo {
                    is_leaf: base.is_leaf(),
                    mutates_data: true,
                    mutates_metadata: false,
                }
            }
            (false, &[outer]) => {
                let info = meta.input_info[outer];
                if info.is_mutated() {
                    mutated_requires_grad.push(outer_requires_grad(outer));
                }
                info
            }
            _ => {
                return Err(Error::Invariant(format!(
                    "merged argument {} stands for {} arguments",
                    inner,
                    outers.len()
                )))
            }
        };
        if info.mutates_data {
            let t = inner_args[inner].tensor()?;
            traced_tangents.push(TensorMeta::contiguous(&t.sizes(), t.dtype()));
        }
        input_info.push(info);
    }
    traced_tangents.extend(
        meta.traced_tangents
            .iter()
            .skip(meta.num_mutated_data_inputs())
            .cloned(),
    );

    let metadata_mutated: Vec<usize> = meta
        .input_info
        .iter()
        .enumerate()
        .filter(|&(i, info)| {
            info.mutates_metadata
                && matches!(synthetic_base_info[i], SyntheticBaseInfo::ViewOf(..))
        })
        .map(|(i, _)| i)
        .collect();

    let mut output_info: Vec<OutputAliasInfo> = meta
        .output_info
        .iter()
        .map(|o| {
            let Some(base_idx) = o.base_idx.filter(|_| o.output_type.aliases_input()) else {
                return *o;
            };
            match &synthetic_base_info[base_idx] {
                SyntheticBaseInfo::Arg(j) => OutputAliasInfo {
                    base_idx: Some(*j),
                    ..*o
                },
                // The caller's argument is regenerated from the base, so it only aliases it.
                SyntheticBaseInfo::ViewOf(j, _) => OutputAliasInfo {
                    output_type: OutputType::AliasOfInput,
                    raw_type: o.raw_type,
                    base_idx: Some(*j),
                },
            }
        })
        .collect();
    let mut requires_grad_info = mutated_requires_grad;
    requires_grad_info.extend(&meta.requires_grad_info[meta.num_mutated_inputs()..]);
    for &outer in &metadata_mutated {
        let view = &synthetic_base_info[outer];
        output_info.push(OutputAliasInfo {
            output_type: OutputType::AliasOfInput,
            raw_type: aot_tensor::ValueKind::Tensor,
            base_idx: Some(view.merged_index()),
        });
        let requires_grad = match view {
            SyntheticBaseInfo::ViewOf(_, desc) => desc.requires_grad,
            SyntheticBaseInfo::Arg(_) => false,
        };
        requires_grad_info.push(requires_grad);
    }

    Ok((
        ViewAndMutationMeta::new(
            input_info,
            output_info,
            requires_grad_info,
            meta.num_intermediate_bases,
            meta.keep_input_mutations,
            traced_tangents,
        ),
        metadata_mutated,
    ))
}

fn unpack_synthetic_bases(
    cx: &mut dyn aot_tensor::Interpreter,
    args: &[Val],
    synthetic_base_info: &[SyntheticBaseInfo],
) -> Result<Vec<Val>, Error> {
    synthetic_base_info
        .iter()
        .map(|info| match info {
            SyntheticBaseInfo::Arg(i) => Ok(args[*i].clone()),
            SyntheticBaseInfo::ViewOf(i, desc) => {
                let base = args[*i].tensor()?;
                Ok(Value::Tensor(gen_alias_from_base(
                    cx,
                    base,
                    desc,
                    desc.requires_grad,
                )?))
            }
        })
        .collect()
}

/// The first argument which a call merges differently from how the compiled function expects.
fn first_merging_mismatch(
    expected: &[SyntheticBaseInfo],
    found: &[SyntheticBaseInfo],
) -> Option<usize> {
    if expected.len() != found.len() {
        return Some(0);
    }
    expected
        .iter()
        .zip(found)
        .position(|pair| match pair {
            (SyntheticBaseInfo::Arg(i), SyntheticBaseInfo::Arg(j)) => i != j,
            (SyntheticBaseInfo::ViewOf(i, a), SyntheticBaseInfo::ViewOf(j, b)) => {
                i != j || a.meta != b.meta
            }
            _ => true,
        })
}

pub struct SyntheticBaseStage {
    pub needs_autograd: bool,
}

impl Stage for SyntheticBaseStage {
    fn name(&self) -> &'static str {
        "synthetic_base"
    }

    fn compile(
        &self,
        f: FlatFn,
        args: &[Value<Tensor>],
        config: &AotConfig,
        meta: ViewAndMutationMeta,
        next: Next<'_>,
    ) -> Result<CompiledFn, Error> {
        let is_inference = !self.needs_autograd;
        let (merged_args, info) = merge_view_inputs(args, &meta.input_info, is_inference, config)?;
        let Some(info) = info else {
            return next.compile(f, args, config, meta);
        };

        let (updated_meta, metadata_mutated) =
            create_synthetic_base_metadata(&meta, &info, &merged_args)?;
        let num_views = info
            .iter()
            .filter(|i| matches!(i, SyntheticBaseInfo::ViewOf(..)))
            .count();
        debug!(
            "merged {} arguments of aot function {} into {} synthetic bases",
            num_views,
            config.aot_id,
            merged_args.len() - (info.len() - num_views)
        );

        let info = Rc::new(info);
        let metadata_mutated = Rc::new(metadata_mutated);
        let wrapped = {
            let info = info.clone();
            let metadata_mutated = metadata_mutated.clone();
            flat_fn(move |cx, args| {
                let unpacked = unpack_synthetic_bases(cx, args, &info)?;
                let mut outs = f(cx, &unpacked)?;
                // Metadata mutations of merged arguments are applied to the caller's arguments
                // from these extra outputs.
                outs.extend(metadata_mutated.iter().map(|&i| unpacked[i].clone()));
                Ok(outs)
            })
        };
        if config.debug_assert {
            check_rewritten_metadata(
                &wrapped,
                &merged_args,
                &updated_meta,
                config.unsafe_view_outputs,
                "merging aliased arguments into synthetic bases",
            )?;
        }

        let num_merged = merged_args.len();
        let compiled = next.compile(wrapped, &merged_args, config, updated_meta)?;
        let input_info = meta.input_info.clone();
        let config = config.clone();
        Ok(Rc::new(move |args: Vec<Value<Tensor>>| {
            let (merged, runtime_info) =
                merge_view_inputs(&args, &input_info, is_inference, &config)?;
            let mismatch = match &runtime_info {
                Some(runtime_info) if merged.len() == num_merged => {
                    first_merging_mismatch(&info, runtime_info)
                }
                _ => Some(
                    info.iter()
                        .position(|i| matches!(i, SyntheticBaseInfo::ViewOf(..)))
                        .unwrap_or(0),
                ),
            };
            if let Some(index) = mismatch {
                return Err(Error::GuardViolation(config.format_guard_bug_msg(
                    "sharing a storage with another argument in the same way",
                    index,
                )));
            }
            let aliased = metadata_mutated
                .iter()
                .map(|&i| args[i].tensor())
                .collect::<Result<Vec<_>, _>>()?;
            drop(args);

            let mut outs = compiled(merged)?;
            if aliased.is_empty() {
                return Ok(outs);
            }
            let updates = outs.split_off(outs.len().saturating_sub(aliased.len()));
            for (input, updated) in aliased.iter().zip(updates) {
                let layout = updated.tensor()?.layout();
                trace!("restriding a merged argument to {:?}", layout);
                dispatch::call(&Op::AsStridedInplace(layout), &[Value::Tensor(input.clone())])?;
            }
            Ok(outs)
        }))
    }
}
