//! Restores the caller-visible behavior of a function from its compiled, functional form.

use std::rc::Rc;

use log::trace;

use aot_tensor::dispatch::copy_into;
use aot_tensor::{EagerInterpreter, Error, Op, Tensor, Value};

use crate::alias::{gen_alias_from_base, ViewDescriptor};
use crate::compiler::CompiledFn;
use crate::meta::{OutputType, ViewAndMutationMeta};

/// A result of a compiled forward. Aliases are handed through untouched by the differentiation
/// bridge, since the runtime wrapper regenerates them.
#[derive(Clone, Debug)]
pub enum GraphOutput {
    Plain(Value<Tensor>),
    Alias(Tensor),
}

impl GraphOutput {
    pub fn into_value(self) -> Value<Tensor> {
        match self {
            GraphOutput::Plain(value) => value,
            GraphOutput::Alias(tensor) => Value::Tensor(tensor),
        }
    }

    fn into_tensor(self, what: &str) -> Result<Tensor, Error> {
        match self.into_value() {
            Value::Tensor(t) => Ok(t),
            other => Err(Error::Invariant(format!(
                "{} should be a tensor, found {:?}",
                what,
                other.kind()
            ))),
        }
    }
}

pub type RawFn = Rc<dyn Fn(Vec<Value<Tensor>>) -> Result<Vec<GraphOutput>, Error>>;

/// Adapts a compiled function whose results need no special treatment.
pub fn plain_outputs(compiled: CompiledFn) -> RawFn {
    Rc::new(move |args| {
        Ok(compiled(args)?
            .into_iter()
            .map(GraphOutput::Plain)
            .collect())
    })
}

fn apply_input_mutation(
    meta: &ViewAndMutationMeta,
    index: usize,
    original: &Tensor,
    updated: Tensor,
) -> Result<(), Error> {
    let info = &meta.input_info[index];
    if !info.is_mutated() {
        return Ok(());
    }
    let restride = || {
        aot_tensor::dispatch::call(
            &Op::AsStridedInplace(updated.layout()),
            &[Value::Tensor(original.clone())],
        )
    };

    if !info.mutates_data {
        trace!("restriding input {} to {:?}", index, updated.layout());
        restride()?;
        return Ok(());
    }
    if info.mutates_metadata {
        restride()?;
    } else if original.numel() != updated.numel() {
        return Err(Error::Unsupported(format!(
            "input {} changed from {} to {} elements, but resizing inputs is not supported",
            index,
            original.numel(),
            updated.numel()
        )));
    }

    trace!("copying the new value of input {}", index);
    if info.is_leaf && original.requires_grad() {
        // Every mutation of such an input was hidden from autograd, or tracing would have failed.
        copy_into(&original.detach(), &updated)
    } else {
        copy_into(original, &updated)
    }
}

fn regenerate_alias(base: &Tensor, target: &Tensor, requires_grad: bool) -> Result<Tensor, Error> {
    let mut cx = EagerInterpreter::new();
    let base_ref = cx.import(&Value::Tensor(base.clone())).tensor()?;
    let out = gen_alias_from_base(&mut cx, base_ref, &ViewDescriptor::of(target), requires_grad)?;
    Ok(cx.tensor(out).clone())
}

/// Wraps `compiled` so that each call mutates the caller's inputs and returns aliased outputs the
/// way the original function did.
///
/// `compiled` must return the inputs listed in `mutated_inp_runtime_indices`, then one value per
/// output, then the intermediate bases.
pub fn create_runtime_wrapper(compiled: RawFn, meta: Rc<ViewAndMutationMeta>) -> CompiledFn {
    Rc::new(move |args: Vec<Value<Tensor>>| {
        let all_outs = compiled(args.clone())?;

        let runtime_indices = meta.mutated_inp_runtime_indices();
        let num_updates = runtime_indices.len();
        let expected = num_updates + meta.num_outputs() + meta.num_intermediate_bases;
        if all_outs.len() != expected {
            return Err(Error::GuardViolation(format!(
                "the compiled function returned {} values, but its metadata expects {} ({} \
                 mutated inputs, {} outputs and {} intermediate bases)",
                all_outs.len(),
                expected,
                num_updates,
                meta.num_outputs(),
                meta.num_intermediate_bases
            )));
        }

        let mut all_outs = all_outs.into_iter();
        let updated_inputs: Vec<GraphOutput> = all_outs.by_ref().take(num_updates).collect();
        let fw_outs: Vec<GraphOutput> = all_outs.by_ref().take(meta.num_outputs()).collect();
        let intermediate_bases = all_outs
            .map(|base| base.into_tensor("an intermediate base"))
            .collect::<Result<Vec<_>, _>>()?;

        for (&index, updated) in runtime_indices.iter().zip(updated_inputs) {
            let original = args[index].tensor()?;
            let updated = updated.into_tensor("a mutated input")?;
            apply_input_mutation(&meta, index, &original, updated)?;
        }

        if meta.num_outputs_aliased() == 0 {
            return Ok(fw_outs.into_iter().map(GraphOutput::into_value).collect());
        }

        let plain_outs: Vec<Value<Tensor>> =
            fw_outs.into_iter().map(GraphOutput::into_value).collect();
        let num_mutated = meta.num_mutated_inputs();
        let mut ret_outs = Vec::with_capacity(plain_outs.len());
        for (i, (out, info)) in plain_outs.iter().zip(&meta.output_info).enumerate() {
            if !info.output_type.is_regenerated() {
                ret_outs.push(out.clone());
                continue;
            }
            let base_idx = info.base_idx.ok_or_else(|| {
                Error::Invariant(format!("aliased output {} has no base", i))
            })?;
            let target = out.tensor()?;
            let requires_grad = meta.requires_grad_info[num_mutated + i];
            let base = match info.output_type {
                OutputType::IsInput => {
                    ret_outs.push(args[base_idx].clone());
                    continue;
                }
                OutputType::AliasOfInput => args[base_idx].tensor()?,
                OutputType::AliasOfIntermediate | OutputType::AliasOfIntermediateKeptAsOutput => {
                    intermediate_bases[base_idx].clone()
                }
                _ => plain_outs[base_idx].tensor()?,
            };
            trace!("regenerating output {} ({:?})", i, info.output_type);
            ret_outs.push(Value::Tensor(regenerate_alias(
                &base,
                &target,
                requires_grad,
            )?));
        }
        Ok(ret_outs)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::{InputAliasInfo, OutputAliasInfo};
    use aot_tensor::{DType, Layout, TensorMeta, ValueKind};

    fn meta(
        input_info: Vec<InputAliasInfo>,
        output_info: Vec<OutputAliasInfo>,
    ) -> ViewAndMutationMeta {
        let num_rg = input_info.iter().filter(|i| i.is_mutated()).count() + output_info.len();
        ViewAndMutationMeta::new(input_info, output_info, vec![false; num_rg], 0, false, Vec::new())
    }

    fn compiled(f: impl Fn(&[Value<Tensor>]) -> Vec<Value<Tensor>> + 'static) -> RawFn {
        plain_outputs(Rc::new(move |args: Vec<Value<Tensor>>| {
            Ok::<_, Error>(f(&args))
        }))
    }

    #[test]
    fn applies_data_and_metadata_mutations() {
        let meta = meta(
            vec![
                InputAliasInfo {
                    is_leaf: true,
                    mutates_data: true,
                    mutates_metadata: false,
                },
                InputAliasInfo {
                    is_leaf: true,
                    mutates_data: false,
                    mutates_metadata: true,
                },
            ],
            vec![],
        );
        let wrapper = create_runtime_wrapper(
            compiled(|args| {
                let y = args[1].tensor().unwrap();
                let t = aot_tensor::dispatch::call(
                    &Op::View(aot_tensor::ViewOp::Transpose(0, 1)),
                    &[Value::Tensor(y)],
                )
                .unwrap();
                vec![
                    Value::Tensor(Tensor::from_vec(&[2], vec![7.0, 8.0]).unwrap()),
                    t,
                ]
            }),
            Rc::new(meta),
        );

        let x = Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap();
        let y = Tensor::from_vec(&[1, 2], vec![3.0, 4.0]).unwrap();
        let outs = wrapper(vec![Value::Tensor(x.clone()), Value::Tensor(y.clone())]).unwrap();
        assert!(outs.is_empty());
        assert_eq!(x.to_vec(), vec![7.0, 8.0]);
        assert_eq!(y.sizes(), vec![2, 1]);
    }

    #[test]
    fn regenerates_outputs_aliasing_inputs() {
        let meta = meta(
            vec![InputAliasInfo {
                is_leaf: true,
                mutates_data: false,
                mutates_metadata: false,
            }],
            vec![
                OutputAliasInfo {
                    output_type: OutputType::AliasOfInput,
                    raw_type: ValueKind::Tensor,
                    base_idx: Some(0),
                },
                OutputAliasInfo {
                    output_type: OutputType::IsInput,
                    raw_type: ValueKind::Tensor,
                    base_idx: Some(0),
                },
            ],
        );
        let wrapper = create_runtime_wrapper(
            compiled(|args| {
                let x = args[0].tensor().unwrap();
                let layout = Layout::new(vec![2], vec![2], 0).unwrap();
                let view = Tensor::from_storage(x.storage(), layout, DType::F32).unwrap();
                vec![Value::Tensor(view), Value::Tensor(x.detach())]
            }),
            Rc::new(meta),
        );

        let x = Tensor::from_vec(&[4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let outs = wrapper(vec![Value::Tensor(x.clone())]).unwrap();
        let strided = outs[0].tensor().unwrap();
        assert_eq!(strided.to_vec(), vec![1.0, 3.0]);
        assert!(strided.base().unwrap().same(&x));
        assert!(outs[1].tensor().unwrap().same(&x));
    }

    #[test]
    fn wrong_arity_is_a_guard_violation() {
        let meta = meta(vec![], vec![OutputAliasInfo::non_alias(ValueKind::Tensor)]);
        let wrapper = create_runtime_wrapper(compiled(|_| Vec::new()), Rc::new(meta));
        assert!(matches!(wrapper(Vec::new()), Err(Error::GuardViolation(_))));
    }

    #[test]
    fn resizing_is_unsupported() {
        let meta = meta(
            vec![InputAliasInfo {
                is_leaf: true,
                mutates_data: true,
                mutates_metadata: false,
            }],
            vec![],
        );
        let wrapper = create_runtime_wrapper(
            compiled(|_| {
                let meta = TensorMeta::contiguous(&[3], DType::F32);
                vec![Value::Tensor(Tensor::zeros(&meta))]
            }),
            Rc::new(meta),
        );
        let x = Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap();
        assert!(matches!(
            wrapper(vec![Value::Tensor(x)]),
            Err(Error::Unsupported(_))
        ));
    }
}
