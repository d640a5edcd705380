//! Connects a compiled forward/backward pair to the eager autograd engine.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info, trace};

use aot_tensor::autograd::{is_grad_enabled, no_grad, Edge, GradNode};
use aot_tensor::dispatch;
use aot_tensor::{Error, Op, Tensor, TensorMeta, Value};
use aot_trace::Graph;

use crate::compile_context::track_graph_compiling;
use crate::compiler::{CompiledFn, Compiler};
use crate::config::AotConfig;
use crate::meta::ViewAndMutationMeta;
use crate::runtime_wrapper::{GraphOutput, RawFn};

struct Backward {
    graph: Graph,
    compiler: Compiler,
    compiled: RefCell<Option<CompiledFn>>,
    aot_id: usize,
}

impl Backward {
    fn compiled(&self, all_args: &[Value<Tensor>]) -> Result<CompiledFn, Error> {
        if let Some(compiled) = self.compiled.borrow().as_ref() {
            return Ok(compiled.clone());
        }
        let _ctx = track_graph_compiling(self.aot_id, "backward");
        let metas: Vec<Value<TensorMeta>> = all_args
            .iter()
            .map(|arg| arg.as_ref().map(Tensor::meta))
            .collect();
        let compiled = (self.compiler)(&self.graph, &metas)?;
        info!("compiled backward graph of aot function {}", self.aot_id);
        *self.compiled.borrow_mut() = Some(compiled.clone());
        Ok(compiled)
    }
}

/// The backward of one call to a compiled function.
struct CompiledFunctionBackward {
    meta: Rc<ViewAndMutationMeta>,
    backward: Rc<Backward>,
    saved: Vec<Value<Tensor>>,
    edges: Vec<Option<Edge>>,
}

impl CompiledFunctionBackward {
    fn tangents(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Value<Tensor>>, Error> {
        let mut metas = self.meta.traced_tangents.iter();
        let mut tangents = Vec::with_capacity(self.meta.traced_tangents.len());
        for (grad, needed) in grads.into_iter().zip(self.meta.tangent_mask()) {
            if !needed {
                continue;
            }
            let meta = metas.next().ok_or_else(|| {
                Error::Invariant("more tangent outputs than traced tangents".to_owned())
            })?;
            let tangent = match grad {
                Some(grad) if grad.is_contiguous() => grad,
                Some(grad) => dispatch::call(&Op::Clone, &[Value::Tensor(grad)])?.tensor()?,
                None => Tensor::zeros(meta),
            };
            tangents.push(Value::Tensor(tangent));
        }
        Ok(tangents)
    }
}

impl GradNode for CompiledFunctionBackward {
    fn name(&self) -> String {
        "CompiledFunctionBackward".to_owned()
    }

    fn num_inputs(&self) -> usize {
        self.meta.num_forward_returns()
    }

    fn next_edges(&self) -> Vec<Option<Edge>> {
        self.edges.clone()
    }

    fn apply(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error> {
        let expected = self.meta.num_forward_returns();
        if grads.len() != expected {
            return Err(Error::Invariant(format!(
                "compiled backward received {} gradients, expected {}",
                grads.len(),
                expected
            )));
        }

        let mut all_args = self.saved.clone();
        all_args.extend(self.tangents(grads)?);
        let compiled = self.backward.compiled(&all_args)?;

        let tracks_grad = is_grad_enabled()
            && all_args
                .iter()
                .any(|arg| arg.as_tensor().map_or(false, Tensor::requires_grad));
        let grads = if tracks_grad {
            let edges: Vec<Option<Edge>> = all_args
                .iter()
                .map(|arg| arg.as_tensor().and_then(Tensor::grad_edge))
                .collect();
            let outs = {
                let _guard = no_grad();
                compiled(all_args)?
            };
            // Connect the gradients to the graph so that differentiating them again fails loudly.
            let guard: Rc<dyn GradNode> = Rc::new(DoubleBackwardGuard {
                num_inputs: outs.len(),
                edges,
            });
            outs.into_iter()
                .enumerate()
                .map(|(i, out)| {
                    out.try_map(|t| {
                        let t = t.detach();
                        t.set_history(Edge::new(guard.clone(), i))?;
                        Ok::<_, Error>(t)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            compiled(all_args)?
        };

        if grads.len() != self.edges.len() {
            return Err(Error::Invariant(format!(
                "compiled backward returned {} gradients for {} inputs",
                grads.len(),
                self.edges.len()
            )));
        }
        Ok(grads
            .into_iter()
            .map(|grad| match grad {
                Value::Tensor(t) => Some(t),
                _ => None,
            })
            .collect())
    }
}

struct DoubleBackwardGuard {
    num_inputs: usize,
    edges: Vec<Option<Edge>>,
}

impl GradNode for DoubleBackwardGuard {
    fn name(&self) -> String {
        "CompiledFunctionBackwardBackward".to_owned()
    }

    fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    fn next_edges(&self) -> Vec<Option<Edge>> {
        self.edges.clone()
    }

    fn apply(&self, _grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, Error> {
        Err(Error::DoubleBackward)
    }
}

/// Wraps a compiled forward so its results carry autograd history leading to the compiled
/// backward.
///
/// The forward returns `(mutated inputs, outputs, intermediate bases, saved...)`. Saved values are
/// kept for the backward and dropped from the results. Aliases (outputs regenerated by the runtime
/// wrapper, and inputs whose only mutation is to their metadata) are returned as
/// [`GraphOutput::Alias`] without history. `compile_requires_grad` records which arguments
/// required grad when the function was compiled.
pub fn create_compiled_function(
    compiled_fw: CompiledFn,
    bw_graph: Graph,
    meta: Rc<ViewAndMutationMeta>,
    config: &AotConfig,
    compile_requires_grad: Vec<bool>,
) -> RawFn {
    let backward = Rc::new(Backward {
        graph: bw_graph,
        compiler: config.bw_compiler.clone(),
        compiled: RefCell::new(None),
        aot_id: config.aot_id,
    });
    let config = config.clone();

    Rc::new(move |args: Vec<Value<Tensor>>| {
        if config.debug_assert {
            let checks = args.iter().zip(&compile_requires_grad).enumerate();
            for (i, (arg, &could_require_grad)) in checks {
                let requires_grad = arg.as_tensor().map_or(false, Tensor::requires_grad);
                if requires_grad && !could_require_grad {
                    return Err(Error::GuardViolation(
                        config.format_guard_bug_msg("not requiring grad", i),
                    ));
                }
            }
        }

        let edges: Vec<Option<Edge>> = args
            .iter()
            .map(|arg| arg.as_tensor().and_then(Tensor::grad_edge))
            .collect();
        let fw_outs = {
            let _guard = no_grad();
            compiled_fw(args)?
        };

        let num_returns = meta.num_forward_returns();
        if fw_outs.len() < num_returns {
            return Err(Error::Invariant(format!(
                "compiled forward returned {} values, expected at least {}",
                fw_outs.len(),
                num_returns
            )));
        }
        let mut fw_outs = fw_outs;
        let saved: Vec<Value<Tensor>> = fw_outs
            .split_off(num_returns)
            .into_iter()
            .map(|value| value.map(|t| if t.is_view() { t.detach() } else { t }))
            .collect();
        trace!("compiled forward saved {} values for backward", saved.len());

        let attach = is_grad_enabled() && edges.iter().any(Option::is_some);
        let node: Rc<dyn GradNode> = Rc::new(CompiledFunctionBackward {
            meta: meta.clone(),
            backward: backward.clone(),
            saved,
            edges,
        });

        let num_mutated = meta.num_mutated_inputs();
        let num_user_returns = num_mutated + meta.num_outputs();
        let mut returns = Vec::with_capacity(num_returns);
        for (k, value) in fw_outs.into_iter().enumerate() {
            let is_alias = if k < num_mutated {
                let info = &meta.input_info[meta.mutated_inp_indices()[k]];
                !info.mutates_data
            } else if k < num_user_returns {
                meta.output_info[k - num_mutated].output_type.is_regenerated()
            } else {
                false
            };
            if is_alias {
                returns.push(GraphOutput::Alias(value.tensor()?));
                continue;
            }

            let differentiable = k >= num_user_returns || meta.requires_grad_info[k];
            match value {
                Value::Tensor(t) if attach && differentiable => {
                    let t = t.detach();
                    t.set_history(Edge::new(node.clone(), k))?;
                    returns.push(GraphOutput::Plain(Value::Tensor(t)));
                }
                other => returns.push(GraphOutput::Plain(other)),
            }
        }
        debug!(
            "compiled function returned {} values ({} aliases)",
            returns.len(),
            returns
                .iter()
                .filter(|r| matches!(r, GraphOutput::Alias(_)))
                .count()
        );
        Ok(returns)
    })
}
