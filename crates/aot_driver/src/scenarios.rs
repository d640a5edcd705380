//! Small programs exercising each aliasing and mutation pattern, compiled and compared against
//! eager execution.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use log::{debug, info};
use serde::Serialize;

use aot_autograd::dispatch::needs_autograd;
use aot_autograd::{
    create_aot_dispatcher_function, interpreter_compiler, recording_compiler,
    run_functionalized_fw_and_collect_metadata, AotConfig, GraphSink, ViewAndMutationMeta,
};
use aot_common::config::ArtifactDir;
use aot_tensor::autograd;
use aot_tensor::dispatch;
use aot_tensor::{flat_fn, run_eager, Error, FlatFn, Op, Tensor, Value, ViewOp};
use aot_trace::pretty_print::write_graph;

use crate::cli::CompileOptions;
use crate::ErrorKind;

/// Arguments to a scenario, and the leaves whose gradients are compared.
pub struct Inputs {
    pub args: Vec<Value<Tensor>>,
    pub leaves: Vec<Tensor>,
}

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub f: fn() -> FlatFn,
    /// Called once per run, so that the compiled and eager runs see identical but separate data.
    pub inputs: fn() -> Result<Inputs, Error>,
}

fn tensor(sizes: &[usize], data: &[f64]) -> Result<Tensor, Error> {
    Tensor::from_vec(sizes, data.to_vec())
}

fn leaf(sizes: &[usize], data: &[f64]) -> Result<Tensor, Error> {
    let t = tensor(sizes, data)?;
    t.set_requires_grad(true)?;
    Ok(t)
}

fn eager(op: Op, t: &Tensor) -> Result<Tensor, Error> {
    dispatch::call(&op, &[Value::Tensor(t.clone())])?.tensor()
}

fn plain(args: Vec<Tensor>) -> Inputs {
    Inputs {
        args: args.into_iter().map(Value::Tensor).collect(),
        leaves: Vec::new(),
    }
}

fn mul_then_scale() -> FlatFn {
    flat_fn(|cx, args| {
        let x = args[0].tensor()?;
        cx.mul_scalar_(x, 2.0)?;
        Ok(vec![Value::Tensor(cx.mul_scalar(x, 3.0)?)])
    })
}

fn mutate_first_read_second() -> FlatFn {
    flat_fn(|cx, args| {
        let a = args[0].tensor()?;
        let b = args[1].tensor()?;
        cx.mul_scalar_(a, 2.0)?;
        Ok(vec![Value::Tensor(cx.add_scalar(b, 1.0)?)])
    })
}

pub static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "mutate_input",
        description: "x.mul_(2); return x * 3",
        f: mul_then_scale,
        inputs: || Ok(plain(vec![tensor(&[3], &[1.0, 2.0, 3.0])?])),
    },
    Scenario {
        name: "mutate_input_grad",
        description: "x.mul_(2); return x * 3, where x is a non-leaf requiring grad",
        f: mul_then_scale,
        inputs: || {
            let x = leaf(&[3], &[1.0, 2.0, 3.0])?;
            let y = eager(Op::MulScalar(1.0), &x)?;
            Ok(Inputs {
                args: vec![Value::Tensor(y)],
                leaves: vec![x],
            })
        },
    },
    Scenario {
        name: "alias_outputs",
        description: "return (x.t(), (x * 2).view(-1))",
        f: || {
            flat_fn(|cx, args| {
                let x = args[0].tensor()?;
                let out1 = cx.t(x)?;
                let tmp = cx.mul_scalar(x, 2.0)?;
                let out2 = cx.flatten(tmp)?;
                Ok(vec![Value::Tensor(out1), Value::Tensor(out2)])
            })
        },
        inputs: || {
            let x = leaf(&[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
            Ok(Inputs {
                args: vec![Value::Tensor(x.clone())],
                leaves: vec![x],
            })
        },
    },
    Scenario {
        name: "duplicate_args",
        description: "return a * b, called as f(x, x)",
        f: || {
            flat_fn(|cx, args| {
                let a = args[0].tensor()?;
                let b = args[1].tensor()?;
                Ok(vec![Value::Tensor(cx.mul(a, b)?)])
            })
        },
        inputs: || {
            let x = leaf(&[3], &[1.0, 2.0, 3.0])?;
            Ok(Inputs {
                args: vec![Value::Tensor(x.clone()), Value::Tensor(x.clone())],
                leaves: vec![x],
            })
        },
    },
    Scenario {
        name: "mutated_duplicate_args",
        description: "a.mul_(2); return a + b, called as f(x, x)",
        f: || {
            flat_fn(|cx, args| {
                let a = args[0].tensor()?;
                let b = args[1].tensor()?;
                cx.mul_scalar_(a, 2.0)?;
                Ok(vec![Value::Tensor(cx.add(a, b)?)])
            })
        },
        inputs: || {
            let x = tensor(&[3], &[1.0, 2.0, 3.0])?;
            Ok(plain(vec![x.clone(), x]))
        },
    },
    Scenario {
        name: "aliased_inputs",
        description: "a.mul_(2); return b + 1, called as f(a, a.view(-1))",
        f: mutate_first_read_second,
        inputs: || {
            let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
            let b = eager(Op::View(ViewOp::Reshape(vec![4])), &a)?;
            Ok(plain(vec![a, b]))
        },
    },
    Scenario {
        name: "aliased_inputs_grad",
        description: "a.mul_(2); return b + 1, called as f(a, a.view(-1)) with a requiring grad",
        f: mutate_first_read_second,
        inputs: || {
            let x = leaf(&[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
            let a = eager(Op::MulScalar(1.0), &x)?;
            let b = eager(Op::View(ViewOp::Reshape(vec![4])), &a)?;
            Ok(Inputs {
                args: vec![Value::Tensor(a), Value::Tensor(b)],
                leaves: vec![x],
            })
        },
    },
    Scenario {
        name: "metadata_mutation",
        description: "x.t_(); return x * 2",
        f: || {
            flat_fn(|cx, args| {
                let x = args[0].tensor()?;
                cx.t_(x)?;
                Ok(vec![Value::Tensor(cx.mul_scalar(x, 2.0)?)])
            })
        },
        inputs: || Ok(plain(vec![tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?])),
    },
    Scenario {
        name: "view_mutation",
        description: "x[1:3].mul_(-1); return (x + y, x[1:3])",
        f: || {
            flat_fn(|cx, args| {
                let x = args[0].tensor()?;
                let y = args[1].tensor()?;
                let v = cx.slice(x, 0, 1, 3, 1)?;
                cx.mul_scalar_(v, -1.0)?;
                Ok(vec![Value::Tensor(cx.add(x, y)?), Value::Tensor(v)])
            })
        },
        inputs: || {
            Ok(plain(vec![
                tensor(&[4], &[1.0, 2.0, 3.0, 4.0])?,
                tensor(&[4], &[0.5, 0.5, 0.5, 0.5])?,
            ]))
        },
    },
];

pub fn names() -> Vec<&'static str> {
    SCENARIOS.iter().map(|s| s.name).collect()
}

pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

#[derive(Clone, Debug, Serialize)]
pub struct Outcome {
    pub name: &'static str,
    pub meta: ViewAndMutationMeta,
    /// Names of the compiled graphs, in compilation order.
    pub graphs: Vec<String>,
    /// The first difference from eager execution, if any.
    pub mismatch: Option<String>,
}

fn compare_values(
    what: &str,
    found: &[Value<Tensor>],
    expected: &[Value<Tensor>],
) -> Option<String> {
    if found.len() != expected.len() {
        return Some(format!(
            "{} has {} values, expected {}",
            what,
            found.len(),
            expected.len()
        ));
    }
    for (i, (a, b)) in found.iter().zip(expected).enumerate() {
        match (a, b) {
            (Value::Tensor(a), Value::Tensor(b)) => {
                if let Some(diff) = compare_tensors(a, b) {
                    return Some(format!("{} {}: {}", what, i, diff));
                }
            }
            (a, b) if a.kind() != b.kind() => {
                return Some(format!("{} {} is a {:?}, expected {:?}", what, i, a.kind(), b.kind()))
            }
            _ => {}
        }
    }
    None
}

fn compare_tensors(found: &Tensor, expected: &Tensor) -> Option<String> {
    if found.sizes() != expected.sizes() {
        return Some(format!(
            "sizes {:?}, expected {:?}",
            found.sizes(),
            expected.sizes()
        ));
    }
    if found.requires_grad() != expected.requires_grad() {
        return Some(format!(
            "requires_grad is {}, expected {}",
            found.requires_grad(),
            expected.requires_grad()
        ));
    }
    let (a, b) = (found.to_vec(), expected.to_vec());
    if a.iter().zip(&b).any(|(x, y)| (x - y).abs() > 1e-9) {
        return Some(format!("values {:?}, expected {:?}", a, b));
    }
    None
}

/// Gradients of the sum of every grad-tracking output with respect to `leaves`.
fn gradients(outputs: &[Value<Tensor>], leaves: &[Tensor]) -> Result<Vec<Value<Tensor>>, Error> {
    let outputs: Vec<Tensor> = outputs
        .iter()
        .filter_map(|out| out.as_tensor())
        .filter(|out| out.requires_grad())
        .cloned()
        .collect();
    if outputs.is_empty() || leaves.is_empty() {
        return Ok(Vec::new());
    }
    let ones = outputs
        .iter()
        .map(|out| Tensor::from_vec(&out.sizes(), vec![1.0; out.numel()]).map(Some))
        .collect::<Result<Vec<_>, _>>()?;
    let grads = autograd::grad(&outputs, &ones, leaves, false)?;
    Ok(grads
        .into_iter()
        .map(|grad| grad.map_or(Value::None, Value::Tensor))
        .collect())
}

fn write_artifacts(
    artifact_dir: &ArtifactDir,
    outcome: &Outcome,
    sink: &GraphSink,
) -> io::Result<()> {
    let dir = artifact_dir.nested(outcome.name);
    for (name, graph) in sink.graphs() {
        let mut file = BufWriter::new(File::create(dir.nested(&name).artifact_path("graph"))?);
        write_graph(&mut file, &graph)?;
        file.flush()?;
    }
    let file = BufWriter::new(File::create(dir.artifact_path("json"))?);
    serde_json::to_writer_pretty(file, outcome)?;
    Ok(())
}

/// Compiles `scenario` and runs it alongside an eager run on the same data.
pub fn run_scenario(
    scenario: &'static Scenario,
    options: CompileOptions,
    artifact_dir: Option<&ArtifactDir>,
) -> Result<Outcome, crate::Error> {
    let outcome = compile_and_compare(scenario, options).map_err(|err| ErrorKind::Aot {
        scenario: scenario.name,
        err,
    })?;
    if let Some(dir) = artifact_dir {
        write_artifacts(dir, &outcome.0, &outcome.1).map_err(ErrorKind::Artifact)?;
    }
    Ok(outcome.0)
}

fn compile_and_compare(
    scenario: &'static Scenario,
    options: CompileOptions,
) -> Result<(Outcome, GraphSink), Error> {
    let f = (scenario.f)();

    let eager_inputs = (scenario.inputs)()?;
    let expected = run_eager(&f, &eager_inputs.args)?;
    let expected_grads = gradients(&expected, &eager_inputs.leaves)?;

    let inputs = (scenario.inputs)()?;
    let sink = GraphSink::new();
    let mut config = AotConfig::new(recording_compiler(&sink, interpreter_compiler()));
    config.keep_inference_input_mutations = options.keep_input_mutations;
    config.unsafe_view_outputs = options.unsafe_view_outputs;
    config.debug_assert = true;

    let keep_input_mutations = options.keep_input_mutations && !needs_autograd(&inputs.args);
    let meta = run_functionalized_fw_and_collect_metadata(
        &f,
        &inputs.args,
        keep_input_mutations,
        options.unsafe_view_outputs,
    )?;
    debug!("scenario {} analyzed as {:?}", scenario.name, meta);

    let compiled = create_aot_dispatcher_function(f, &inputs.args, &config)?;
    let found = compiled(inputs.args.clone())?;
    let found_grads = gradients(&found, &inputs.leaves)?;

    let mismatch = compare_values("output", &found, &expected)
        .or_else(|| compare_values("input", &inputs.args, &eager_inputs.args))
        .or_else(|| compare_values("gradient", &found_grads, &expected_grads));
    info!(
        "scenario {}: {}",
        scenario.name,
        mismatch.as_deref().unwrap_or("matches eager execution")
    );

    let outcome = Outcome {
        name: scenario.name,
        meta,
        graphs: sink.graphs().into_iter().map(|(name, _)| name).collect(),
        mismatch,
    };
    Ok((outcome, sink))
}
