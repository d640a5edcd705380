//! The ordered stages a function passes through on its way to a compiled artifact.
//!
//! Each stage may rewrite the function, its example arguments and their metadata before handing
//! them to the rest of the pipeline, and may wrap whatever the rest of the pipeline returns.

use std::rc::Rc;

use log::{info, trace};

use aot_tensor::{run_eager, Error, FlatFn, Tensor, Value};

use crate::analyze::run_functionalized_fw_and_collect_metadata;
use crate::compiler::CompiledFn;
use crate::config::AotConfig;
use crate::dedupe::DedupeStage;
use crate::dispatch::{aot_dispatch_autograd, aot_dispatch_base, needs_autograd};
use crate::meta::ViewAndMutationMeta;
use crate::synthetic_base::SyntheticBaseStage;

pub trait Stage {
    fn name(&self) -> &'static str;

    fn compile(
        &self,
        flat_fn: FlatFn,
        args: &[Value<Tensor>],
        config: &AotConfig,
        meta: ViewAndMutationMeta,
        next: Next<'_>,
    ) -> Result<CompiledFn, Error>;
}

/// The stages after the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Box<dyn Stage>],
}

impl<'a> Next<'a> {
    pub fn compile(
        self,
        flat_fn: FlatFn,
        args: &[Value<Tensor>],
        config: &AotConfig,
        meta: ViewAndMutationMeta,
    ) -> Result<CompiledFn, Error> {
        let Some((stage, rest)) = self.stages.split_first() else {
            return Err(Error::Invariant(
                "the last compilation stage handed its function on".to_owned(),
            ));
        };
        trace!("entering stage '{}' with {} arguments", stage.name(), args.len());
        stage.compile(flat_fn, args, config, meta, Next { stages: rest })
    }
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { stages: Vec::new() }
    }

    pub fn then(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Deduplication, then synthetic bases, then compilation with or without a backward pass.
    pub fn standard(needs_autograd: bool) -> Self {
        Pipeline::new()
            .then(DedupeStage)
            .then(SyntheticBaseStage { needs_autograd })
            .then(DispatchStage { needs_autograd })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn compile(
        &self,
        flat_fn: FlatFn,
        args: &[Value<Tensor>],
        config: &AotConfig,
        meta: ViewAndMutationMeta,
    ) -> Result<CompiledFn, Error> {
        Next {
            stages: &self.stages,
        }
        .compile(flat_fn, args, config, meta)
    }
}

/// Traces and compiles the function it receives.
pub struct DispatchStage {
    pub needs_autograd: bool,
}

impl Stage for DispatchStage {
    fn name(&self) -> &'static str {
        if self.needs_autograd {
            "dispatch_autograd"
        } else {
            "dispatch_base"
        }
    }

    fn compile(
        &self,
        flat_fn: FlatFn,
        args: &[Value<Tensor>],
        config: &AotConfig,
        meta: ViewAndMutationMeta,
        _next: Next<'_>,
    ) -> Result<CompiledFn, Error> {
        if self.needs_autograd {
            aot_dispatch_autograd(flat_fn, args, config, meta)
        } else {
            aot_dispatch_base(flat_fn, args, config, meta)
        }
    }
}

/// Runs the function it receives eagerly instead of compiling it.
pub struct EagerStage;

impl Stage for EagerStage {
    fn name(&self) -> &'static str {
        "eager"
    }

    fn compile(
        &self,
        flat_fn: FlatFn,
        _args: &[Value<Tensor>],
        _config: &AotConfig,
        _meta: ViewAndMutationMeta,
        _next: Next<'_>,
    ) -> Result<CompiledFn, Error> {
        Ok(Rc::new(move |args: Vec<Value<Tensor>>| {
            run_eager(&flat_fn, &args)
        }))
    }
}

/// Analyzes `flat_fn` on `args` and compiles it through the standard pipeline.
pub fn create_aot_dispatcher_function(
    flat_fn: FlatFn,
    args: &[Value<Tensor>],
    config: &AotConfig,
) -> Result<CompiledFn, Error> {
    let needs_autograd = needs_autograd(args);
    let keep_input_mutations = config.keep_inference_input_mutations && !needs_autograd;
    let meta = run_functionalized_fw_and_collect_metadata(
        &flat_fn,
        args,
        keep_input_mutations,
        config.unsafe_view_outputs,
    )?;
    info!(
        "compiling aot function {} ({} arguments, {})",
        config.aot_id,
        args.len(),
        if needs_autograd {
            "with backward"
        } else {
            "inference only"
        }
    );
    Pipeline::standard(needs_autograd).compile(flat_fn, args, config, meta)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::interpreter_compiler;
    use aot_tensor::flat_fn;

    struct Counting(Rc<std::cell::Cell<usize>>);

    impl Stage for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn compile(
            &self,
            flat_fn: FlatFn,
            args: &[Value<Tensor>],
            config: &AotConfig,
            meta: ViewAndMutationMeta,
            next: Next<'_>,
        ) -> Result<CompiledFn, Error> {
            self.0.set(self.0.get() + 1);
            next.compile(flat_fn, args, config, meta)
        }
    }

    fn double() -> FlatFn {
        flat_fn(|cx, args| Ok(vec![Value::Tensor(cx.mul_scalar(args[0].tensor()?, 2.0)?)]))
    }

    #[test]
    fn stages_run_in_order() {
        let count = Rc::new(std::cell::Cell::new(0));
        let pipeline = Pipeline::new()
            .then(Counting(count.clone()))
            .then(Counting(count.clone()))
            .then(EagerStage);
        assert_eq!(pipeline.stage_names(), vec!["counting", "counting", "eager"]);

        let args = vec![Value::Tensor(Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap())];
        let config = AotConfig::new(interpreter_compiler());
        let meta = run_functionalized_fw_and_collect_metadata(&double(), &args, false, false)
            .unwrap();
        let compiled = pipeline.compile(double(), &args, &config, meta).unwrap();
        assert_eq!(count.get(), 2);
        let out = compiled(args).unwrap();
        assert_eq!(out[0].tensor().unwrap().to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn a_pipeline_needs_a_terminal_stage() {
        let count = Rc::new(std::cell::Cell::new(0));
        let pipeline = Pipeline::new().then(Counting(count));
        let args = vec![Value::Tensor(Tensor::from_vec(&[1], vec![1.0]).unwrap())];
        let config = AotConfig::new(interpreter_compiler());
        let meta = run_functionalized_fw_and_collect_metadata(&double(), &args, false, false)
            .unwrap();
        assert!(matches!(
            pipeline.compile(double(), &args, &config, meta),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn standard_pipeline_compiles() {
        let args = vec![Value::Tensor(Tensor::from_vec(&[2], vec![3.0, 4.0]).unwrap())];
        let config = AotConfig::new(interpreter_compiler());
        let compiled = create_aot_dispatcher_function(double(), &args, &config).unwrap();
        let out = compiled(args).unwrap();
        assert_eq!(out[0].tensor().unwrap().to_vec(), vec![6.0, 8.0]);
        assert_eq!(
            Pipeline::standard(false).stage_names(),
            vec!["dedupe", "synthetic_base", "dispatch_base"]
        );
    }
}
