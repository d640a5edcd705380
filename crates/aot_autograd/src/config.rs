use std::fmt;
use std::rc::Rc;

use aot_common::lines;
use aot_tensor::Error;
use aot_trace::decomp::DecompositionTable;
use aot_trace::partition::default_partition;
use aot_trace::Graph;

use crate::compile_context::next_aot_id;
use crate::compiler::Compiler;

/// Splits a joint graph into forward and backward graphs, given how many of the joint graph's
/// outputs belong to the forward pass.
pub type PartitionFn = Rc<dyn Fn(&Graph, usize) -> Result<(Graph, Graph), Error>>;

/// Everything a compilation needs from its embedder.
#[derive(Clone)]
pub struct AotConfig {
    pub fw_compiler: Compiler,
    pub bw_compiler: Compiler,
    /// Used for graphs that need no backward pass. Falls back to `fw_compiler`.
    pub inference_compiler: Option<Compiler>,
    pub partition_fn: PartitionFn,
    pub decompositions: DecompositionTable,
    /// How many leading arguments are parameters or buffers.
    pub num_params_buffers: usize,
    pub aot_id: usize,
    /// Leave data-only input mutations in inference graphs as a final `copy_`.
    pub keep_inference_input_mutations: bool,
    pub dynamic_shapes: bool,
    /// Return a view of an intermediate as a fresh tensor when no other output shares its storage.
    pub unsafe_view_outputs: bool,
    /// Re-run analysis after rewriting arguments, and check runtime arguments against their
    /// compile-time description.
    pub debug_assert: bool,
}

impl AotConfig {
    /// A configuration compiling every graph with `compiler`.
    pub fn new(compiler: Compiler) -> Self {
        AotConfig {
            fw_compiler: compiler.clone(),
            bw_compiler: compiler,
            inference_compiler: None,
            partition_fn: Rc::new(default_partition),
            decompositions: DecompositionTable::default(),
            num_params_buffers: 0,
            aot_id: next_aot_id(),
            keep_inference_input_mutations: false,
            dynamic_shapes: false,
            unsafe_view_outputs: false,
            debug_assert: cfg!(debug_assertions),
        }
    }

    pub fn inference_compiler(&self) -> &Compiler {
        self.inference_compiler.as_ref().unwrap_or(&self.fw_compiler)
    }

    /// Names argument `i` the way the embedder numbers it.
    pub fn describe_input(&self, i: usize) -> String {
        if i < self.num_params_buffers {
            format!("parameter/buffer {}", i)
        } else {
            format!("input {}", i - self.num_params_buffers)
        }
    }

    /// A guard violation message for an assumption about argument `i` which no longer holds.
    pub fn format_guard_bug_msg(&self, expected: &str, i: usize) -> String {
        format!(
            lines![
                "At compilation time, {} was {} but it is no longer.",
                "",
                "The code deciding to reuse this compiled artifact should have checked this \
                 condition. Please report this as a bug.",
            ],
            self.describe_input(i),
            expected
        )
    }
}

impl fmt::Debug for AotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AotConfig")
            .field("aot_id", &self.aot_id)
            .field("num_params_buffers", &self.num_params_buffers)
            .field(
                "keep_inference_input_mutations",
                &self.keep_inference_input_mutations,
            )
            .field("dynamic_shapes", &self.dynamic_shapes)
            .field("unsafe_view_outputs", &self.unsafe_view_outputs)
            .field("debug_assert", &self.debug_assert)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::interpreter_compiler;

    #[test]
    fn inputs_are_described_relative_to_parameters() {
        let mut config = AotConfig::new(interpreter_compiler());
        config.num_params_buffers = 2;
        assert_eq!(config.describe_input(1), "parameter/buffer 1");
        assert_eq!(config.describe_input(3), "input 1");
        let msg = config.format_guard_bug_msg("a duplicate of input 0", 3);
        assert!(msg.starts_with("At compilation time, input 1 was a duplicate of input 0"));
    }
}
