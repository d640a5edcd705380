pub mod alias;
pub mod analyze;
pub mod bridge;
pub mod compile_context;
pub mod compiler;
pub mod config;
pub mod dedupe;
pub mod dispatch;
pub mod entry;
pub mod graph_builder;
pub mod meta;
pub mod pipeline;
pub mod pytree;
pub mod runtime_wrapper;
pub mod synthetic_base;

pub use analyze::run_functionalized_fw_and_collect_metadata;
pub use compiler::{
    interpreter_compiler, make_boxed_compiler, make_boxed_func, recording_compiler, CompiledFn,
    Compiler, GraphSink,
};
pub use config::AotConfig;
pub use entry::{aot_function, aot_module, aot_module_simplified, tree_fn, Module, ModuleFn};
pub use meta::{InputAliasInfo, OutputAliasInfo, OutputType, ViewAndMutationMeta};
pub use pipeline::create_aot_dispatcher_function;
pub use pytree::{Tree, TreeSpec};
