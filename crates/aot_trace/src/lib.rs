pub mod decomp;
pub mod functionalize;
pub mod graph;
pub mod joint;
pub mod partition;
pub mod pretty_print;
pub mod run_graph;

pub use graph::{Graph, NodeId, NodeKind, PlaceholderRole};
