pub mod autograd;
pub mod derivatives;
pub mod dispatch;
pub mod error;
pub mod interp;
pub mod kernels;
pub mod layout;
pub mod op;
pub mod storage;
pub mod tensor;
pub mod value;

pub use error::Error;
pub use interp::{flat_fn, run_eager, EagerInterpreter, FlatFn, Interpreter, TRef, Val};
pub use layout::{DType, Layout, TensorMeta};
pub use op::{Op, OpKind, ViewOp};
pub use tensor::Tensor;
pub use value::{Value, ValueKind};
