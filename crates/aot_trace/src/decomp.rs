//! Rewrites of operators into other operators, applied while tracing.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use aot_tensor::{Error, Interpreter, Op, OpKind, Val, Value};

/// Receives the operator being decomposed (for its parameters) and its arguments.
pub type Decomposition = Rc<dyn Fn(&mut dyn Interpreter, &Op, &[Val]) -> Result<Val, Error>>;

pub type DecompositionTable = FxHashMap<OpKind, Decomposition>;

fn tensor_arg(args: &[Val], index: usize) -> Result<aot_tensor::TRef, Error> {
    args.get(index)
        .ok_or_else(|| Error::Invariant(format!("decomposition is missing argument {}", index)))?
        .tensor()
}

/// `a - b` as `a + (-b)`, and `-a` as `a * -1`.
pub fn core_decompositions() -> DecompositionTable {
    let mut table = DecompositionTable::default();

    let sub: Decomposition = Rc::new(|cx: &mut dyn Interpreter, _op: &Op, args: &[Val]| {
        let a = tensor_arg(args, 0)?;
        let b = tensor_arg(args, 1)?;
        let neg_b = cx.neg(b)?;
        Ok(Value::Tensor(cx.add(a, neg_b)?))
    });
    table.insert(OpKind::Sub, sub);

    let neg: Decomposition = Rc::new(|cx: &mut dyn Interpreter, _op: &Op, args: &[Val]| {
        let a = tensor_arg(args, 0)?;
        Ok(Value::Tensor(cx.mul_scalar(a, -1.0)?))
    });
    table.insert(OpKind::Neg, neg);

    table
}
