//! Regenerating a view from a (possibly different) base tensor.

use im_rc::Vector;

use aot_tensor::{Error, Interpreter, TRef, Tensor, TensorMeta, ViewOp};

/// Enough about a tensor to recreate it as a view of another tensor on the same storage.
#[derive(Clone, Debug)]
pub struct ViewDescriptor {
    pub meta: TensorMeta,
    pub requires_grad: bool,
    /// The root the tensor was viewed from, and the views leading from it to the tensor.
    pub base: Option<(TensorMeta, Vector<ViewOp>)>,
}

impl ViewDescriptor {
    pub fn of(tensor: &Tensor) -> Self {
        ViewDescriptor {
            meta: tensor.meta(),
            requires_grad: tensor.requires_grad(),
            base: tensor
                .view_info()
                .map(|info| (info.base.meta(), info.chain)),
        }
    }
}

fn replay(
    cx: &mut dyn Interpreter,
    base: TRef,
    base_meta: &TensorMeta,
    chain: &Vector<ViewOp>,
) -> Result<TRef, Error> {
    let actual = cx.meta(base);
    let mut out = if actual == *base_meta {
        base
    } else {
        cx.as_strided(base, base_meta.layout.clone())?
    };
    for view in chain {
        out = cx.view_op(out, view.clone())?;
    }
    Ok(out)
}

fn adjust_requires_grad(
    cx: &mut dyn Interpreter,
    base: TRef,
    out: TRef,
    target_requires_grad: bool,
) -> Result<TRef, Error> {
    let base_requires_grad = cx.requires_grad(base);
    if base_requires_grad && !target_requires_grad {
        return cx.detach(out);
    }
    if !base_requires_grad && target_requires_grad {
        cx.set_requires_grad(out, true)?;
    }
    Ok(out)
}

/// Recreates `target` as a view of `base`, which must share its storage.
///
/// Replays the view chain that produced `target` when there is one, since that preserves how the
/// view was derived. Falls back to `as_strided` with the target's layout when replay fails or
/// produces the wrong shape.
pub fn gen_alias_from_base(
    cx: &mut dyn Interpreter,
    base: TRef,
    target: &ViewDescriptor,
    target_requires_grad: bool,
) -> Result<TRef, Error> {
    if let Some((base_meta, chain)) = &target.base {
        if let Ok(out) = replay(cx, base, base_meta, chain) {
            if cx.meta(out).sizes() == target.meta.sizes() {
                return adjust_requires_grad(cx, base, out, target_requires_grad);
            }
        }
    }

    let mut source = base;
    if cx.meta(base).dtype != target.meta.dtype {
        source = cx.view_dtype(base, target.meta.dtype)?;
    }
    let out = cx.as_strided(source, target.meta.layout.clone())?;
    adjust_requires_grad(cx, base, out, target_requires_grad)
}
