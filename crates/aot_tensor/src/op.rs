use serde::Serialize;

use crate::error::Error;
use crate::layout::{numel, DType, Layout, TensorMeta};
use crate::value::Value;

/// An operation producing a tensor whose elements live in the storage of its input.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ViewOp {
    /// Only valid for contiguous inputs.
    Reshape(Vec<usize>),
    Transpose(usize, usize),
    Slice {
        dim: usize,
        start: usize,
        end: usize,
        step: usize,
    },
    Select {
        dim: usize,
        index: usize,
    },
    Unsqueeze(usize),
    Expand(Vec<usize>),
    /// Absolute in storage coordinates, regardless of the input's own layout.
    AsStrided(Layout),
    Alias,
    Reinterpret(DType),
}

fn check_dim(op: &'static str, dim: usize, ndim: usize) -> Result<(), Error> {
    if dim >= ndim {
        return Err(Error::invalid(
            op,
            format!("dimension {} out of range for a {}-d tensor", dim, ndim),
        ));
    }
    Ok(())
}

impl ViewOp {
    pub fn name(&self) -> &'static str {
        match self {
            ViewOp::Reshape(_) => "view",
            ViewOp::Transpose(..) => "transpose",
            ViewOp::Slice { .. } => "slice",
            ViewOp::Select { .. } => "select",
            ViewOp::Unsqueeze(_) => "unsqueeze",
            ViewOp::Expand(_) => "expand",
            ViewOp::AsStrided(_) => "as_strided",
            ViewOp::Alias => "alias",
            ViewOp::Reinterpret(_) => "view_dtype",
        }
    }

    pub fn apply(&self, input: &Layout) -> Result<Layout, Error> {
        let op = self.name();
        match self {
            ViewOp::Reshape(sizes) => {
                if numel(sizes) != input.numel() {
                    return Err(Error::ShapeMismatch {
                        op,
                        expected: input.sizes.clone(),
                        found: sizes.clone(),
                    });
                }
                if !input.is_contiguous() {
                    return Err(Error::invalid(
                        op,
                        "view size is not compatible with the input's strides; clone first",
                    ));
                }
                let mut out = Layout::contiguous(sizes);
                out.offset = input.offset;
                Ok(out)
            }

            &ViewOp::Transpose(d0, d1) => {
                check_dim(op, d0, input.ndim())?;
                check_dim(op, d1, input.ndim())?;
                let mut out = input.clone();
                out.sizes.swap(d0, d1);
                out.strides.swap(d0, d1);
                Ok(out)
            }

            &ViewOp::Slice {
                dim,
                start,
                end,
                step,
            } => {
                check_dim(op, dim, input.ndim())?;
                let end = end.min(input.sizes[dim]);
                if step == 0 || start > end {
                    return Err(Error::invalid(
                        op,
                        format!("bad range {}..{} with step {}", start, end, step),
                    ));
                }
                let mut out = input.clone();
                out.offset += start * input.strides[dim];
                out.sizes[dim] = (end - start).div_ceil(step);
                out.strides[dim] *= step;
                Ok(out)
            }

            &ViewOp::Select { dim, index } => {
                check_dim(op, dim, input.ndim())?;
                if index >= input.sizes[dim] {
                    return Err(Error::invalid(
                        op,
                        format!(
                            "index {} out of range for dimension {} of size {}",
                            index, dim, input.sizes[dim]
                        ),
                    ));
                }
                let mut out = input.clone();
                out.offset += index * input.strides[dim];
                out.sizes.remove(dim);
                out.strides.remove(dim);
                Ok(out)
            }

            &ViewOp::Unsqueeze(dim) => {
                if dim > input.ndim() {
                    return Err(Error::invalid(
                        op,
                        format!("dimension {} out of range for a {}-d tensor", dim, input.ndim()),
                    ));
                }
                let stride = if dim < input.ndim() {
                    input.sizes[dim] * input.strides[dim]
                } else {
                    1
                };
                let mut out = input.clone();
                out.sizes.insert(dim, 1);
                out.strides.insert(dim, stride);
                Ok(out)
            }

            ViewOp::Expand(sizes) => {
                if sizes.len() < input.ndim() {
                    return Err(Error::ShapeMismatch {
                        op,
                        expected: input.sizes.clone(),
                        found: sizes.clone(),
                    });
                }
                let lead = sizes.len() - input.ndim();
                let mut strides = vec![0; lead];
                for (i, (&old, &stride)) in input.sizes.iter().zip(&input.strides).enumerate() {
                    let new = sizes[lead + i];
                    if new == old {
                        strides.push(stride);
                    } else if old == 1 {
                        strides.push(0);
                    } else {
                        return Err(Error::ShapeMismatch {
                            op,
                            expected: input.sizes.clone(),
                            found: sizes.clone(),
                        });
                    }
                }
                Layout::new(sizes.clone(), strides, input.offset)
            }

            ViewOp::AsStrided(layout) => Ok(layout.clone()),

            ViewOp::Alias | ViewOp::Reinterpret(_) => Ok(input.clone()),
        }
    }

    pub fn output_dtype(&self, input: DType) -> Result<DType, Error> {
        match self {
            &ViewOp::Reinterpret(dtype) => {
                if dtype.width() != input.width() {
                    return Err(Error::invalid(
                        self.name(),
                        format!(
                            "cannot reinterpret {} as {} because their widths differ",
                            input.short_name(),
                            dtype.short_name()
                        ),
                    ));
                }
                Ok(dtype)
            }
            _ => Ok(input),
        }
    }

    pub fn apply_meta(&self, input: &TensorMeta) -> Result<TensorMeta, Error> {
        Ok(TensorMeta {
            layout: self.apply(&input.layout)?,
            dtype: self.output_dtype(input.dtype)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Op {
    Full {
        sizes: Vec<usize>,
        value: f64,
        dtype: DType,
    },
    Add,
    Sub,
    Mul,
    AddScalar(f64),
    MulScalar(f64),
    Neg,
    Sin,
    Cos,
    Sum,
    Clone,
    View(ViewOp),
    /// Reshape producing a fresh tensor which does not alias its input.
    UnsafeView(Vec<usize>),
    Detach,
    /// `(base, src)`: a copy of `base` with the elements at `layout` replaced by `src`.
    StridedScatter(Layout),
    /// `(base)`: the elements of `base` at `layout`, as a fresh tensor.
    StridedGather(Layout),
    /// `(grad)`: zeros of shape `sizes` with `grad` accumulated at `layout`.
    StridedGradient {
        sizes: Vec<usize>,
        layout: Layout,
    },

    AddInplace,
    MulInplace,
    AddScalarInplace(f64),
    MulScalarInplace(f64),
    CopyInplace,
    ZeroInplace,

    TransposeInplace(usize, usize),
    UnsqueezeInplace(usize),
    AsStridedInplace(Layout),

    Size(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OpKind {
    Full,
    Add,
    Sub,
    Mul,
    AddScalar,
    MulScalar,
    Neg,
    Sin,
    Cos,
    Sum,
    Clone,
    View,
    UnsafeView,
    Detach,
    StridedScatter,
    StridedGather,
    StridedGradient,
    AddInplace,
    MulInplace,
    AddScalarInplace,
    MulScalarInplace,
    CopyInplace,
    ZeroInplace,
    TransposeInplace,
    UnsqueezeInplace,
    AsStridedInplace,
    Size,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Full { .. } => OpKind::Full,
            Op::Add => OpKind::Add,
            Op::Sub => OpKind::Sub,
            Op::Mul => OpKind::Mul,
            Op::AddScalar(_) => OpKind::AddScalar,
            Op::MulScalar(_) => OpKind::MulScalar,
            Op::Neg => OpKind::Neg,
            Op::Sin => OpKind::Sin,
            Op::Cos => OpKind::Cos,
            Op::Sum => OpKind::Sum,
            Op::Clone => OpKind::Clone,
            Op::View(_) => OpKind::View,
            Op::UnsafeView(_) => OpKind::UnsafeView,
            Op::Detach => OpKind::Detach,
            Op::StridedScatter(_) => OpKind::StridedScatter,
            Op::StridedGather(_) => OpKind::StridedGather,
            Op::StridedGradient { .. } => OpKind::StridedGradient,
            Op::AddInplace => OpKind::AddInplace,
            Op::MulInplace => OpKind::MulInplace,
            Op::AddScalarInplace(_) => OpKind::AddScalarInplace,
            Op::MulScalarInplace(_) => OpKind::MulScalarInplace,
            Op::CopyInplace => OpKind::CopyInplace,
            Op::ZeroInplace => OpKind::ZeroInplace,
            Op::TransposeInplace(..) => OpKind::TransposeInplace,
            Op::UnsqueezeInplace(_) => OpKind::UnsqueezeInplace,
            Op::AsStridedInplace(_) => OpKind::AsStridedInplace,
            Op::Size(_) => OpKind::Size,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Full { .. } => "full",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::AddScalar(_) => "add_scalar",
            Op::MulScalar(_) => "mul_scalar",
            Op::Neg => "neg",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Sum => "sum",
            Op::Clone => "clone",
            Op::View(view) => view.name(),
            Op::UnsafeView(_) => "_unsafe_view",
            Op::Detach => "detach",
            Op::StridedScatter(_) => "strided_scatter",
            Op::StridedGather(_) => "strided_gather",
            Op::StridedGradient { .. } => "strided_gradient",
            Op::AddInplace => "add_",
            Op::MulInplace => "mul_",
            Op::AddScalarInplace(_) => "add_scalar_",
            Op::MulScalarInplace(_) => "mul_scalar_",
            Op::CopyInplace => "copy_",
            Op::ZeroInplace => "zero_",
            Op::TransposeInplace(..) => "transpose_",
            Op::UnsqueezeInplace(_) => "unsqueeze_",
            Op::AsStridedInplace(_) => "as_strided_",
            Op::Size(_) => "size",
        }
    }

    pub fn num_tensor_args(&self) -> usize {
        match self {
            Op::Full { .. } => 0,
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::StridedScatter(_)
            | Op::AddInplace
            | Op::MulInplace
            | Op::CopyInplace => 2,
            _ => 1,
        }
    }

    /// Writes to the elements of its first argument.
    pub fn mutates_data(&self) -> bool {
        matches!(
            self,
            Op::AddInplace
                | Op::MulInplace
                | Op::AddScalarInplace(_)
                | Op::MulScalarInplace(_)
                | Op::CopyInplace
                | Op::ZeroInplace
        )
    }

    /// Changes the sizes, strides or offset of its first argument.
    pub fn mutates_metadata(&self) -> bool {
        self.metadata_view().is_some()
    }

    pub fn is_mutable(&self) -> bool {
        self.mutates_data() || self.mutates_metadata()
    }

    pub fn is_view(&self) -> bool {
        matches!(self, Op::View(_))
    }

    pub fn is_differentiable(&self) -> bool {
        !matches!(self, Op::Full { .. } | Op::Size(_) | Op::Detach)
    }

    /// The out-of-place operation computing the new value of a data mutation's target, for the
    /// mutations that are just an arithmetic update of the target.
    pub fn functional_counterpart(&self) -> Option<Op> {
        match self {
            Op::AddInplace => Some(Op::Add),
            Op::MulInplace => Some(Op::Mul),
            &Op::AddScalarInplace(s) => Some(Op::AddScalar(s)),
            &Op::MulScalarInplace(s) => Some(Op::MulScalar(s)),
            _ => None,
        }
    }

    /// The view a metadata mutation turns its target into.
    pub fn metadata_view(&self) -> Option<ViewOp> {
        match self {
            &Op::TransposeInplace(d0, d1) => Some(ViewOp::Transpose(d0, d1)),
            &Op::UnsqueezeInplace(dim) => Some(ViewOp::Unsqueeze(dim)),
            Op::AsStridedInplace(layout) => Some(ViewOp::AsStrided(layout.clone())),
            _ => None,
        }
    }

    fn check_same_sizes(&self, lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), Error> {
        if lhs.sizes() != rhs.sizes() {
            return Err(Error::ShapeMismatch {
                op: self.name(),
                expected: lhs.sizes().to_vec(),
                found: rhs.sizes().to_vec(),
            });
        }
        Ok(())
    }

    fn check_fits(&self, layout: &Layout, sizes: &[usize]) -> Result<(), Error> {
        if layout.extent() > numel(sizes) {
            return Err(Error::invalid(
                self.name(),
                format!(
                    "layout {:?} addresses elements outside a tensor of shape {:?}",
                    layout, sizes
                ),
            ));
        }
        Ok(())
    }

    /// Output metadata from the metadata of the tensor arguments.
    pub fn infer_meta(&self, args: &[&TensorMeta]) -> Result<Value<TensorMeta>, Error> {
        if args.len() != self.num_tensor_args() {
            return Err(Error::invalid(
                self.name(),
                format!(
                    "expected {} tensor arguments, found {}",
                    self.num_tensor_args(),
                    args.len()
                ),
            ));
        }

        let fresh =
            |sizes: &[usize], dtype: DType| Value::Tensor(TensorMeta::contiguous(sizes, dtype));

        Ok(match self {
            Op::Full { sizes, dtype, .. } => fresh(sizes, *dtype),

            Op::Add | Op::Sub | Op::Mul => {
                self.check_same_sizes(args[0], args[1])?;
                fresh(args[0].sizes(), args[0].dtype)
            }

            Op::AddScalar(_)
            | Op::MulScalar(_)
            | Op::Neg
            | Op::Sin
            | Op::Cos
            | Op::Clone => fresh(args[0].sizes(), args[0].dtype),

            Op::Sum => fresh(&[], args[0].dtype),

            Op::View(view) => Value::Tensor(view.apply_meta(args[0])?),

            Op::UnsafeView(sizes) => {
                if numel(sizes) != numel(args[0].sizes()) {
                    return Err(Error::ShapeMismatch {
                        op: self.name(),
                        expected: args[0].sizes().to_vec(),
                        found: sizes.clone(),
                    });
                }
                fresh(sizes, args[0].dtype)
            }

            Op::Detach => Value::Tensor(args[0].clone()),

            Op::StridedScatter(layout) => {
                self.check_fits(layout, args[0].sizes())?;
                if layout.sizes != args[1].sizes() {
                    return Err(Error::ShapeMismatch {
                        op: self.name(),
                        expected: layout.sizes.clone(),
                        found: args[1].sizes().to_vec(),
                    });
                }
                fresh(args[0].sizes(), args[0].dtype)
            }

            Op::StridedGather(layout) => {
                self.check_fits(layout, args[0].sizes())?;
                fresh(&layout.sizes, args[0].dtype)
            }

            Op::StridedGradient { sizes, layout } => {
                self.check_fits(layout, sizes)?;
                if layout.sizes != args[0].sizes() {
                    return Err(Error::ShapeMismatch {
                        op: self.name(),
                        expected: layout.sizes.clone(),
                        found: args[0].sizes().to_vec(),
                    });
                }
                fresh(sizes, args[0].dtype)
            }

            Op::AddInplace | Op::MulInplace | Op::CopyInplace => {
                self.check_same_sizes(args[0], args[1])?;
                Value::Tensor(args[0].clone())
            }

            Op::AddScalarInplace(_) | Op::MulScalarInplace(_) | Op::ZeroInplace => {
                Value::Tensor(args[0].clone())
            }

            Op::TransposeInplace(..) | Op::UnsqueezeInplace(_) | Op::AsStridedInplace(_) => {
                let view = self
                    .metadata_view()
                    .ok_or_else(|| Error::Invariant("missing metadata view".to_owned()))?;
                Value::Tensor(view.apply_meta(args[0])?)
            }

            &Op::Size(dim) => {
                check_dim(self.name(), dim, args[0].layout.ndim())?;
                Value::Int(args[0].sizes()[dim] as i64)
            }
        })
    }
}
