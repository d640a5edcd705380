use serde::Serialize;

use crate::error::Error;

/// Element type tag. Values are always stored as `f64`; the tag only determines which
/// reinterpretations are legal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    pub fn width(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn short_name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
        }
    }
}

pub fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; sizes.len()];
    let mut acc = 1;
    for (stride, &size) in strides.iter_mut().zip(sizes).rev() {
        *stride = acc;
        acc *= size.max(1);
    }
    strides
}

pub fn numel(sizes: &[usize]) -> usize {
    sizes.iter().product()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Layout {
    pub sizes: Vec<usize>,
    pub strides: Vec<usize>,
    pub offset: usize,
}

impl Layout {
    pub fn contiguous(sizes: &[usize]) -> Self {
        Layout {
            sizes: sizes.to_vec(),
            strides: contiguous_strides(sizes),
            offset: 0,
        }
    }

    pub fn new(sizes: Vec<usize>, strides: Vec<usize>, offset: usize) -> Result<Self, Error> {
        if sizes.len() != strides.len() {
            return Err(Error::invalid(
                "as_strided",
                format!(
                    "{} sizes were given but {} strides",
                    sizes.len(),
                    strides.len()
                ),
            ));
        }
        Ok(Layout {
            sizes,
            strides,
            offset,
        })
    }

    pub fn ndim(&self) -> usize {
        self.sizes.len()
    }

    pub fn numel(&self) -> usize {
        numel(&self.sizes)
    }

    /// Dimensions of size one never affect which elements are addressed, so their strides are
    /// ignored.
    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.sizes);
        self.sizes
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&size, (&stride, &want))| size <= 1 || stride == want)
    }

    /// Storage positions of every element, in row-major logical order.
    pub fn positions(&self) -> Vec<usize> {
        let count = self.numel();
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }

        let ndim = self.ndim();
        let mut index = vec![0usize; ndim];
        let mut pos = self.offset;
        for _ in 0..count {
            out.push(pos);
            let mut dim = ndim;
            while dim > 0 {
                dim -= 1;
                index[dim] += 1;
                pos += self.strides[dim];
                if index[dim] < self.sizes[dim] {
                    break;
                }
                pos -= self.strides[dim] * self.sizes[dim];
                index[dim] = 0;
            }
        }
        out
    }

    /// One past the largest storage position addressed, or zero for an empty layout.
    pub fn extent(&self) -> usize {
        if self.numel() == 0 {
            return 0;
        }
        self.offset
            + self
                .sizes
                .iter()
                .zip(&self.strides)
                .map(|(&size, &stride)| (size - 1) * stride)
                .sum::<usize>()
            + 1
    }

    pub fn has_internal_overlap(&self) -> bool {
        let mut positions = self.positions();
        positions.sort_unstable();
        positions.windows(2).any(|pair| pair[0] == pair[1])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TensorMeta {
    pub layout: Layout,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn contiguous(sizes: &[usize], dtype: DType) -> Self {
        TensorMeta {
            layout: Layout::contiguous(sizes),
            dtype,
        }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.layout.sizes
    }

    /// Shape and dtype only; strides and offset are a backend decision.
    pub fn same_shape(&self, other: &TensorMeta) -> bool {
        self.layout.sizes == other.layout.sizes && self.dtype == other.dtype
    }
}

impl std::fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.dtype.short_name(), self.layout.sizes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transposed_positions() {
        let layout = Layout::new(vec![3, 2], vec![1, 3], 0).unwrap();
        assert_eq!(layout.positions(), vec![0, 3, 1, 4, 2, 5]);
        assert!(!layout.is_contiguous());
        assert_eq!(layout.extent(), 6);
    }

    #[test]
    fn scalar_layout_has_one_position() {
        let layout = Layout::new(vec![], vec![], 4).unwrap();
        assert_eq!(layout.positions(), vec![4]);
        assert_eq!(layout.extent(), 5);
    }

    #[test]
    fn expanded_layouts_overlap() {
        let layout = Layout::new(vec![2, 3], vec![0, 1], 0).unwrap();
        assert!(layout.has_internal_overlap());
        assert!(!Layout::contiguous(&[2, 3]).has_internal_overlap());
    }
}
