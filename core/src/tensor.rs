//! Tensor metadata: dtype, shape and where the bytes live.
//!
//! Slots never hold pointers. A tensor names a planned buffer and an offset
//! (or a range in the program's constant segment) and the executor resolves
//! that to a slice for the duration of one op. Tensors with disjoint
//! lifetimes can therefore share planned bytes without aliasing `&mut`.

use core::ops::Range;

use crate::error::LoadError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    Int8 = 0,
    UInt8 = 1,
    Int32 = 2,
}

impl DType {
    pub fn from_code(code: u8) -> Result<Self, LoadError> {
        match code {
            0 => Ok(DType::Int8),
            1 => Ok(DType::UInt8),
            2 => Ok(DType::Int32),
            other => Err(LoadError::InvalidDType(other)),
        }
    }

    #[inline(always)]
    pub const fn size(self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 => 1,
            DType::Int32 => 4,
        }
    }
}

/// Up to 4 dimensions, unused trailing dims are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub dims: [usize; 4],
    pub ndim: usize,
}

impl Shape {
    pub const fn d1(size: usize) -> Self {
        Self { dims: [size, 0, 0, 0], ndim: 1 }
    }
    pub const fn d2(d0: usize, d1: usize) -> Self {
        Self { dims: [d0, d1, 0, 0], ndim: 2 }
    }
    pub const fn d3(c: usize, h: usize, w: usize) -> Self {
        Self { dims: [c, h, w, 0], ndim: 3 }
    }
    pub const fn d4(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { dims: [n, c, h, w], ndim: 4 }
    }

    /// Build from a dims slice, rejecting empty, over-rank, zero-sized and
    /// overflowing shapes.
    pub fn from_dims(dims: &[usize]) -> Result<Self, LoadError> {
        if dims.is_empty() || dims.len() > 4 {
            return Err(LoadError::InvalidShape);
        }
        let mut shape = Self { dims: [0; 4], ndim: dims.len() };
        shape.dims[..dims.len()].copy_from_slice(dims);
        shape.checked_total().filter(|&n| n > 0).ok_or(LoadError::InvalidShape)?;
        Ok(shape)
    }

    pub fn total(&self) -> usize {
        self.dims[..self.ndim].iter().product()
    }

    pub fn checked_total(&self) -> Option<usize> {
        self.dims[..self.ndim].iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims[..self.ndim]
    }

    /// Channel/height/width view. Rank-3 shapes map directly; rank-4 shapes
    /// are accepted when the batch dimension is 1.
    pub fn chw(&self) -> Option<(usize, usize, usize)> {
        match self.ndim {
            3 => Some((self.dims[0], self.dims[1], self.dims[2])),
            4 if self.dims[0] == 1 => Some((self.dims[1], self.dims[2], self.dims[3])),
            _ => None,
        }
    }
}

/// Where a tensor's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Inside memory-planned buffer `buffer`, starting at `offset`.
    Planned { buffer: usize, offset: usize },
    /// Inside the program's read-only constant segment.
    Constant { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSlot {
    pub dtype: DType,
    pub shape: Shape,
    pub storage: Storage,
}

impl TensorSlot {
    #[inline(always)]
    pub fn numel(&self) -> usize {
        self.shape.total()
    }

    #[inline(always)]
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    /// Byte range inside whichever region `storage` names.
    pub fn byte_range(&self) -> Range<usize> {
        let start = match self.storage {
            Storage::Planned { offset, .. } | Storage::Constant { offset } => offset,
        };
        start..start + self.nbytes()
    }

    pub fn is_planned(&self) -> bool {
        matches!(self.storage, Storage::Planned { .. })
    }

    /// True when both slots share bytes of the same planned buffer.
    pub fn overlaps(&self, other: &TensorSlot) -> bool {
        match (self.storage, other.storage) {
            (Storage::Planned { buffer: a, .. }, Storage::Planned { buffer: b, .. }) if a == b => {
                let (x, y) = (self.byte_range(), other.byte_range());
                x.start < y.end && y.start < x.end
            }
            _ => false,
        }
    }
}

/// One entry of a method's value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Tensor(TensorSlot),
    Int(i32),
}

impl Value {
    pub fn as_tensor(&self) -> Option<&TensorSlot> {
        match self {
            Value::Tensor(t) => Some(t),
            Value::Int(_) => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_views() {
        let s = Shape::d4(1, 1, 28, 28);
        assert_eq!(s.total(), 784);
        assert_eq!(s.chw(), Some((1, 28, 28)));
        assert_eq!(Shape::d4(2, 1, 28, 28).chw(), None);
        assert_eq!(Shape::d2(10, 784).chw(), None);
    }

    #[test]
    fn from_dims_rejects_degenerate_shapes() {
        assert_eq!(Shape::from_dims(&[]), Err(LoadError::InvalidShape));
        assert_eq!(Shape::from_dims(&[1, 2, 3, 4, 5]), Err(LoadError::InvalidShape));
        assert_eq!(Shape::from_dims(&[4, 0]), Err(LoadError::InvalidShape));
        assert_eq!(Shape::from_dims(&[usize::MAX, 2]), Err(LoadError::InvalidShape));
        assert_eq!(Shape::from_dims(&[3, 4]), Ok(Shape::d2(3, 4)));
    }

    #[test]
    fn slot_byte_range_uses_dtype_size() {
        let slot = TensorSlot {
            dtype: DType::Int32,
            shape: Shape::d1(10),
            storage: Storage::Planned { buffer: 1, offset: 64 },
        };
        assert_eq!(slot.nbytes(), 40);
        assert_eq!(slot.byte_range(), 64..104);
    }
}
