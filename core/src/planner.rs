//! Hierarchical planned-memory allocator.
//!
//! The model compiler decides which activations share bytes; the runtime only
//! materializes one span per planned buffer index, at exactly the declared
//! size. Span `i` is handed to every tensor whose slot names buffer `i`.

use core::ops::Range;

use log::debug;

use crate::arena::Arena;
use crate::error::{BindingError, RuntimeResult};
use crate::program::MethodMeta;

pub struct PlannedBufferSet<'a> {
    spans: &'a mut [&'a mut [u8]],
}

impl<'a> PlannedBufferSet<'a> {
    /// Wrap spans the caller carved out itself.
    pub fn from_spans(spans: &'a mut [&'a mut [u8]]) -> Self {
        Self { spans }
    }

    /// One span per buffer declared by `meta`. The span table lives in
    /// `method_arena`, the spans themselves in `planned_arena`.
    pub fn allocate(
        meta: &MethodMeta<'_>,
        method_arena: &mut Arena<'a>,
        planned_arena: &mut Arena<'a>,
        align: usize,
    ) -> RuntimeResult<Self> {
        let count = meta.num_memory_planned_buffers();
        let spans = method_arena.alloc_with(count, |i| {
            let size = meta.memory_planned_buffer_size(i)?;
            planned_arena.allocate(size, align)
        })?;
        debug!(
            "planned {} buffers, {} of {} planned bytes used",
            count,
            planned_arena.used(),
            planned_arena.capacity()
        );
        Ok(Self { spans })
    }

    /// Reject a set whose count or any span size differs from what `meta`
    /// declares.
    pub fn check(&self, meta: &MethodMeta<'_>) -> RuntimeResult<()> {
        if self.spans.len() != meta.num_memory_planned_buffers() {
            return Err(BindingError::PlannedBufferMismatch { reason: "buffer count differs" }.into());
        }
        for (i, span) in self.spans.iter().enumerate() {
            if span.len() != meta.memory_planned_buffer_size(i)? {
                return Err(BindingError::PlannedBufferMismatch { reason: "buffer size differs" }.into());
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn size(&self, index: usize) -> Option<usize> {
        self.spans.get(index).map(|s| s.len())
    }

    pub fn total_bytes(&self) -> usize {
        self.spans.iter().map(|s| s.len()).sum()
    }

    pub fn span(&self, index: usize) -> Option<&[u8]> {
        self.spans.get(index).map(|s| &**s)
    }

    pub fn span_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.spans.get_mut(index).map(|s| &mut **s)
    }

    /// Zero every span.
    pub fn clear(&mut self) {
        for span in self.spans.iter_mut() {
            span.fill(0);
        }
    }

    /// Shared view of `read` and exclusive view of `write` at the same time.
    /// `None` if either range is out of bounds or they overlap.
    pub fn split(
        &mut self,
        read: (usize, Range<usize>),
        write: (usize, Range<usize>),
    ) -> Option<(&[u8], &mut [u8])> {
        let ((rb, rr), (wb, wr)) = (read, write);
        if rb == wb {
            let span = &mut **self.spans.get_mut(rb)?;
            if rr.end <= wr.start {
                let (lo, hi) = span.split_at_mut(wr.start);
                Some((lo.get(rr)?, hi.get_mut(..wr.end - wr.start)?))
            } else if wr.end <= rr.start {
                let (lo, hi) = span.split_at_mut(rr.start);
                Some((&*hi.get(..rr.end - rr.start)?, lo.get_mut(wr)?))
            } else {
                None
            }
        } else if rb < wb {
            let (lo, hi) = self.spans.split_at_mut(wb);
            Some((lo.get(rb)?.get(rr)?, hi.first_mut()?.get_mut(wr)?))
        } else {
            let (lo, hi) = self.spans.split_at_mut(rb);
            Some((hi.first()?.get(rr)?, lo.get_mut(wb)?.get_mut(wr)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_within_one_span() {
        let mut a = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let mut spans = [&mut a[..]];
        let mut set = PlannedBufferSet::from_spans(&mut spans);

        let (src, dst) = set.split((0, 0..4), (0, 4..8)).unwrap();
        dst.copy_from_slice(src);
        assert_eq!(set.span(0).unwrap(), &[0, 1, 2, 3, 0, 1, 2, 3]);

        let (src, dst) = set.split((0, 6..8), (0, 0..2)).unwrap();
        assert_eq!(src, &[2, 3]);
        dst.fill(9);
        assert_eq!(set.span(0).unwrap()[..2], [9, 9]);

        assert!(set.split((0, 0..4), (0, 3..5)).is_none());
        assert!(set.split((0, 0..4), (0, 6..10)).is_none());
    }

    #[test]
    fn split_across_spans_in_either_order() {
        let mut a = [1u8; 4];
        let mut b = [2u8; 4];
        let mut spans = [&mut a[..], &mut b[..]];
        let mut set = PlannedBufferSet::from_spans(&mut spans);

        let (src, dst) = set.split((1, 0..2), (0, 2..4)).unwrap();
        dst.copy_from_slice(src);
        let (src, dst) = set.split((0, 0..4), (1, 0..4)).unwrap();
        dst.copy_from_slice(src);
        assert_eq!(set.span(1).unwrap(), &[1, 1, 2, 2]);
        assert!(set.split((2, 0..1), (0, 0..1)).is_none());
    }

    #[test]
    fn clear_zeroes_every_span() {
        let mut a = [5u8; 3];
        let mut b = [6u8; 2];
        let mut spans = [&mut a[..], &mut b[..]];
        let mut set = PlannedBufferSet::from_spans(&mut spans);
        set.clear();
        assert_eq!(set.total_bytes(), 5);
        assert!(set.span(0).unwrap().iter().chain(set.span(1).unwrap()).all(|&b| b == 0));
    }
}
