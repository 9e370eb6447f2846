//! Static arena pools and the bump allocator that carves them up.
//!
//! MCUs have no heap. Every byte the runtime touches lives in one of three
//! fixed regions sized at build time: the method pool (loader bookkeeping),
//! the planned pool (tensor storage) and an optional temp pool (per-op
//! scratch). An [`Arena`] hands out sub-slices of one region and never frees
//! them; the borrow checker ties every allocation to the region's lifetime.

use core::mem::{align_of, size_of};

use crate::config::ARENA_ALIGN;
use crate::error::{RuntimeError, RuntimeResult};

/// Compile-time sized, 16-byte aligned byte region.
///
/// Meant to live in a `static` (or `.bss.noinit` section) for the whole
/// program; the runtime only ever borrows it.
#[repr(C, align(16))]
pub struct StaticArena<const N: usize> {
    bytes: [u8; N],
}

static_assertions::const_assert_eq!(align_of::<StaticArena<1>>(), ARENA_ALIGN);

impl<const N: usize> StaticArena<N> {
    pub const CAPACITY: usize = N;

    pub const fn new() -> Self {
        Self { bytes: [0u8; N] }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl<const N: usize> Default for StaticArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three regions handed to the runtime. `temp` is optional: programs
/// without scratch-hungry ops (no Conv2D) run fine without it.
pub struct ArenaPools<'a> {
    pub method: &'a mut [u8],
    pub planned: &'a mut [u8],
    pub temp: Option<&'a mut [u8]>,
}

impl<'a> ArenaPools<'a> {
    pub fn new(method: &'a mut [u8], planned: &'a mut [u8], temp: Option<&'a mut [u8]>) -> Self {
        Self { method, planned, temp }
    }
}

/// Method, planned and temp pools bundled into one static.
///
/// ```ignore
/// static mut POOLS: StaticPools<{ 512 * 1024 }, { 512 * 1024 }, { 256 * 1024 }> =
///     StaticPools::new();
/// let pools = unsafe { (*core::ptr::addr_of_mut!(POOLS)).split() };
/// ```
pub struct StaticPools<const M: usize, const P: usize, const T: usize> {
    method: StaticArena<M>,
    planned: StaticArena<P>,
    temp: StaticArena<T>,
}

impl<const M: usize, const P: usize, const T: usize> StaticPools<M, P, T> {
    pub const fn new() -> Self {
        Self {
            method: StaticArena::new(),
            planned: StaticArena::new(),
            temp: StaticArena::new(),
        }
    }

    /// Borrow the three regions. A zero-sized temp pool is reported as absent.
    pub fn split(&mut self) -> ArenaPools<'_> {
        let temp = if T == 0 { None } else { Some(self.temp.as_mut_slice()) };
        ArenaPools {
            method: self.method.as_mut_slice(),
            planned: self.planned.as_mut_slice(),
            temp,
        }
    }
}

impl<const M: usize, const P: usize, const T: usize> Default for StaticPools<M, P, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bump allocator over a borrowed byte region.
///
/// Allocation splits the free tail of the region, so every returned slice is
/// disjoint from every other one for the full lifetime `'a`. There is no
/// `free`; the region comes back only when the borrow ends.
pub struct Arena<'a> {
    free: &'a mut [u8],
    capacity: usize,
    offset: usize,
}

impl<'a> Arena<'a> {
    /// Create a new arena from a mutable byte buffer.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let capacity = buf.len();
        Self { free: buf, capacity, offset: 0 }
    }

    /// Carve `size` bytes aligned to `align` out of the arena, zero-filled.
    ///
    /// # Panics
    /// If `align` is not a power of two. That is a programming error, not a
    /// capacity problem, and is never recoverable.
    pub fn allocate(&mut self, size: usize, align: usize) -> RuntimeResult<&'a mut [u8]> {
        assert!(align.is_power_of_two(), "arena alignment must be a power of two, got {align}");

        let addr = self.free.as_ptr() as usize;
        let pad = addr.wrapping_neg() & (align - 1);
        let available = self.free.len().saturating_sub(pad);
        if pad > self.free.len() || size > available {
            return Err(RuntimeError::Allocation { requested: size, available });
        }

        let free = core::mem::take(&mut self.free);
        let (_, aligned) = free.split_at_mut(pad);
        let (span, rest) = aligned.split_at_mut(size);
        self.free = rest;
        self.offset += pad + size;

        // Zero-initialize to prevent stale data leaks on MCU
        span.fill(0);
        Ok(span)
    }

    /// Allocate a zeroed `i8` slice (alignment 1).
    pub fn alloc_i8_slice(&mut self, len: usize) -> RuntimeResult<&'a mut [i8]> {
        let bytes = self.allocate(len, 1)?;
        Ok(bytemuck::cast_slice_mut(bytes))
    }

    /// Allocate room for `count` values of `T` and construct each one in place
    /// with `init(index)`.
    ///
    /// This is how the loader builds its tables without a heap. Values are
    /// never dropped, so `T` should not own resources.
    pub fn alloc_with<T, F>(&mut self, count: usize, mut init: F) -> RuntimeResult<&'a mut [T]>
    where
        F: FnMut(usize) -> RuntimeResult<T>,
    {
        let bytes = size_of::<T>().checked_mul(count).ok_or(RuntimeError::Allocation {
            requested: usize::MAX,
            available: self.remaining(),
        })?;
        let raw = self.allocate(bytes, align_of::<T>())?;
        let base = raw.as_mut_ptr().cast::<T>();

        for i in 0..count {
            let value = init(i)?;
            // SAFETY: `raw` is exclusively ours for 'a, aligned for T by
            // `allocate`, and holds `count` elements; `i < count`.
            unsafe { base.add(i).write(value) };
        }

        // SAFETY: every element in 0..count was initialized above and the
        // memory stays borrowed for 'a.
        Ok(unsafe { core::slice::from_raw_parts_mut(base, count) })
    }

    /// Bytes remaining in the arena.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.free.len()
    }

    /// Total capacity in bytes.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far, alignment padding included.
    #[inline(always)]
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Highest offset ever handed out. A bump arena never shrinks, so this is
    /// the same as [`Arena::used`]; it is always `<= capacity()`.
    #[inline(always)]
    pub fn high_water_mark(&self) -> usize {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut pool = StaticArena::<256>::new();
        let mut arena = Arena::new(pool.as_mut_slice());

        let a = arena.allocate(3, 1).unwrap();
        let b = arena.allocate(8, 16).unwrap();
        assert_eq!(b.as_ptr() as usize % 16, 0);
        assert!(a.as_ptr() as usize + a.len() <= b.as_ptr() as usize);
        assert_eq!(arena.used(), 16 + 8);
    }

    #[test]
    fn exhaustion_reports_requested_and_available() {
        let mut pool = StaticArena::<32>::new();
        let mut arena = Arena::new(pool.as_mut_slice());
        arena.allocate(20, 1).unwrap();

        let err = arena.allocate(40, 1).unwrap_err();
        assert_eq!(err, RuntimeError::Allocation { requested: 40, available: 12 });
        assert_eq!(arena.used(), 20);
    }

    #[test]
    fn empty_allocation_past_the_end_is_an_error() {
        let mut pool = StaticArena::<16>::new();
        let mut arena = Arena::new(&mut pool.as_mut_slice()[..12]);
        arena.allocate(10, 1).unwrap();

        // The next 16-byte boundary lies beyond the 2 bytes that are left.
        let err = arena.allocate(0, 16).unwrap_err();
        assert_eq!(err, RuntimeError::Allocation { requested: 0, available: 0 });
        assert_eq!(arena.used(), 10);
        assert!(arena.allocate(0, 1).is_ok());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_alignment_panics() {
        let mut buf = [0u8; 16];
        let mut arena = Arena::new(&mut buf);
        let _ = arena.allocate(4, 3);
    }

    #[test]
    fn alloc_with_constructs_in_place() {
        let mut pool = StaticArena::<128>::new();
        let mut arena = Arena::new(pool.as_mut_slice());
        let table = arena.alloc_with(4, |i| Ok((i as u32) * 10)).unwrap();
        assert_eq!(table, &[0, 10, 20, 30]);
        assert_eq!(table.as_ptr() as usize % align_of::<u32>(), 0);
    }

    #[test]
    fn zero_sized_temp_pool_is_absent() {
        let mut pools = StaticPools::<64, 64, 0>::new();
        let split = pools.split();
        assert!(split.temp.is_none());
        assert_eq!(split.method.len(), 64);
    }
}
