//! The allocator triple a method is loaded into.

use log::info;

use crate::arena::{Arena, ArenaPools};
use crate::error::RuntimeResult;
use crate::planner::PlannedBufferSet;
use crate::program::MethodMeta;

/// Method arena for loader tables, planned spans for activations and an
/// optional temp region for per-op scratch. Consumed by
/// [`crate::Program::load_method`]; the method owns it from then on.
pub struct MemoryManager<'a> {
    pub(crate) method: Arena<'a>,
    pub(crate) planned: PlannedBufferSet<'a>,
    pub(crate) temp: Option<&'a mut [u8]>,
}

impl<'a> MemoryManager<'a> {
    pub fn new(method: Arena<'a>, planned: PlannedBufferSet<'a>, temp: Option<&'a mut [u8]>) -> Self {
        Self { method, planned, temp }
    }

    /// Plan `meta`'s buffers out of `pools` and wrap the result.
    pub fn for_method(meta: &MethodMeta<'_>, pools: ArenaPools<'a>, align: usize) -> RuntimeResult<Self> {
        let mut method = Arena::new(pools.method);
        let mut planned_arena = Arena::new(pools.planned);
        let planned = PlannedBufferSet::allocate(meta, &mut method, &mut planned_arena, align)?;
        info!(
            "memory for '{}': {} planned buffers ({} bytes), temp {} bytes",
            meta.name(),
            planned.len(),
            planned.total_bytes(),
            pools.temp.as_deref().map_or(0, <[u8]>::len)
        );
        Ok(Self::new(method, planned, pools.temp))
    }

    pub fn planned(&self) -> &PlannedBufferSet<'a> {
        &self.planned
    }

    pub fn temp_capacity(&self) -> usize {
        self.temp.as_deref().map_or(0, <[u8]>::len)
    }
}
