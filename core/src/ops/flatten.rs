//! Reshape to a flat vector. Data is copied unchanged; only the slot shape
//! differs.

use super::{Kernel, KernelContext, Operands};
use crate::error::RuntimeResult;
use crate::tensor::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flatten;

impl Kernel for Flatten {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        (params == [None, None]).then(|| Shape::d1(input.total()))
    }

    fn forward(&self, io: Operands<'_>, _ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        io.output.copy_from_slice(io.input);
        Ok(())
    }
}
