//! Max pooling over CHW feature maps.

use super::{Kernel, KernelContext, Operands};
use crate::error::{ExecutionError, RuntimeResult};
use crate::math::{max_pool_2d, pool_output_size};
use crate::tensor::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool2d {
    pub pool_h: usize,
    pub pool_w: usize,
    pub stride: usize,
}

impl Kernel for MaxPool2d {
    fn name(&self) -> &'static str {
        "MaxPool2d"
    }

    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        if params != [None, None] {
            return None;
        }
        let (c, h, w) = input.chw()?;
        let (oh, ow) = pool_output_size(h, w, self.pool_h, self.pool_w, self.stride)?;
        Some(if input.ndim == 4 { Shape::d4(1, c, oh, ow) } else { Shape::d3(c, oh, ow) })
    }

    fn forward(&self, io: Operands<'_>, _ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        let (c, h, w) = io.input_shape.chw().ok_or(ExecutionError::InvalidParameter)?;
        max_pool_2d(io.input, io.output, c, h, w, self.pool_h, self.pool_w, self.stride)?;
        Ok(())
    }
}
