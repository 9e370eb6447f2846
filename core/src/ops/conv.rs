//! 2D convolution in CHW layout, lowered to im2col + matmul.

use super::{Kernel, KernelContext, Operands};
use crate::error::{ExecutionError, RuntimeResult};
use crate::math::{conv2d_i8, ConvGeometry};
use crate::tensor::{DType, Shape};

/// Operands: `[x [C×H×W], kernel [OC×C×KH×KW], bias [OC]]`. A leading batch
/// dimension of 1 is accepted and carried through to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2d {
    pub stride: usize,
    pub padding: usize,
    pub requant_m: i32,
    pub requant_shift: u32,
}

impl Conv2d {
    fn geometry(&self, input: &Shape, kernel: Option<Shape>) -> Option<ConvGeometry> {
        let (in_ch, in_h, in_w) = input.chw()?;
        let kernel = kernel?;
        if kernel.ndim != 4 || kernel.dims[1] != in_ch {
            return None;
        }
        let geo = ConvGeometry {
            in_ch,
            in_h,
            in_w,
            out_ch: kernel.dims[0],
            kh: kernel.dims[2],
            kw: kernel.dims[3],
            stride: self.stride,
            padding: self.padding,
        };
        geo.output_hw().map(|_| geo)
    }
}

impl Kernel for Conv2d {
    fn name(&self) -> &'static str {
        "Conv2d"
    }

    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        let geo = self.geometry(input, params[0])?;
        if params[1]?.total() != geo.out_ch {
            return None;
        }
        let (oh, ow) = geo.output_hw()?;
        Some(if input.ndim == 4 { Shape::d4(1, geo.out_ch, oh, ow) } else { Shape::d3(geo.out_ch, oh, ow) })
    }

    fn param_dtypes(&self) -> [Option<DType>; 2] {
        [Some(DType::Int8), Some(DType::Int8)]
    }

    fn scratch_bytes(&self, input: &Shape, params: [Option<Shape>; 2]) -> usize {
        self.geometry(input, params[0]).map_or(0, |geo| geo.im2col_len())
    }

    fn forward(&self, io: Operands<'_>, ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        let geo = self
            .geometry(&io.input_shape, io.param_shapes[0])
            .ok_or(ExecutionError::InvalidParameter)?;
        let im2col = ctx.scratch.alloc_i8_slice(geo.im2col_len())?;
        conv2d_i8(
            io.input,
            io.param_i8(0),
            io.param_i8(1),
            io.output,
            im2col,
            &geo,
            self.requant_m,
            self.requant_shift,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::error::RuntimeError;

    const CONV: Conv2d = Conv2d { stride: 1, padding: 0, requant_m: 1, requant_shift: 0 };

    #[test]
    fn output_shape_follows_geometry() {
        let k = Some(Shape::d4(4, 1, 3, 3));
        let b = Some(Shape::d1(4));
        assert_eq!(CONV.output_shape(&Shape::d3(1, 28, 28), [k, b]), Some(Shape::d3(4, 26, 26)));
        assert_eq!(CONV.output_shape(&Shape::d4(1, 1, 28, 28), [k, b]), Some(Shape::d4(1, 4, 26, 26)));
        // channel mismatch and an oversized kernel
        assert_eq!(CONV.output_shape(&Shape::d3(2, 28, 28), [k, b]), None);
        assert_eq!(CONV.output_shape(&Shape::d3(1, 2, 2), [k, b]), None);
        assert_eq!(CONV.scratch_bytes(&Shape::d3(1, 28, 28), [k, b]), 9 * 26 * 26);
    }

    #[test]
    fn forward_draws_im2col_from_scratch() {
        let kernel: [i8; 4] = [1, 0, 0, 1];
        let bias: [i8; 1] = [1];
        let mut out = [0i8; 4];
        let mut scratch = [0u8; 64];
        let mut ctx = KernelContext { scratch: Arena::new(&mut scratch), accelerator: None };
        let io = Operands {
            input: &[1, 2, 3, 4, 5, 6, 7, 8, 9],
            input_shape: Shape::d3(1, 3, 3),
            params: [bytemuck::cast_slice(&kernel), bytemuck::cast_slice(&bias)],
            param_shapes: [Some(Shape::d4(1, 1, 2, 2)), Some(Shape::d1(1))],
            output: &mut out,
        };
        CONV.forward(io, &mut ctx).unwrap();
        assert_eq!(out, [7, 9, 13, 15]);
        assert_eq!(ctx.scratch.used(), 16);
    }

    #[test]
    fn forward_fails_when_scratch_is_short() {
        let kernel: [i8; 4] = [1; 4];
        let bias: [i8; 1] = [0];
        let mut out = [0i8; 4];
        let mut scratch = [0u8; 8];
        let mut ctx = KernelContext { scratch: Arena::new(&mut scratch), accelerator: None };
        let io = Operands {
            input: &[0; 9],
            input_shape: Shape::d3(1, 3, 3),
            params: [bytemuck::cast_slice(&kernel), bytemuck::cast_slice(&bias)],
            param_shapes: [Some(Shape::d4(1, 1, 2, 2)), Some(Shape::d1(1))],
            output: &mut out,
        };
        assert!(matches!(CONV.forward(io, &mut ctx), Err(RuntimeError::Allocation { requested: 16, .. })));
    }
}
