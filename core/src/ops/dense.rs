//! Fully-connected layer over weights stored in the constant segment.

use super::{Kernel, KernelContext, Operands};
use crate::error::RuntimeResult;
use crate::math::dense_i8;
use crate::tensor::{DType, Shape};

/// `out[o] = sat(((Σ w[o,i]·x[i]) * M >> shift) + b[o])`.
///
/// Operands: `[x, weights [out × in], bias [out]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dense {
    pub requant_m: i32,
    pub requant_shift: u32,
}

impl Kernel for Dense {
    fn name(&self) -> &'static str {
        "Dense"
    }

    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        let [Some(weights), Some(bias)] = params else { return None };
        if weights.ndim != 2 {
            return None;
        }
        let (out_features, in_features) = (weights.dims[0], weights.dims[1]);
        if input.total() != in_features || bias.total() != out_features {
            return None;
        }
        Some(Shape::d1(out_features))
    }

    fn param_dtypes(&self) -> [Option<DType>; 2] {
        [Some(DType::Int8), Some(DType::Int8)]
    }

    fn forward(&self, io: Operands<'_>, _ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        let weights = io.param_i8(0);
        let bias = io.param_i8(1);
        dense_i8(io.input, weights, bias, io.output, self.requant_m, self.requant_shift)?;
        Ok(())
    }
}
