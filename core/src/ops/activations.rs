//! Elementwise activations. Each copies its input into the output slot and
//! transforms it there, so input and output may live in different planned
//! buffers.

use super::{Kernel, KernelContext, Operands};
use crate::error::RuntimeResult;
use crate::math::{relu_i8, sigmoid_i8, softmax_i8, tanh_i8, SOFTMAX_MAX_LEN};
use crate::tensor::Shape;

fn same_shape(input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
    (params == [None, None]).then_some(*input)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relu;

impl Kernel for Relu {
    fn name(&self) -> &'static str {
        "ReLU"
    }
    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        same_shape(input, params)
    }
    fn forward(&self, io: Operands<'_>, _ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        io.output.copy_from_slice(io.input);
        relu_i8(io.output);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sigmoid;

impl Kernel for Sigmoid {
    fn name(&self) -> &'static str {
        "Sigmoid"
    }
    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        same_shape(input, params)
    }
    fn forward(&self, io: Operands<'_>, _ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        io.output.copy_from_slice(io.input);
        sigmoid_i8(io.output);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tanh;

impl Kernel for Tanh {
    fn name(&self) -> &'static str {
        "Tanh"
    }
    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        same_shape(input, params)
    }
    fn forward(&self, io: Operands<'_>, _ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        io.output.copy_from_slice(io.input);
        tanh_i8(io.output);
        Ok(())
    }
}

/// Approximate softmax over the whole tensor, at most 256 elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Softmax;

impl Kernel for Softmax {
    fn name(&self) -> &'static str {
        "Softmax"
    }
    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        same_shape(input, params).filter(|s| s.total() <= SOFTMAX_MAX_LEN)
    }
    fn forward(&self, io: Operands<'_>, _ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        softmax_i8(io.input, io.output)?;
        Ok(())
    }
}
