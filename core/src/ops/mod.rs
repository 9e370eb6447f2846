//! Operator zoo interpreted by the executor.
//!
//! Each op record in a program decodes into an [`Op`]. The loader asks the
//! op's [`Kernel`] for the output shape and scratch size once, so `forward`
//! only ever sees operands that already passed shape validation.

pub mod activations;
pub mod conv;
pub mod delegate;
pub mod dense;
pub mod flatten;
pub mod pooling;

use crate::arena::Arena;
use crate::error::{LoadError, RuntimeResult};
use crate::format::{OpCode, OpRecord, NO_VALUE};
use crate::platform::Accelerator;
use crate::tensor::{DType, Shape};

pub use activations::{Relu, Sigmoid, Softmax, Tanh};
pub use conv::Conv2d;
pub use delegate::Delegate;
pub use dense::Dense;
pub use flatten::Flatten;
pub use pooling::MaxPool2d;

/// Resolved operand memory for one op invocation.
pub struct Operands<'k> {
    pub input: &'k [i8],
    pub input_shape: Shape,
    /// Constant operands (weights, bias, payload) as raw bytes.
    pub params: [&'k [u8]; 2],
    pub param_shapes: [Option<Shape>; 2],
    pub output: &'k mut [i8],
}

impl<'k> Operands<'k> {
    #[inline(always)]
    pub fn param_i8(&self, index: usize) -> &'k [i8] {
        bytemuck::cast_slice(self.params[index])
    }
}

/// Per-op execution resources: a fresh scratch arena over the temp pool and
/// the accelerator, if one was attached.
pub struct KernelContext<'c, 'd> {
    pub scratch: Arena<'c>,
    pub accelerator: Option<&'c mut (dyn Accelerator + 'd)>,
}

pub trait Kernel {
    fn name(&self) -> &'static str;

    /// Shape produced for `input`, given the shapes of the constant operands.
    /// `None` means the combination is invalid.
    fn output_shape(&self, input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape>;

    /// Required dtype of each constant operand; `None` means it must be absent.
    fn param_dtypes(&self) -> [Option<DType>; 2] {
        [None, None]
    }

    /// Temp-arena bytes `forward` will ask for.
    fn scratch_bytes(&self, _input: &Shape, _params: [Option<Shape>; 2]) -> usize {
        0
    }

    fn forward(&self, io: Operands<'_>, ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Dense(Dense),
    Conv2d(Conv2d),
    MaxPool2d(MaxPool2d),
    Relu(Relu),
    Sigmoid(Sigmoid),
    Tanh(Tanh),
    Softmax(Softmax),
    Flatten(Flatten),
    Delegate(Delegate),
}

impl OpKind {
    pub fn kernel(&self) -> &dyn Kernel {
        match self {
            OpKind::Dense(k) => k,
            OpKind::Conv2d(k) => k,
            OpKind::MaxPool2d(k) => k,
            OpKind::Relu(k) => k,
            OpKind::Sigmoid(k) => k,
            OpKind::Tanh(k) => k,
            OpKind::Softmax(k) => k,
            OpKind::Flatten(k) => k,
            OpKind::Delegate(k) => k,
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            OpKind::Dense(_) => OpCode::Dense,
            OpKind::Conv2d(_) => OpCode::Conv2d,
            OpKind::MaxPool2d(_) => OpCode::MaxPool2d,
            OpKind::Relu(_) => OpCode::Relu,
            OpKind::Sigmoid(_) => OpCode::Sigmoid,
            OpKind::Tanh(_) => OpCode::Tanh,
            OpKind::Softmax(_) => OpCode::Softmax,
            OpKind::Flatten(_) => OpCode::Flatten,
            OpKind::Delegate(_) => OpCode::Delegate,
        }
    }

    /// Parameter words as stored in an op record.
    pub fn params(&self) -> [i32; 5] {
        match self {
            OpKind::Dense(d) => [d.requant_m, d.requant_shift as i32, 0, 0, 0],
            OpKind::Conv2d(c) => [
                c.stride as i32,
                c.padding as i32,
                c.requant_m,
                c.requant_shift as i32,
                0,
            ],
            OpKind::MaxPool2d(p) => [p.pool_h as i32, p.pool_w as i32, p.stride as i32, 0, 0],
            OpKind::Delegate(d) => [d.output_len as i32, 0, 0, 0, 0],
            _ => [0; 5],
        }
    }
}

/// One decoded op: kernel parameters plus value-table operand indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub input: usize,
    pub params: [Option<usize>; 2],
    pub output: usize,
}

fn non_negative(v: i32, op: usize) -> Result<usize, LoadError> {
    usize::try_from(v).map_err(|_| LoadError::InvalidParam { op })
}

fn positive(v: i32, op: usize) -> Result<usize, LoadError> {
    non_negative(v, op).and_then(|n| if n == 0 { Err(LoadError::InvalidParam { op }) } else { Ok(n) })
}

fn shift(v: i32, op: usize) -> Result<u32, LoadError> {
    u32::try_from(v).ok().filter(|&s| s < 32).ok_or(LoadError::InvalidParam { op })
}

impl Op {
    /// Decode op `index` of a method. Operand indices are range-checked by
    /// the loader, which knows the value table.
    pub fn decode(rec: &OpRecord, index: usize) -> Result<Self, LoadError> {
        let p = rec.params;
        let kind = match OpCode::from_code(rec.opcode)? {
            OpCode::Dense => OpKind::Dense(Dense { requant_m: p[0], requant_shift: shift(p[1], index)? }),
            OpCode::Conv2d => OpKind::Conv2d(Conv2d {
                stride: positive(p[0], index)?,
                padding: non_negative(p[1], index)?,
                requant_m: p[2],
                requant_shift: shift(p[3], index)?,
            }),
            OpCode::MaxPool2d => OpKind::MaxPool2d(MaxPool2d {
                pool_h: positive(p[0], index)?,
                pool_w: positive(p[1], index)?,
                stride: positive(p[2], index)?,
            }),
            OpCode::Relu => OpKind::Relu(Relu),
            OpCode::Sigmoid => OpKind::Sigmoid(Sigmoid),
            OpCode::Tanh => OpKind::Tanh(Tanh),
            OpCode::Softmax => OpKind::Softmax(Softmax),
            OpCode::Flatten => OpKind::Flatten(Flatten),
            OpCode::Delegate => OpKind::Delegate(Delegate { output_len: positive(p[0], index)? }),
        };

        let operand = |id: u16| if id == NO_VALUE { None } else { Some(id as usize) };
        let input = operand(rec.inputs[0]).ok_or(LoadError::OperandKind { op: index, operand: 0 })?;
        let output = operand(rec.output).ok_or(LoadError::OperandKind { op: index, operand: 3 })?;
        Ok(Self {
            kind,
            input,
            params: [operand(rec.inputs[1]), operand(rec.inputs[2])],
            output,
        })
    }

    pub fn encode(&self) -> OpRecord {
        let id = |v: Option<usize>| v.map_or(NO_VALUE, |i| i as u16);
        OpRecord {
            opcode: self.kind.opcode() as u8,
            inputs: [self.input as u16, id(self.params[0]), id(self.params[1])],
            output: self.output as u16,
            params: self.kind.params(),
        }
    }

    #[inline(always)]
    pub fn kernel(&self) -> &dyn Kernel {
        self.kind.kernel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_bad_parameters() {
        let rec = OpRecord {
            opcode: OpCode::MaxPool2d as u8,
            inputs: [0, NO_VALUE, NO_VALUE],
            output: 1,
            params: [2, 2, 0, 0, 0],
        };
        assert_eq!(Op::decode(&rec, 4), Err(LoadError::InvalidParam { op: 4 }));

        let rec = OpRecord { opcode: OpCode::Dense as u8, inputs: [0, 1, 2], output: 3, params: [1, 40, 0, 0, 0] };
        assert_eq!(Op::decode(&rec, 0), Err(LoadError::InvalidParam { op: 0 }));

        let rec = OpRecord { opcode: 42, inputs: [0, NO_VALUE, NO_VALUE], output: 1, params: [0; 5] };
        assert_eq!(Op::decode(&rec, 0), Err(LoadError::UnknownOpcode(42)));
    }

    #[test]
    fn encode_inverts_decode() {
        let rec = OpRecord { opcode: OpCode::Conv2d as u8, inputs: [0, 1, 2], output: 3, params: [1, 1, 3, 9, 0] };
        let op = Op::decode(&rec, 0).unwrap();
        assert_eq!(op.params, [Some(1), Some(2)]);
        assert_eq!(op.encode(), rec);
    }
}
