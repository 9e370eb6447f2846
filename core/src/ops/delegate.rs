//! Subgraph handed to the NPU. The payload is an opaque constant blob that
//! only the accelerator driver understands.

use super::{Kernel, KernelContext, Operands};
use crate::error::{ExecutionError, RuntimeResult};
use crate::tensor::{DType, Shape};

/// Operands: `[x, payload (u8 constant)]`; produces `output_len` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delegate {
    pub output_len: usize,
}

impl Kernel for Delegate {
    fn name(&self) -> &'static str {
        "Delegate"
    }

    fn output_shape(&self, _input: &Shape, params: [Option<Shape>; 2]) -> Option<Shape> {
        match params {
            [Some(_), None] => Some(Shape::d1(self.output_len)),
            _ => None,
        }
    }

    fn param_dtypes(&self) -> [Option<DType>; 2] {
        [Some(DType::UInt8), None]
    }

    fn forward(&self, io: Operands<'_>, ctx: &mut KernelContext<'_, '_>) -> RuntimeResult<()> {
        let npu = ctx.accelerator.as_deref_mut().ok_or(ExecutionError::AcceleratorUnavailable)?;
        npu.invoke(io.params[0], io.input, io.output)
            .map_err(|fault| ExecutionError::AcceleratorFault(fault.0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::error::RuntimeError;
    use crate::platform::{Accelerator, DriverFault};

    struct Negate;

    impl Accelerator for Negate {
        fn initialize(&mut self) -> Result<(), DriverFault> {
            Ok(())
        }
        fn invoke(&mut self, payload: &[u8], input: &[i8], output: &mut [i8]) -> Result<(), DriverFault> {
            if payload != b"neg" {
                return Err(DriverFault(7));
            }
            for (o, &i) in output.iter_mut().zip(input) {
                *o = i.saturating_neg();
            }
            Ok(())
        }
    }

    fn invoke(accel: Option<&mut dyn Accelerator>, payload: &[u8]) -> RuntimeResult<[i8; 2]> {
        let mut out = [0i8; 2];
        let mut scratch = [0u8; 0];
        let mut ctx = KernelContext { scratch: Arena::new(&mut scratch), accelerator: accel };
        let io = Operands {
            input: &[3, -128],
            input_shape: Shape::d1(2),
            params: [payload, &[]],
            param_shapes: [Some(Shape::d1(payload.len())), None],
            output: &mut out,
        };
        Delegate { output_len: 2 }.forward(io, &mut ctx)?;
        Ok(out)
    }

    #[test]
    fn routes_through_accelerator() {
        let mut npu = Negate;
        assert_eq!(invoke(Some(&mut npu), b"neg"), Ok([-3, 127]));
        assert_eq!(
            invoke(Some(&mut npu), b"xyz"),
            Err(RuntimeError::Execution(ExecutionError::AcceleratorFault(7)))
        );
        assert_eq!(invoke(None, b"neg"), Err(RuntimeError::Execution(ExecutionError::AcceleratorUnavailable)));
    }
}
