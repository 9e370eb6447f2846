//! Method binder and executor.
//!
//! A [`Method`] owns the memory it was loaded into. Its value and op tables
//! are decoded once into the method arena; every execute walks the op list,
//! resolves each op's operands to slices of planned or constant memory and
//! calls the kernel. Nothing is allocated after load.

use log::{debug, error, info, trace, warn};

use crate::arena::Arena;
use crate::config::BindingPolicy;
use crate::error::{BindingError, ExecutionError, RuntimeError, RuntimeResult};
use crate::memory::MemoryManager;
use crate::ops::{KernelContext, Op, Operands};
use crate::planner::PlannedBufferSet;
use crate::platform::Accelerator;
use crate::program::MethodMeta;
use crate::tensor::{Storage, TensorSlot, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodState {
    /// Tables built, inputs not yet bound.
    Loaded,
    /// Every tensor input bound.
    Ready,
    /// Last execute succeeded; outputs are readable.
    Executed,
    /// An execute failed. Only [`Method::reset`] leaves this state.
    Faulted,
}

pub struct Method<'a> {
    meta: MethodMeta<'a>,
    values: &'a [Value],
    inputs: &'a [usize],
    outputs: &'a [usize],
    ops: &'a [Op],
    constants: &'a [u8],
    planned: PlannedBufferSet<'a>,
    temp: Option<&'a mut [u8]>,
    binding: BindingPolicy,
    state: MethodState,
    bound: u32,
    required: u32,
    executions: u32,
    temp_peak: usize,
    method_bytes: usize,
}

impl<'a> Method<'a> {
    pub(crate) fn load(
        meta: MethodMeta<'a>,
        constants: &'a [u8],
        memory: MemoryManager<'a>,
        binding: BindingPolicy,
    ) -> RuntimeResult<Self> {
        let MemoryManager { mut method, planned, temp } = memory;
        planned.check(&meta)?;

        let temp_len = temp.as_deref().map_or(0, <[u8]>::len);
        if meta.scratch_bytes() > temp_len {
            error!("'{}' needs {} scratch bytes, temp arena has {}", meta.name(), meta.scratch_bytes(), temp_len);
            return Err(RuntimeError::Allocation { requested: meta.scratch_bytes(), available: temp_len });
        }

        let values = method.alloc_with(meta.num_values(), |i| Ok(meta.value(i)?))?;
        let inputs = method.alloc_with(meta.num_inputs(), |i| meta.input_id(i))?;
        let outputs = method.alloc_with(meta.num_outputs(), |i| meta.output_id(i))?;
        let ops = method.alloc_with(meta.num_ops(), |i| Ok(meta.op(i)?))?;

        let required = inputs
            .iter()
            .enumerate()
            .filter(|&(_, &id)| values.get(id).is_some_and(Value::is_tensor))
            .fold(0u32, |mask, (i, _)| mask | (1 << i));

        info!(
            "method '{}' loaded: {} ops, {} method bytes, {} planned bytes",
            meta.name(),
            ops.len(),
            method.used(),
            planned.total_bytes()
        );

        Ok(Self {
            meta,
            values,
            inputs,
            outputs,
            ops,
            constants,
            planned,
            temp,
            binding,
            state: if required == 0 { MethodState::Ready } else { MethodState::Loaded },
            bound: 0,
            required,
            executions: 0,
            temp_peak: 0,
            method_bytes: method.used(),
        })
    }

    pub fn meta(&self) -> &MethodMeta<'a> {
        &self.meta
    }

    pub fn state(&self) -> MethodState {
        self.state
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Successful executes since load or the last reset.
    pub fn executions(&self) -> u32 {
        self.executions
    }

    /// Most scratch any single op has drawn from the temp arena.
    pub fn temp_peak(&self) -> usize {
        self.temp_peak
    }

    /// Method-arena bytes taken by the decoded tables.
    pub fn method_bytes(&self) -> usize {
        self.method_bytes
    }

    pub fn planned(&self) -> &PlannedBufferSet<'a> {
        &self.planned
    }

    pub fn input(&self, index: usize) -> RuntimeResult<Value> {
        let id = *self
            .inputs
            .get(index)
            .ok_or(BindingError::IndexOutOfRange { index, count: self.inputs.len() })?;
        Ok(self.values[id])
    }

    pub fn output_value(&self, index: usize) -> RuntimeResult<Value> {
        let id = *self
            .outputs
            .get(index)
            .ok_or(BindingError::IndexOutOfRange { index, count: self.outputs.len() })?;
        Ok(self.values[id])
    }

    fn input_slot(&self, index: usize) -> RuntimeResult<TensorSlot> {
        match self.input(index)? {
            Value::Tensor(t) => Ok(t),
            Value::Int(_) => Err(BindingError::NotATensor { index }.into()),
        }
    }

    fn mark_bound(&mut self, index: usize) {
        self.bound |= 1 << index;
        if self.state != MethodState::Faulted && self.bound & self.required == self.required {
            self.state = MethodState::Ready;
        }
    }

    /// Copy caller bytes into input `index`.
    ///
    /// Under [`BindingPolicy::Lenient`] a length mismatch copies
    /// `min(bytes.len(), nbytes)` and logs the shortfall; under `Strict` it is
    /// a `SizeMismatch`. Returns the number of bytes copied.
    pub fn set_input(&mut self, index: usize, bytes: &[u8]) -> RuntimeResult<usize> {
        let slot = self.input_slot(index)?;
        let expected = slot.nbytes();
        if bytes.len() != expected {
            if self.binding == BindingPolicy::Strict {
                return Err(BindingError::SizeMismatch { expected, actual: bytes.len() }.into());
            }
            warn!("input {}: tensor holds {} bytes, caller gave {}", index, expected, bytes.len());
        }

        let dst = self.storage_mut(&slot)?;
        let n = bytes.len().min(dst.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        self.mark_bound(index);
        Ok(n)
    }

    pub fn set_input_i8(&mut self, index: usize, data: &[i8]) -> RuntimeResult<usize> {
        self.set_input(index, bytemuck::cast_slice(data))
    }

    /// Planned storage of input `index`, for callers that write the tensor
    /// in place. The input counts as bound afterwards.
    pub fn input_storage_mut(&mut self, index: usize) -> RuntimeResult<&mut [i8]> {
        let slot = self.input_slot(index)?;
        self.mark_bound(index);
        let bytes = self.storage_mut(&slot)?;
        Ok(bytemuck::cast_slice_mut(bytes))
    }

    fn storage_mut(&mut self, slot: &TensorSlot) -> RuntimeResult<&mut [u8]> {
        let Storage::Planned { buffer, .. } = slot.storage else {
            return Err(BindingError::PlannedBufferMismatch { reason: "input is not planned" }.into());
        };
        self.planned
            .span_mut(buffer)
            .and_then(|span| span.get_mut(slot.byte_range()))
            .ok_or(BindingError::PlannedBufferMismatch { reason: "input outside its buffer" }.into())
    }

    /// Run the forward pass without an accelerator.
    pub fn execute(&mut self) -> RuntimeResult<()> {
        self.execute_with(None)
    }

    /// Run the forward pass. Delegate ops go to `accelerator`.
    ///
    /// Bound inputs stay bound: the loader rejects any op that writes over
    /// one, so an `Executed` method runs again on the same input. Any
    /// failure leaves the method `Faulted`; it must be [`reset`] before it
    /// will execute again.
    ///
    /// [`reset`]: Method::reset
    pub fn execute_with(&mut self, accelerator: Option<&mut (dyn Accelerator + '_)>) -> RuntimeResult<()> {
        match self.state {
            MethodState::Faulted => return Err(ExecutionError::Faulted.into()),
            MethodState::Loaded => {
                let missing = (self.required & !self.bound).trailing_zeros() as usize;
                return Err(BindingError::InputUnbound { index: missing }.into());
            }
            MethodState::Ready | MethodState::Executed => {}
        }

        match self.run_ops(accelerator) {
            Ok(()) => {
                self.executions += 1;
                self.state = MethodState::Executed;
                debug!("'{}' execution {} complete", self.meta.name(), self.executions);
                Ok(())
            }
            Err(e) => {
                error!("'{}' faulted: {}", self.meta.name(), e);
                self.state = MethodState::Faulted;
                Err(e)
            }
        }
    }

    fn run_ops(&mut self, mut accelerator: Option<&mut (dyn Accelerator + '_)>) -> RuntimeResult<()> {
        for (index, op) in self.ops.iter().enumerate() {
            let kernel = op.kernel();
            trace!("op {}: {}", index, kernel.name());

            let input = tensor(self.values, op.input)?;
            let output = tensor(self.values, op.output)?;
            let mut params: [&[u8]; 2] = [&[], &[]];
            let mut param_shapes = [None; 2];
            for (k, id) in op.params.iter().enumerate() {
                if let Some(id) = *id {
                    let slot = tensor(self.values, id)?;
                    params[k] = self.constants.get(slot.byte_range()).ok_or(ExecutionError::InvalidParameter)?;
                    param_shapes[k] = Some(slot.shape);
                }
            }

            let Storage::Planned { buffer: out_buffer, .. } = output.storage else {
                return Err(ExecutionError::InvalidParameter.into());
            };
            let (src, dst) = match input.storage {
                Storage::Constant { .. } => {
                    let src = self.constants.get(input.byte_range()).ok_or(ExecutionError::InvalidParameter)?;
                    let dst = self
                        .planned
                        .span_mut(out_buffer)
                        .and_then(|span| span.get_mut(output.byte_range()))
                        .ok_or(ExecutionError::InvalidParameter)?;
                    (src, dst)
                }
                Storage::Planned { buffer, .. } => self
                    .planned
                    .split((buffer, input.byte_range()), (out_buffer, output.byte_range()))
                    .ok_or(ExecutionError::InvalidParameter)?,
            };

            let mut ctx = KernelContext {
                scratch: Arena::new(self.temp.as_deref_mut().unwrap_or_default()),
                accelerator: accelerator.as_deref_mut(),
            };
            let io = Operands {
                input: bytemuck::cast_slice(src),
                input_shape: input.shape,
                params,
                param_shapes,
                output: bytemuck::cast_slice_mut(dst),
            };
            kernel.forward(io, &mut ctx)?;
            self.temp_peak = self.temp_peak.max(ctx.scratch.high_water_mark());
        }
        Ok(())
    }

    fn output_slot(&self, index: usize) -> RuntimeResult<TensorSlot> {
        if self.state != MethodState::Executed {
            return Err(BindingError::NotExecuted.into());
        }
        match self.output_value(index)? {
            Value::Tensor(t) => Ok(t),
            Value::Int(_) => Err(BindingError::NotATensor { index }.into()),
        }
    }

    /// Output `index` of the last successful execute.
    pub fn output(&self, index: usize) -> RuntimeResult<&[i8]> {
        let slot = self.output_slot(index)?;
        let Storage::Planned { buffer, .. } = slot.storage else {
            return Err(BindingError::NotATensor { index }.into());
        };
        let bytes = self
            .planned
            .span(buffer)
            .and_then(|span| span.get(slot.byte_range()))
            .ok_or(BindingError::PlannedBufferMismatch { reason: "output outside its buffer" })?;
        Ok(bytemuck::cast_slice(bytes))
    }

    /// Copy at most `buf.len()` bytes of output `index` into `buf`.
    pub fn copy_output(&self, index: usize, buf: &mut [u8]) -> RuntimeResult<usize> {
        let data: &[u8] = bytemuck::cast_slice(self.output(index)?);
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Zero planned memory, forget bound inputs and return to `Loaded`
    /// (`Ready` for methods without tensor inputs).
    /// This is the only way out of `Faulted`; no memory is reallocated.
    pub fn reset(&mut self) {
        self.planned.clear();
        self.bound = 0;
        self.executions = 0;
        self.state = if self.required == 0 { MethodState::Ready } else { MethodState::Loaded };
        info!("method '{}' reset", self.meta.name());
    }
}

fn tensor(values: &[Value], id: usize) -> RuntimeResult<TensorSlot> {
    values
        .get(id)
        .and_then(Value::as_tensor)
        .copied()
        .ok_or_else(|| ExecutionError::InvalidParameter.into())
}
