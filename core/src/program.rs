//! Program loader: validates a borrowed model image and hands out method
//! metadata and loaded methods.
//!
//! Loading is all-or-nothing. [`Program::load`] walks every method, value
//! and op in the image before returning, so a `Program` that exists is known
//! to describe only in-bounds tensors and shape-consistent ops. Nothing is
//! copied; every view borrows the caller's bytes.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::config::RuntimeConfig;
use crate::error::{BindingError, LoadError, RuntimeResult};
use crate::format::{
    self, Header, MethodRecord, OpRecord, ValueRecord, HEADER_LEN, KIND_CONSTANT, KIND_INT, KIND_PLANNED,
    MAX_INPUTS, METHOD_RECORD_LEN, OP_RECORD_LEN, VALUE_RECORD_LEN, VERSION,
};
use crate::memory::MemoryManager;
use crate::method::Method;
use crate::ops::Op;
use crate::tensor::{DType, Shape, Storage, TensorSlot, Value};

/// A validated, read-only view of a model image.
#[derive(Debug, Clone, Copy)]
pub struct Program<'a> {
    image: &'a [u8],
    header: Header,
    constants: &'a [u8],
    config: RuntimeConfig,
}

impl<'a> Program<'a> {
    /// Load with the default runtime configuration.
    pub fn load(data: &'a [u8]) -> RuntimeResult<Self> {
        Self::load_with(data, &RuntimeConfig::new())
    }

    pub fn load_with(data: &'a [u8], config: &RuntimeConfig) -> RuntimeResult<Self> {
        config.validate()?;

        let header = Header::parse(data)?;
        if header.version != VERSION {
            return Err(LoadError::UnsupportedVersion(header.version).into());
        }
        let total = header.total_len as usize;
        if total < HEADER_LEN {
            return Err(LoadError::BufferTooShort { required: HEADER_LEN, actual: total }.into());
        }
        if total > data.len() {
            return Err(LoadError::Truncated { declared: total, actual: data.len() }.into());
        }
        let image = &data[..total];

        if config.verify_checksum {
            let computed = format::checksum(&image[HEADER_LEN..]);
            if computed != header.checksum {
                return Err(LoadError::ChecksumMismatch { stored: header.checksum, computed }.into());
            }
        }

        let constants = format::section(image, header.constant_offset as usize, header.constant_len as usize)?;
        format::table(
            image,
            header.method_table_offset as usize,
            header.method_count as usize,
            METHOD_RECORD_LEN,
        )?;

        let program = Self { image, header, constants, config: *config };
        for index in 0..program.num_methods() {
            let meta = program.meta_at(index)?;
            debug!(
                "method '{}': {} values, {} ops, {} planned buffers",
                meta.name(),
                meta.num_values(),
                meta.num_ops(),
                meta.num_memory_planned_buffers()
            );
        }

        info!(
            "program loaded: {} bytes, {} methods, {} constant bytes",
            total,
            program.num_methods(),
            constants.len()
        );
        Ok(program)
    }

    pub fn num_methods(&self) -> usize {
        self.header.method_count as usize
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The validated image, trimmed to its declared length.
    pub fn image(&self) -> &'a [u8] {
        self.image
    }

    fn record(&self, index: usize) -> Result<MethodRecord, LoadError> {
        let offset = self.header.method_table_offset as usize + index * METHOD_RECORD_LEN;
        format::section(self.image, offset, METHOD_RECORD_LEN).map(MethodRecord::parse)
    }

    fn name_of(&self, rec: &MethodRecord) -> Result<&'a str, LoadError> {
        let bytes = format::section(self.image, rec.name_offset as usize, rec.name_len as usize)?;
        core::str::from_utf8(bytes).map_err(|_| LoadError::InvalidName)
    }

    pub fn method_name(&self, index: usize) -> RuntimeResult<&'a str> {
        if index >= self.num_methods() {
            return Err(BindingError::IndexOutOfRange { index, count: self.num_methods() }.into());
        }
        Ok(self.name_of(&self.record(index)?)?)
    }

    fn meta_at(&self, index: usize) -> Result<MethodMeta<'a>, LoadError> {
        let rec = self.record(index)?;
        let name = self.name_of(&rec)?;
        MethodMeta::parse(self.image, self.constants, name, rec)
    }

    /// Metadata of the method called `name`.
    pub fn method_meta(&self, name: &str) -> RuntimeResult<MethodMeta<'a>> {
        for index in 0..self.num_methods() {
            let rec = self.record(index)?;
            let method_name = self.name_of(&rec)?;
            if method_name == name {
                return Ok(MethodMeta::parse(self.image, self.constants, method_name, rec)?);
            }
        }
        Err(BindingError::MethodNotFound.into())
    }

    /// Resolve `name` and bind it to `memory`.
    ///
    /// Fails with `MethodNotFound` for an unknown name, `Allocation` when the
    /// method arena cannot hold the value and op tables or the temp arena is
    /// smaller than the largest op's scratch need, and `PlannedBufferMismatch`
    /// when `memory` was planned for a different method.
    pub fn load_method(&self, name: &str, memory: MemoryManager<'a>) -> RuntimeResult<Method<'a>> {
        let meta = self.method_meta(name)?;
        Method::load(meta, self.constants, memory, self.config.binding)
    }
}

/// Everything a caller needs to size memory for one method, plus typed
/// access to its tables.
#[derive(Debug, Clone, Copy)]
pub struct MethodMeta<'a> {
    name: &'a str,
    record: MethodRecord,
    planned_sizes: &'a [u8],
    values: &'a [u8],
    inputs: &'a [u8],
    outputs: &'a [u8],
    ops: &'a [u8],
    constant_len: usize,
    scratch_bytes: usize,
}

impl<'a> MethodMeta<'a> {
    fn parse(image: &'a [u8], constants: &'a [u8], name: &'a str, rec: MethodRecord) -> Result<Self, LoadError> {
        if rec.input_count as usize > MAX_INPUTS {
            return Err(LoadError::TooManyInputs(rec.input_count as usize));
        }
        let mut meta = Self {
            name,
            record: rec,
            planned_sizes: format::table(image, rec.planned_sizes_offset as usize, rec.planned_count as usize, 4)?,
            values: format::table(image, rec.values_offset as usize, rec.value_count as usize, VALUE_RECORD_LEN)?,
            inputs: format::table(image, rec.inputs_offset as usize, rec.input_count as usize, 2)?,
            outputs: format::table(image, rec.outputs_offset as usize, rec.output_count as usize, 2)?,
            ops: format::table(image, rec.ops_offset as usize, rec.op_count as usize, OP_RECORD_LEN)?,
            constant_len: constants.len(),
            scratch_bytes: 0,
        };
        meta.scratch_bytes = meta.validate()?;
        Ok(meta)
    }

    /// Checks every value, I/O id and op; returns the largest scratch need.
    fn validate(&self) -> Result<usize, LoadError> {
        for index in 0..self.num_values() {
            self.value(index)?;
        }
        for (table, count) in [(self.inputs, self.num_inputs()), (self.outputs, self.num_outputs())] {
            for k in 0..count {
                let id = read_id(table, k);
                self.check_index(id)?;
                if let Value::Tensor(t) = self.value(id)? {
                    if !t.is_planned() {
                        return Err(LoadError::IoKind { index: id });
                    }
                }
            }
        }
        let mut scratch = 0;
        for index in 0..self.num_ops() {
            let op = self.op(index)?;
            scratch = scratch.max(self.check_op(index, &op)?);
        }
        Ok(scratch)
    }

    fn check_index(&self, id: usize) -> Result<(), LoadError> {
        if id >= self.num_values() {
            return Err(LoadError::OperandIndex { index: id, count: self.num_values() });
        }
        Ok(())
    }

    fn operand(&self, op: usize, id: usize, operand: usize) -> Result<TensorSlot, LoadError> {
        self.check_index(id)?;
        match self.value(id)? {
            Value::Tensor(t) => Ok(t),
            Value::Int(_) => Err(LoadError::OperandKind { op, operand }),
        }
    }

    fn check_op(&self, index: usize, op: &Op) -> Result<usize, LoadError> {
        let kernel = op.kernel();
        let input = self.operand(index, op.input, 0)?;
        if input.dtype != DType::Int8 {
            return Err(LoadError::OperandKind { op: index, operand: 0 });
        }

        let mut shapes = [None; 2];
        for (k, (slot, want)) in op.params.iter().zip(kernel.param_dtypes()).enumerate() {
            match (*slot, want) {
                (None, None) => {}
                (Some(id), Some(dtype)) => {
                    let param = self.operand(index, id, k + 1)?;
                    if param.is_planned() || param.dtype != dtype {
                        return Err(LoadError::OperandKind { op: index, operand: k + 1 });
                    }
                    shapes[k] = Some(param.shape);
                }
                _ => return Err(LoadError::OperandKind { op: index, operand: k + 1 }),
            }
        }

        let output = self.operand(index, op.output, 3)?;
        if !output.is_planned() || output.dtype != DType::Int8 {
            return Err(LoadError::OperandKind { op: index, operand: 3 });
        }
        let expected = kernel
            .output_shape(&input.shape, shapes)
            .ok_or(LoadError::InvalidParam { op: index })?;
        if expected.total() != output.numel() {
            return Err(LoadError::ShapeMismatch { op: index, expected: expected.total(), actual: output.numel() });
        }

        if input.overlaps(&output) {
            return Err(LoadError::AliasedOperands { op: index });
        }
        // Inputs are bound once and reused by every later execute.
        for k in 0..self.num_inputs() {
            if let Value::Tensor(bound) = self.value(read_id(self.inputs, k))? {
                if bound.overlaps(&output) {
                    return Err(LoadError::InputOverwritten { op: index, input: k });
                }
            }
        }

        Ok(kernel.scratch_bytes(&input.shape, shapes))
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn num_inputs(&self) -> usize {
        self.record.input_count as usize
    }

    pub fn num_outputs(&self) -> usize {
        self.record.output_count as usize
    }

    pub fn num_values(&self) -> usize {
        self.record.value_count as usize
    }

    pub fn num_ops(&self) -> usize {
        self.record.op_count as usize
    }

    pub fn num_memory_planned_buffers(&self) -> usize {
        self.record.planned_count as usize
    }

    pub fn memory_planned_buffer_size(&self, index: usize) -> RuntimeResult<usize> {
        let count = self.num_memory_planned_buffers();
        if index >= count {
            return Err(BindingError::IndexOutOfRange { index, count }.into());
        }
        Ok(LittleEndian::read_u32(&self.planned_sizes[index * 4..]) as usize)
    }

    /// Sum of all planned buffer sizes, alignment padding excluded.
    pub fn planned_bytes(&self) -> usize {
        (0..self.num_memory_planned_buffers())
            .map(|i| LittleEndian::read_u32(&self.planned_sizes[i * 4..]) as usize)
            .sum()
    }

    /// Largest temp-arena request of any single op.
    pub fn scratch_bytes(&self) -> usize {
        self.scratch_bytes
    }

    fn planned_size(&self, buffer: usize) -> Result<usize, LoadError> {
        let count = self.num_memory_planned_buffers();
        if buffer >= count {
            return Err(LoadError::PlannedBufferIndex { index: buffer, count });
        }
        Ok(LittleEndian::read_u32(&self.planned_sizes[buffer * 4..]) as usize)
    }

    /// Decode entry `index` of the value table.
    pub fn value(&self, index: usize) -> Result<Value, LoadError> {
        self.check_index(index)?;
        let rec = ValueRecord::parse(&self.values[index * VALUE_RECORD_LEN..]);
        if rec.kind == KIND_INT {
            return Ok(Value::Int(rec.offset as i32));
        }

        let dtype = DType::from_code(rec.dtype)?;
        let ndim = rec.ndim as usize;
        if !(1..=4).contains(&ndim) {
            return Err(LoadError::InvalidShape);
        }
        let mut dims = [0usize; 4];
        for (d, &v) in dims.iter_mut().zip(&rec.dims) {
            *d = v as usize;
        }
        let shape = Shape::from_dims(&dims[..ndim])?;
        let nbytes = shape.total().checked_mul(dtype.size()).ok_or(LoadError::InvalidShape)?;
        let offset = rec.offset as usize;
        let end = offset.checked_add(nbytes);

        let storage = match rec.kind {
            KIND_PLANNED => {
                let buffer = rec.buffer as usize;
                let size = self.planned_size(buffer)?;
                if end.map_or(true, |e| e > size) {
                    return Err(LoadError::PlannedRange { buffer });
                }
                Storage::Planned { buffer, offset }
            }
            KIND_CONSTANT => {
                if end.map_or(true, |e| e > self.constant_len) {
                    return Err(LoadError::ConstantRange);
                }
                Storage::Constant { offset }
            }
            other => return Err(LoadError::InvalidValueKind(other)),
        };
        Ok(Value::Tensor(TensorSlot { dtype, shape, storage }))
    }

    /// Decode op `index`.
    pub fn op(&self, index: usize) -> Result<Op, LoadError> {
        Op::decode(&OpRecord::parse(&self.ops[index * OP_RECORD_LEN..]), index)
    }

    /// Value id of input `index`.
    pub fn input_id(&self, index: usize) -> RuntimeResult<usize> {
        io_id(self.inputs, index, self.num_inputs())
    }

    /// Value id of output `index`.
    pub fn output_id(&self, index: usize) -> RuntimeResult<usize> {
        io_id(self.outputs, index, self.num_outputs())
    }

    pub fn input_tensor_meta(&self, index: usize) -> RuntimeResult<TensorSlot> {
        self.tensor_meta(self.input_id(index)?, index)
    }

    pub fn output_tensor_meta(&self, index: usize) -> RuntimeResult<TensorSlot> {
        self.tensor_meta(self.output_id(index)?, index)
    }

    fn tensor_meta(&self, id: usize, index: usize) -> RuntimeResult<TensorSlot> {
        match self.value(id)? {
            Value::Tensor(t) => Ok(t),
            Value::Int(_) => Err(BindingError::NotATensor { index }.into()),
        }
    }
}

#[inline(always)]
fn read_id(table: &[u8], k: usize) -> usize {
    LittleEndian::read_u16(&table[k * 2..]) as usize
}

fn io_id(table: &[u8], index: usize, count: usize) -> RuntimeResult<usize> {
    if index >= count {
        return Err(BindingError::IndexOutOfRange { index, count }.into());
    }
    Ok(read_id(table, index))
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::builder::SequentialBuilder;
    use crate::error::RuntimeError;
    use crate::tensor::Shape;

    fn tiny() -> std::vec::Vec<u8> {
        SequentialBuilder::new(Shape::d1(4))
            .dense(&[1; 8], &[0, 0], 1, 0)
            .relu()
            .build()
            .unwrap()
    }

    #[test]
    fn exposes_method_metadata() {
        let image = tiny();
        let program = Program::load(&image).unwrap();
        assert_eq!(program.num_methods(), 1);
        assert_eq!(program.method_name(0).unwrap(), "forward");

        let meta = program.method_meta("forward").unwrap();
        assert_eq!(meta.num_inputs(), 1);
        assert_eq!(meta.num_outputs(), 1);
        assert_eq!(meta.num_ops(), 2);
        assert_eq!(meta.num_memory_planned_buffers(), 3);
        assert_eq!(meta.input_tensor_meta(0).unwrap().shape, Shape::d1(4));
        assert_eq!(meta.output_tensor_meta(0).unwrap().numel(), 2);
        assert_eq!(
            meta.memory_planned_buffer_size(3),
            Err(RuntimeError::Binding(BindingError::IndexOutOfRange { index: 3, count: 3 }))
        );
    }

    #[test]
    fn unknown_method_is_a_binding_error() {
        let image = tiny();
        let program = Program::load(&image).unwrap();
        assert_eq!(
            program.method_meta("backward").err(),
            Some(RuntimeError::Binding(BindingError::MethodNotFound))
        );
    }

    #[test]
    fn checksum_can_be_skipped() {
        let mut image = tiny();
        let last = image.len() - 1;
        image[last] ^= 0x01;
        assert!(matches!(
            Program::load(&image),
            Err(RuntimeError::Load(LoadError::ChecksumMismatch { .. }))
        ));
        let lax = RuntimeConfig::new().with_checksum(false);
        assert!(Program::load_with(&image, &lax).is_ok());
    }

    #[test]
    fn trailing_bytes_beyond_total_len_are_ignored() {
        let mut image = tiny();
        let len = image.len();
        image.extend_from_slice(&[0xAA; 16]);
        let program = Program::load(&image).unwrap();
        assert_eq!(program.image().len(), len);
    }
}
