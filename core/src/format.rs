//! Wire layout of a NANO program image.
//!
//! ```text
//! [Header 32B][method records 36B each][name bytes][u32 planned sizes]
//! [value records 28B][u16 input ids][u16 output ids][op records 32B][constants]
//! ```
//!
//! All integers are little-endian and all offsets are absolute from the
//! start of the image. The checksum is CRC-32 over `[HEADER_LEN, total_len)`.
//! Only the header and method table have fixed positions; everything else is
//! found through offsets, so the order above is what the builder emits, not
//! something the loader relies on.

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;

use crate::error::LoadError;

pub const MAGIC: [u8; 4] = *b"NANO";
pub const VERSION: u16 = 1;

pub const HEADER_LEN: usize = 32;
pub const METHOD_RECORD_LEN: usize = 36;
pub const VALUE_RECORD_LEN: usize = 28;
pub const OP_RECORD_LEN: usize = 32;

const_assert_eq!(HEADER_LEN, 4 + 2 + 2 + 6 * 4);
const_assert_eq!(METHOD_RECORD_LEN, 4 + 2 + 1 + 1 + 4 * 2 + 5 * 4);
const_assert_eq!(VALUE_RECORD_LEN, 4 + 2 + 2 + 4 + 4 * 4);
const_assert_eq!(OP_RECORD_LEN, 4 + 3 * 2 + 2 + 5 * 4);

/// Operand slot marker for "no value".
pub const NO_VALUE: u16 = 0xFFFF;
/// Bound-input tracking uses a `u32` mask.
pub const MAX_INPUTS: usize = 32;

pub const KIND_PLANNED: u8 = 0;
pub const KIND_CONSTANT: u8 = 1;
pub const KIND_INT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Dense = 0,
    Conv2d = 1,
    MaxPool2d = 2,
    Relu = 3,
    Sigmoid = 4,
    Tanh = 5,
    Softmax = 6,
    Flatten = 7,
    Delegate = 8,
}

impl OpCode {
    pub fn from_code(code: u8) -> Result<Self, LoadError> {
        Ok(match code {
            0 => OpCode::Dense,
            1 => OpCode::Conv2d,
            2 => OpCode::MaxPool2d,
            3 => OpCode::Relu,
            4 => OpCode::Sigmoid,
            5 => OpCode::Tanh,
            6 => OpCode::Softmax,
            7 => OpCode::Flatten,
            8 => OpCode::Delegate,
            other => return Err(LoadError::UnknownOpcode(other)),
        })
    }
}

/// Bounds-checked `data[offset..offset + len]`.
pub fn section(data: &[u8], offset: usize, len: usize) -> Result<&[u8], LoadError> {
    offset
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .map(|end| &data[offset..end])
        .ok_or(LoadError::OutOfBounds { offset, len })
}

/// Bounds-checked table of `count` records of `record_len` bytes.
pub fn table(data: &[u8], offset: usize, count: usize, record_len: usize) -> Result<&[u8], LoadError> {
    let len = count
        .checked_mul(record_len)
        .ok_or(LoadError::OutOfBounds { offset, len: usize::MAX })?;
    section(data, offset, len)
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub method_count: u16,
    pub total_len: u32,
    pub method_table_offset: u32,
    pub constant_offset: u32,
    pub constant_len: u32,
    pub checksum: u32,
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self, LoadError> {
        if data.len() < HEADER_LEN {
            return Err(LoadError::BufferTooShort { required: HEADER_LEN, actual: data.len() });
        }
        if data[0..4] != MAGIC {
            return Err(LoadError::BadMagic);
        }
        Ok(Self {
            version: LittleEndian::read_u16(&data[4..]),
            method_count: LittleEndian::read_u16(&data[6..]),
            total_len: LittleEndian::read_u32(&data[8..]),
            method_table_offset: LittleEndian::read_u32(&data[12..]),
            constant_offset: LittleEndian::read_u32(&data[16..]),
            constant_len: LittleEndian::read_u32(&data[20..]),
            checksum: LittleEndian::read_u32(&data[24..]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&MAGIC);
        LittleEndian::write_u16(&mut out[4..], self.version);
        LittleEndian::write_u16(&mut out[6..], self.method_count);
        LittleEndian::write_u32(&mut out[8..], self.total_len);
        LittleEndian::write_u32(&mut out[12..], self.method_table_offset);
        LittleEndian::write_u32(&mut out[16..], self.constant_offset);
        LittleEndian::write_u32(&mut out[20..], self.constant_len);
        LittleEndian::write_u32(&mut out[24..], self.checksum);
        LittleEndian::write_u32(&mut out[28..], 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodRecord {
    pub name_offset: u32,
    pub name_len: u16,
    pub input_count: u8,
    pub output_count: u8,
    pub value_count: u16,
    pub op_count: u16,
    pub planned_count: u16,
    pub planned_sizes_offset: u32,
    pub values_offset: u32,
    pub inputs_offset: u32,
    pub outputs_offset: u32,
    pub ops_offset: u32,
}

impl MethodRecord {
    pub fn parse(rec: &[u8]) -> Self {
        Self {
            name_offset: LittleEndian::read_u32(&rec[0..]),
            name_len: LittleEndian::read_u16(&rec[4..]),
            input_count: rec[6],
            output_count: rec[7],
            value_count: LittleEndian::read_u16(&rec[8..]),
            op_count: LittleEndian::read_u16(&rec[10..]),
            planned_count: LittleEndian::read_u16(&rec[12..]),
            planned_sizes_offset: LittleEndian::read_u32(&rec[16..]),
            values_offset: LittleEndian::read_u32(&rec[20..]),
            inputs_offset: LittleEndian::read_u32(&rec[24..]),
            outputs_offset: LittleEndian::read_u32(&rec[28..]),
            ops_offset: LittleEndian::read_u32(&rec[32..]),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..], self.name_offset);
        LittleEndian::write_u16(&mut out[4..], self.name_len);
        out[6] = self.input_count;
        out[7] = self.output_count;
        LittleEndian::write_u16(&mut out[8..], self.value_count);
        LittleEndian::write_u16(&mut out[10..], self.op_count);
        LittleEndian::write_u16(&mut out[12..], self.planned_count);
        LittleEndian::write_u16(&mut out[14..], 0);
        LittleEndian::write_u32(&mut out[16..], self.planned_sizes_offset);
        LittleEndian::write_u32(&mut out[20..], self.values_offset);
        LittleEndian::write_u32(&mut out[24..], self.inputs_offset);
        LittleEndian::write_u32(&mut out[28..], self.outputs_offset);
        LittleEndian::write_u32(&mut out[32..], self.ops_offset);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueRecord {
    pub kind: u8,
    pub dtype: u8,
    pub ndim: u8,
    pub buffer: u16,
    pub offset: u32,
    pub dims: [u32; 4],
}

impl ValueRecord {
    pub fn parse(rec: &[u8]) -> Self {
        let mut dims = [0u32; 4];
        LittleEndian::read_u32_into(&rec[12..28], &mut dims);
        Self {
            kind: rec[0],
            dtype: rec[1],
            ndim: rec[2],
            buffer: LittleEndian::read_u16(&rec[4..]),
            offset: LittleEndian::read_u32(&rec[8..]),
            dims,
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.kind;
        out[1] = self.dtype;
        out[2] = self.ndim;
        out[3] = 0;
        LittleEndian::write_u16(&mut out[4..], self.buffer);
        LittleEndian::write_u16(&mut out[6..], 0);
        LittleEndian::write_u32(&mut out[8..], self.offset);
        LittleEndian::write_u32_into(&self.dims, &mut out[12..28]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRecord {
    pub opcode: u8,
    pub inputs: [u16; 3],
    pub output: u16,
    pub params: [i32; 5],
}

impl OpRecord {
    pub fn parse(rec: &[u8]) -> Self {
        let mut inputs = [0u16; 3];
        LittleEndian::read_u16_into(&rec[4..10], &mut inputs);
        let mut params = [0i32; 5];
        LittleEndian::read_i32_into(&rec[12..32], &mut params);
        Self {
            opcode: rec[0],
            inputs,
            output: LittleEndian::read_u16(&rec[10..]),
            params,
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.opcode;
        out[1..4].fill(0);
        LittleEndian::write_u16_into(&self.inputs, &mut out[4..10]);
        LittleEndian::write_u16(&mut out[10..], self.output);
        LittleEndian::write_i32_into(&self.params, &mut out[12..32]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_short_and_foreign_images() {
        assert_eq!(
            Header::parse(&[0u8; 8]),
            Err(LoadError::BufferTooShort { required: HEADER_LEN, actual: 8 })
        );
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(b"PTE0");
        assert_eq!(Header::parse(&bytes), Err(LoadError::BadMagic));
    }

    #[test]
    fn section_checks_overflow() {
        let data = [0u8; 16];
        assert!(section(&data, 8, 8).is_ok());
        assert_eq!(section(&data, 8, 9), Err(LoadError::OutOfBounds { offset: 8, len: 9 }));
        assert!(section(&data, usize::MAX, 2).is_err());
        assert!(table(&data, 0, usize::MAX, 32).is_err());
    }

    #[test]
    fn op_record_layout() {
        let rec = OpRecord { opcode: 1, inputs: [0, 1, NO_VALUE], output: 3, params: [1, 0, 1, 7, 0] };
        let mut buf = [0u8; OP_RECORD_LEN];
        rec.write(&mut buf);
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[8..10], &[0xFF, 0xFF]);
        assert_eq!(OpRecord::parse(&buf), rec);
    }
}
