//! Error taxonomy for the execution pipeline.
//!
//! Every fallible operation returns `RuntimeResult<T>`. Nothing panics on bad
//! input: on a microcontroller a panic takes the whole device down, so the
//! caller always gets an explicit status to report before halting.

use thiserror::Error;

use crate::bringup::Stage;

/// Board, power, accelerator or runtime configuration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("pin configuration failed (driver code {0})")]
    Pins(i32),
    #[error("power domain enable failed (driver code {0})")]
    PowerDomain(i32),
    #[error("arena memory test failed: wrote {wrote:#010x}, read {read:#010x}")]
    MemoryTest { wrote: u32, read: u32 },
    #[error("accelerator initialization failed (driver code {0})")]
    Accelerator(i32),
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("entry point name is empty")]
    EmptyEntryPoint,
    #[error("{0} pool has no capacity")]
    EmptyPool(&'static str),
}

/// Malformed or incompatible program image. `code()` is the diagnostic number
/// reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("image is {actual} bytes, header needs {required}")]
    BufferTooShort { required: usize, actual: usize },
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("image declares {declared} bytes but only {actual} are present")]
    Truncated { declared: usize, actual: usize },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("table at offset {offset} with length {len} lies outside the image")]
    OutOfBounds { offset: usize, len: usize },
    #[error("method name is not valid UTF-8")]
    InvalidName,
    #[error("unknown dtype {0}")]
    InvalidDType(u8),
    #[error("unknown value kind {0}")]
    InvalidValueKind(u8),
    #[error("invalid tensor shape")]
    InvalidShape,
    #[error("planned buffer {index} out of range ({count} declared)")]
    PlannedBufferIndex { index: usize, count: usize },
    #[error("tensor range exceeds planned buffer {buffer}")]
    PlannedRange { buffer: usize },
    #[error("tensor range exceeds constant segment")]
    ConstantRange,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("operand {index} out of range ({count} values)")]
    OperandIndex { index: usize, count: usize },
    #[error("operand {operand} of op {op} has the wrong kind")]
    OperandKind { op: usize, operand: usize },
    #[error("op {op}: expected {expected} elements, found {actual}")]
    ShapeMismatch { op: usize, expected: usize, actual: usize },
    #[error("op {op} has an invalid parameter")]
    InvalidParam { op: usize },
    #[error("op {op} reads and writes overlapping planned memory")]
    AliasedOperands { op: usize },
    #[error("method declares {0} inputs, at most 32 are supported")]
    TooManyInputs(usize),
    #[error("method input/output value {index} must be a planned tensor or a scalar")]
    IoKind { index: usize },
    #[error("op {op} writes over method input {input}")]
    InputOverwritten { op: usize, input: usize },
}

impl LoadError {
    /// Stable diagnostic code for this failure.
    pub fn code(&self) -> u16 {
        match self {
            LoadError::BufferTooShort { .. } => 1,
            LoadError::BadMagic => 2,
            LoadError::UnsupportedVersion(_) => 3,
            LoadError::Truncated { .. } => 4,
            LoadError::ChecksumMismatch { .. } => 5,
            LoadError::OutOfBounds { .. } => 6,
            LoadError::InvalidName => 7,
            LoadError::InvalidDType(_) => 8,
            LoadError::InvalidValueKind(_) => 9,
            LoadError::InvalidShape => 10,
            LoadError::PlannedBufferIndex { .. } => 11,
            LoadError::PlannedRange { .. } => 12,
            LoadError::ConstantRange => 13,
            LoadError::UnknownOpcode(_) => 14,
            LoadError::OperandIndex { .. } => 15,
            LoadError::OperandKind { .. } => 16,
            LoadError::ShapeMismatch { .. } => 17,
            LoadError::InvalidParam { .. } => 18,
            LoadError::AliasedOperands { .. } => 19,
            LoadError::TooManyInputs(_) => 20,
            LoadError::IoKind { .. } => 21,
            LoadError::InputOverwritten { .. } => 22,
        }
    }
}

/// Entry point lookup and tensor slot binding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("method not found")]
    MethodNotFound,
    #[error("value {index} is not a tensor")]
    NotATensor { index: usize },
    #[error("index {index} out of range ({count} available)")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("planned buffer set does not match the method: {reason}")]
    PlannedBufferMismatch { reason: &'static str },
    #[error("byte count mismatch: tensor holds {expected}, caller gave {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("input {index} has not been bound")]
    InputUnbound { index: usize },
    #[error("outputs are not available before a successful execute")]
    NotExecuted,
}

/// Runtime and accelerator failures during a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("buffer too small: need {required}, have {available}")]
    BufferTooSmall { required: usize, available: usize },
    #[error("invalid kernel parameter")]
    InvalidParameter,
    #[error("delegate op needs an accelerator but none is attached")]
    AcceleratorUnavailable,
    #[error("accelerator fault (driver code {0})")]
    AcceleratorFault(i32),
    #[error("method faulted on a previous execute and must be reloaded")]
    Faulted,
}

/// Top-level error for every stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    Allocation { requested: usize, available: usize },
    #[error("load error {code}: {0}", code = .0.code())]
    Load(#[from] LoadError),
    #[error("binding error: {0}")]
    Binding(#[from] BindingError),
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),
    #[error("invalid argument: {what}")]
    InvalidArgument { what: &'static str },
    #[error("stage {attempted:?} attempted before {expected:?} completed")]
    Sequence { expected: Stage, attempted: Stage },
}

impl RuntimeError {
    /// Diagnostic number for the status channel: category in the high byte,
    /// load diagnostic code in the low byte.
    pub fn code(&self) -> u16 {
        match self {
            RuntimeError::Configuration(_) => 0x100,
            RuntimeError::Allocation { .. } => 0x200,
            RuntimeError::Load(e) => 0x300 | e.code(),
            RuntimeError::Binding(_) => 0x400,
            RuntimeError::Execution(_) => 0x500,
            RuntimeError::InvalidArgument { .. } => 0x600,
            RuntimeError::Sequence { .. } => 0x700,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// C-style status returned by [`crate::InferenceContext::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    NotInitialized = -1,
    NotATensor = -2,
    ExecuteFailed = -3,
    OutputNotATensor = -4,
    InvalidArguments = -5,
}

impl Status {
    #[inline(always)]
    pub fn code(self) -> i32 {
        self as i32
    }

    #[inline(always)]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}
