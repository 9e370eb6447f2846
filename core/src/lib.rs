//! # nano-exec-core: bounded-memory model execution for microcontrollers
//!
//! A `no_std` runtime that loads a serialized program image (NANO v1) from
//! flash, plans its tensors into caller-provided arenas and runs the entry
//! point with quantized i8 kernels. Nothing here touches a heap.
//!
//! ## Architecture
//!
//! - **Program**: validated, zero-copy view of the image ([`Program`], [`MethodMeta`])
//! - **Memory**: three arenas (method tables, planned activations, kernel scratch)
//! - **Method**: value table, op list and execution state ([`Method`])
//! - **Context**: the single live program/method pair plus the `run()` status API
//! - **Bring-up**: ordered cold-start stages with LED and console reporting
//!
//! ## Usage
//!
//! ```ignore
//! use nano_exec_core::*;
//!
//! static MODEL: &[u8] = include_bytes!("model.nano");
//! let mut pools: StaticPools<8192, 4096, 2048> = StaticPools::new();
//!
//! let mut ctx = InferenceContext::new();
//! ctx.init(MODEL, pools.split())?;
//!
//! let mut scores = [0i8; 10];
//! let status = ctx.run_i8(&image, &mut scores);
//! assert!(status.is_ok());
//! let class = argmax_i8(&scores);
//! ```

// Why #![no_std]: compiles for bare-metal MCU targets. The `std` feature only
// adds the host-side image builder.
#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod arena;
pub mod bringup;
#[cfg(feature = "std")]
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod math;
pub mod memory;
pub mod method;
pub mod ops;
pub mod planner;
pub mod platform;
pub mod program;
pub mod selftest;
pub mod tensor;

// Re-export primary types
pub use arena::{Arena, ArenaPools, StaticArena, StaticPools};
pub use bringup::{BringUp, BringUpState, Hardware, Stage, StageFailure};
#[cfg(feature = "std")]
pub use builder::{MethodDef, ProgramBuilder, SequentialBuilder};
pub use config::{BindingPolicy, RuntimeConfig};
pub use context::InferenceContext;
pub use error::{
    BindingError, ConfigError, ExecutionError, LoadError, RuntimeError, RuntimeResult, Status,
};
pub use math::{argmax_i8, compute_requant_shift};
pub use memory::MemoryManager;
pub use method::{Method, MethodState};
pub use ops::{Kernel, Op, OpKind};
pub use planner::PlannedBufferSet;
pub use platform::{Accelerator, AlwaysOn, Board, Color, DriverFault, PowerDomain, StatusIndicator};
pub use program::{MethodMeta, Program};
pub use selftest::SelfTestReport;
pub use tensor::{DType, Shape, TensorSlot, Value};
