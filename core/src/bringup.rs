//! Cold-start sequence: board, power, accelerator, runtime, program, method,
//! first execution.
//!
//! Each stage has one transition function. It checks that the previous stage
//! completed, runs, and records either `Completed(stage)` or
//! `Failed { stage, error }`. There is no retry: after a failure every later
//! transition returns a `Sequence` error and the caller is expected to
//! [`halt`].

use core::fmt::{self, Write};

use log::{error, info};

use crate::arena::ArenaPools;
use crate::context::InferenceContext;
use crate::error::{ConfigError, RuntimeError, RuntimeResult};
use crate::math::argmax_i8;
use crate::platform::{Accelerator, Board, Color, PowerDomain, StatusIndicator};

/// Word written to and read back from the method pool after power-up.
pub const MEMORY_TEST_PATTERN: u32 = 0xDEAD_BEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Board,
    PowerDomain,
    Accelerator,
    Runtime,
    ProgramLoad,
    MethodLoad,
    FirstExecution,
}

impl Stage {
    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::Board => None,
            Stage::PowerDomain => Some(Stage::Board),
            Stage::Accelerator => Some(Stage::PowerDomain),
            Stage::Runtime => Some(Stage::Accelerator),
            Stage::ProgramLoad => Some(Stage::Runtime),
            Stage::MethodLoad => Some(Stage::ProgramLoad),
            Stage::FirstExecution => Some(Stage::MethodLoad),
        }
    }

    /// LED colour flashed when the stage completes.
    pub fn color(self) -> Color {
        match self {
            Stage::Board => Color::RED,
            Stage::PowerDomain => Color::YELLOW,
            Stage::Accelerator => Color::BLUE,
            Stage::Runtime | Stage::ProgramLoad => Color::CYAN,
            Stage::MethodLoad => Color::YELLOW,
            Stage::FirstExecution => Color::GREEN,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Board => "board",
            Stage::PowerDomain => "power domain",
            Stage::Accelerator => "accelerator",
            Stage::Runtime => "runtime",
            Stage::ProgramLoad => "program load",
            Stage::MethodLoad => "method load",
            Stage::FirstExecution => "first execution",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: RuntimeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpState {
    Reset,
    Completed(Stage),
    Failed(StageFailure),
}

/// Hardware collaborators for [`BringUp::run_all`]. `None` skips the
/// optional stages' driver call; the stage still completes.
pub struct Hardware<'h> {
    pub board: &'h mut dyn Board,
    pub power: Option<&'h mut dyn PowerDomain>,
    pub accelerator: Option<&'h mut dyn Accelerator>,
}

pub struct BringUp<'h> {
    state: BringUpState,
    console: &'h mut dyn Write,
    indicator: &'h mut dyn StatusIndicator,
}

impl<'h> BringUp<'h> {
    pub fn new(console: &'h mut dyn Write, indicator: &'h mut dyn StatusIndicator) -> Self {
        Self { state: BringUpState::Reset, console, indicator }
    }

    pub fn state(&self) -> BringUpState {
        self.state
    }

    fn begin(&self, stage: Stage) -> RuntimeResult<()> {
        let ready = match (self.state, stage.previous()) {
            (BringUpState::Reset, None) => true,
            (BringUpState::Completed(done), Some(prev)) => done == prev,
            _ => false,
        };
        if !ready {
            return Err(RuntimeError::Sequence { expected: stage.previous().unwrap_or(stage), attempted: stage });
        }
        Ok(())
    }

    fn finish<T>(&mut self, stage: Stage, result: RuntimeResult<T>) -> RuntimeResult<T> {
        match &result {
            Ok(_) => {
                self.state = BringUpState::Completed(stage);
                info!("{} ok", stage);
                let _ = writeln!(self.console, "[BOOT] {} ok\r", stage);
                self.indicator.blink(stage.color(), 1, 400);
            }
            Err(e) => {
                self.state = BringUpState::Failed(StageFailure { stage, error: *e });
                error!("{} failed: {}", stage, e);
                let _ = writeln!(self.console, "[BOOT] {} failed ({:#06x}): {}\r", stage, e.code(), e);
            }
        }
        result
    }

    pub fn configure_board(&mut self, board: &mut dyn Board) -> RuntimeResult<()> {
        self.begin(Stage::Board)?;
        let result: RuntimeResult<()> = board.configure_pins().map_err(|f| ConfigError::Pins(f.0).into());
        self.finish(Stage::Board, result)
    }

    /// Power the arena memory, then prove it holds data by writing
    /// [`MEMORY_TEST_PATTERN`] into the start of `region` and reading it back.
    pub fn enable_power(&mut self, power: Option<&mut dyn PowerDomain>, region: &mut [u8]) -> RuntimeResult<()> {
        self.begin(Stage::PowerDomain)?;
        let result: RuntimeResult<()> = match power {
            Some(p) => p.enable_arena_memory().map_err(|f| ConfigError::PowerDomain(f.0).into()),
            None => Ok(()),
        }
        .and_then(|()| memory_test(region));
        if result.is_ok() {
            self.indicator.blink(Color::GREEN, 1, 400);
        }
        self.finish(Stage::PowerDomain, result)
    }

    pub fn init_accelerator(&mut self, accelerator: Option<&mut (dyn Accelerator + '_)>) -> RuntimeResult<()> {
        self.begin(Stage::Accelerator)?;
        let result: RuntimeResult<()> = match accelerator {
            Some(npu) => npu.initialize().map_err(|f| ConfigError::Accelerator(f.0).into()),
            None => {
                info!("no accelerator, delegate ops will fail");
                Ok(())
            }
        };
        self.finish(Stage::Accelerator, result)
    }

    pub fn init_runtime(&mut self, ctx: &InferenceContext<'_>) -> RuntimeResult<()> {
        self.begin(Stage::Runtime)?;
        let result = ctx.config().validate();
        self.finish(Stage::Runtime, result)
    }

    pub fn load_program<'a>(&mut self, ctx: &mut InferenceContext<'a>, model: &'a [u8]) -> RuntimeResult<()> {
        self.begin(Stage::ProgramLoad)?;
        let _ = writeln!(self.console, "[BOOT] loading model ({} bytes)\r", model.len());
        let result = ctx.load_program(model).map(|_| ());
        self.finish(Stage::ProgramLoad, result)
    }

    pub fn load_method<'a>(&mut self, ctx: &mut InferenceContext<'a>, pools: ArenaPools<'a>) -> RuntimeResult<()> {
        self.begin(Stage::MethodLoad)?;
        let result = ctx.load_method(pools).map(|_| ());
        self.finish(Stage::MethodLoad, result)
    }

    /// Run `input` once and return the predicted class (argmax of `output`).
    pub fn first_execution(
        &mut self,
        ctx: &mut InferenceContext<'_>,
        input: &[u8],
        output: &mut [u8],
        accelerator: Option<&mut (dyn Accelerator + '_)>,
    ) -> RuntimeResult<usize> {
        self.begin(Stage::FirstExecution)?;
        let result = ctx.run_checked(input, output, accelerator).and_then(|written| {
            argmax_i8(bytemuck::cast_slice(&output[..written]))
                .ok_or(RuntimeError::InvalidArgument { what: "empty output" })
        });
        if let Ok(class) = result {
            let _ = writeln!(self.console, "[BOOT] predicted class {}\r", class);
        }
        self.finish(Stage::FirstExecution, result)
    }

    /// Every stage in order. Returns the first failure, if any.
    pub fn run_all<'a>(
        &mut self,
        hw: Hardware<'_>,
        ctx: &mut InferenceContext<'a>,
        model: &'a [u8],
        mut pools: ArenaPools<'a>,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, StageFailure> {
        let Hardware { board, power, mut accelerator } = hw;
        let steps = (|| {
            self.configure_board(board)?;
            self.enable_power(power, &mut *pools.method)?;
            self.init_accelerator(accelerator.as_deref_mut())?;
            self.init_runtime(ctx)?;
            self.load_program(ctx, model)?;
            self.load_method(ctx, pools)?;
            self.first_execution(ctx, input, output, accelerator)
        })();
        steps.map_err(|_| match self.state {
            BringUpState::Failed(failure) => failure,
            _ => StageFailure {
                stage: Stage::Board,
                error: RuntimeError::InvalidArgument { what: "bring-up state lost" },
            },
        })
    }

    /// Solid green, then one green pulse per class index (class 0 = one).
    pub fn signal_prediction(&mut self, class: usize) {
        self.indicator.set(Color::GREEN);
        self.indicator.delay_ms(1000);
        self.indicator.blink(Color::GREEN, class as u32 + 1, 600);
        self.indicator.set(Color::WHITE);
    }

    /// Report the failure and blink red forever.
    pub fn halt(&mut self, failure: &StageFailure) -> ! {
        halt(failure, self.console, self.indicator)
    }
}

fn memory_test(region: &mut [u8]) -> RuntimeResult<()> {
    let Some(word) = region.get_mut(..4) else {
        return Err(ConfigError::EmptyPool("method").into());
    };
    for (byte, value) in word.iter_mut().zip(MEMORY_TEST_PATTERN.to_le_bytes()) {
        // SAFETY: `byte` is a valid, exclusive reference.
        unsafe { core::ptr::write_volatile(byte, value) };
    }
    let mut read = [0u8; 4];
    for (dst, byte) in read.iter_mut().zip(word.iter()) {
        // SAFETY: as above; read back through the same reference.
        *dst = unsafe { core::ptr::read_volatile(byte) };
    }
    word.fill(0);

    let read = u32::from_le_bytes(read);
    if read != MEMORY_TEST_PATTERN {
        return Err(ConfigError::MemoryTest { wrote: MEMORY_TEST_PATTERN, read }.into());
    }
    Ok(())
}

/// Print the failure on `console` and enter the fast red blink loop.
pub fn halt(failure: &StageFailure, console: &mut dyn Write, indicator: &mut dyn StatusIndicator) -> ! {
    let _ = writeln!(
        console,
        "[HALT] {} failed, status {:#06x}: {}\r",
        failure.stage,
        failure.error.code(),
        failure.error
    );
    loop {
        indicator.blink(Color::RED, 1, 200);
    }
}
