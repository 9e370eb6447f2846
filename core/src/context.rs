//! The single live program/method pair, as an explicit context object.
//!
//! Firmware keeps one `InferenceContext` in a static and passes it by
//! reference to `run()`; tests build as many as they like.

use log::{error, info, warn};

use crate::arena::ArenaPools;
use crate::bringup::Stage;
use crate::config::RuntimeConfig;
use crate::error::{BindingError, RuntimeError, RuntimeResult, Status};
use crate::memory::MemoryManager;
use crate::method::Method;
use crate::platform::Accelerator;
use crate::program::Program;

pub struct InferenceContext<'a> {
    config: RuntimeConfig,
    program: Option<Program<'a>>,
    method: Option<Method<'a>>,
}

impl<'a> InferenceContext<'a> {
    pub const fn new() -> Self {
        Self::with_config(RuntimeConfig::new())
    }

    pub const fn with_config(config: RuntimeConfig) -> Self {
        Self { config, program: None, method: None }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.method.is_some()
    }

    pub fn program(&self) -> Option<&Program<'a>> {
        self.program.as_ref()
    }

    pub fn method(&self) -> Option<&Method<'a>> {
        self.method.as_ref()
    }

    pub fn method_mut(&mut self) -> Option<&mut Method<'a>> {
        self.method.as_mut()
    }

    /// Validate `model` and keep it as the current program, dropping any
    /// method loaded from the previous one. A rejected image leaves the
    /// context untouched.
    pub fn load_program(&mut self, model: &'a [u8]) -> RuntimeResult<Program<'a>> {
        if model.is_empty() {
            return Err(RuntimeError::InvalidArgument { what: "model image is empty" });
        }
        let program = Program::load_with(model, &self.config)?;
        self.method = None;
        self.program = Some(program);
        Ok(program)
    }

    /// Plan memory for the entry point out of `pools` and load it.
    pub fn load_method(&mut self, pools: ArenaPools<'a>) -> RuntimeResult<&mut Method<'a>> {
        let program = self
            .program
            .ok_or(RuntimeError::Sequence { expected: Stage::ProgramLoad, attempted: Stage::MethodLoad })?;
        let meta = program.method_meta(self.config.entry_point)?;
        let memory = MemoryManager::for_method(&meta, pools, self.config.alignment)?;
        let method = program.load_method(self.config.entry_point, memory)?;
        Ok(self.method.insert(method))
    }

    /// Load `model` and its entry point. A second call on an initialized
    /// context does nothing and succeeds.
    pub fn init(&mut self, model: &'a [u8], pools: ArenaPools<'a>) -> RuntimeResult<()> {
        if self.is_initialized() {
            warn!("init on an initialized context ignored");
            return Ok(());
        }
        self.config.validate()?;
        self.load_program(model)?;
        self.load_method(pools)?;
        info!("context initialized, entry point '{}'", self.config.entry_point);
        Ok(())
    }

    /// Bind `input`, execute, copy at most `output.len()` bytes out.
    pub fn run(&mut self, input: &[u8], output: &mut [u8]) -> Status {
        self.run_with(input, output, None)
    }

    pub fn run_i8(&mut self, input: &[i8], output: &mut [i8]) -> Status {
        self.run(bytemuck::cast_slice(input), bytemuck::cast_slice_mut(output))
    }

    /// Status-code flavour of [`run_checked`](Self::run_checked).
    pub fn run_with(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        accelerator: Option<&mut (dyn Accelerator + '_)>,
    ) -> Status {
        let Some(method) = self.method.as_mut() else {
            error!("run: not initialized");
            return Status::NotInitialized;
        };
        if input.is_empty() || output.is_empty() {
            error!("run: empty input or output buffer");
            return Status::InvalidArguments;
        }
        if let Err(e) = method.set_input(0, input) {
            error!("run: binding input failed: {}", e);
            return match e {
                RuntimeError::Binding(BindingError::NotATensor { .. }) => Status::NotATensor,
                _ => Status::InvalidArguments,
            };
        }
        if let Err(e) = method.execute_with(accelerator) {
            error!("run: execute failed: {}", e);
            return Status::ExecuteFailed;
        }
        match method.copy_output(0, output) {
            Ok(_) => Status::Ok,
            Err(e) => {
                error!("run: reading output failed: {}", e);
                Status::OutputNotATensor
            }
        }
    }

    /// Bind, execute and copy out, propagating the first error. Returns the
    /// number of output bytes written.
    pub fn run_checked(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        accelerator: Option<&mut (dyn Accelerator + '_)>,
    ) -> RuntimeResult<usize> {
        let method = self.method.as_mut().ok_or(RuntimeError::Sequence {
            expected: Stage::MethodLoad,
            attempted: Stage::FirstExecution,
        })?;
        if input.is_empty() || output.is_empty() {
            return Err(RuntimeError::InvalidArgument { what: "input and output must be non-empty" });
        }
        method.set_input(0, input)?;
        method.execute_with(accelerator)?;
        method.copy_output(0, output)
    }

    /// Clear a faulted method so it can run again.
    pub fn recover(&mut self) -> RuntimeResult<()> {
        let method = self.method.as_mut().ok_or(RuntimeError::Sequence {
            expected: Stage::MethodLoad,
            attempted: Stage::FirstExecution,
        })?;
        method.reset();
        Ok(())
    }

    /// Drop the method and program. Arenas stay borrowed until the context
    /// itself goes away.
    pub fn deinit(&mut self) {
        self.method = None;
        self.program = None;
        info!("context deinitialized");
    }
}

impl Default for InferenceContext<'_> {
    fn default() -> Self {
        Self::new()
    }
}
