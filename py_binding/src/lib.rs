//! Python bindings for nano-exec-core via PyO3.
//!
//! `SequentialProgram` builds NANO images from Python; `Runtime` loads one and
//! runs it on the host with the same loader and kernels the firmware uses.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use nano_exec_core::{
    argmax_i8, ArenaPools, BindingPolicy, InferenceContext, RuntimeConfig, RuntimeError, SequentialBuilder, Shape,
};

fn to_py_err(e: RuntimeError) -> PyErr {
    PyValueError::new_err(format!("{} (status {:#06x})", e, e.code()))
}

fn shape_from(dims: &[usize]) -> PyResult<Shape> {
    Shape::from_dims(dims).map_err(|e| to_py_err(e.into()))
}

/// Layer stack compiled into a single `forward` method.
#[pyclass(name = "SequentialProgram")]
pub struct PySequentialProgram {
    builder: SequentialBuilder,
}

impl PySequentialProgram {
    fn push(&mut self, add: impl FnOnce(SequentialBuilder) -> SequentialBuilder) {
        let builder = std::mem::replace(&mut self.builder, SequentialBuilder::new(Shape::d1(1)));
        self.builder = add(builder);
    }
}

#[pymethods]
impl PySequentialProgram {
    #[new]
    #[pyo3(signature = (input_shape, method_name = "forward"))]
    fn new(input_shape: Vec<usize>, method_name: &str) -> PyResult<Self> {
        let shape = shape_from(&input_shape)?;
        Ok(Self { builder: SequentialBuilder::new(shape).with_name(method_name) })
    }

    #[pyo3(signature = (weights, bias, requant_m = 1, requant_shift = 0))]
    fn add_dense(&mut self, weights: Vec<i8>, bias: Vec<i8>, requant_m: i32, requant_shift: u32) {
        self.push(|b| b.dense(&weights, &bias, requant_m, requant_shift));
    }

    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (kernel, bias, kh, kw, stride = 1, padding = 0, requant_m = 1, requant_shift = 0))]
    fn add_conv2d(
        &mut self,
        kernel: Vec<i8>,
        bias: Vec<i8>,
        kh: usize,
        kw: usize,
        stride: usize,
        padding: usize,
        requant_m: i32,
        requant_shift: u32,
    ) {
        self.push(|b| b.conv2d(&kernel, &bias, kh, kw, stride, padding, requant_m, requant_shift));
    }

    fn add_max_pool2d(&mut self, pool_h: usize, pool_w: usize, stride: usize) {
        self.push(|b| b.max_pool(pool_h, pool_w, stride));
    }

    fn add_relu(&mut self) {
        self.push(SequentialBuilder::relu);
    }

    fn add_sigmoid(&mut self) {
        self.push(SequentialBuilder::sigmoid);
    }

    fn add_tanh(&mut self) {
        self.push(SequentialBuilder::tanh);
    }

    fn add_softmax(&mut self) {
        self.push(SequentialBuilder::softmax);
    }

    fn add_flatten(&mut self) {
        self.push(SequentialBuilder::flatten);
    }

    fn add_delegate(&mut self, payload: Vec<u8>, output_len: usize) {
        self.push(|b| b.delegate(&payload, output_len));
    }

    fn num_layers(&self) -> usize {
        self.builder.num_layers()
    }

    /// Serialized image as `bytes`.
    fn build<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyBytes>> {
        let image = self.builder.build().map_err(to_py_err)?;
        Ok(PyBytes::new_bound(py, &image))
    }

    /// Write the image to `path`, ready for `include_bytes!` in firmware.
    fn export_to_flash(&self, path: &str) -> PyResult<usize> {
        let image = self.builder.build().map_err(to_py_err)?;
        std::fs::write(path, &image).map_err(|e| PyValueError::new_err(format!("Failed to write {}: {}", path, e)))?;
        Ok(image.len())
    }
}

/// A loaded program plus its arenas.
///
/// The image and the three pools are leaked so the context can borrow them
/// for `'static`; each `Runtime` therefore costs its pool sizes for the life
/// of the interpreter.
#[pyclass(name = "Runtime")]
pub struct PyRuntime {
    ctx: InferenceContext<'static>,
    output_len: usize,
}

fn leak(size: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; size].into_boxed_slice())
}

#[pymethods]
impl PyRuntime {
    #[new]
    #[pyo3(signature = (
        image,
        method_pool = 16 * 1024,
        planned_pool = 64 * 1024,
        temp_pool = 32 * 1024,
        strict = false,
        verify_checksum = true
    ))]
    fn new(
        image: Vec<u8>,
        method_pool: usize,
        planned_pool: usize,
        temp_pool: usize,
        strict: bool,
        verify_checksum: bool,
    ) -> PyResult<Self> {
        let binding = if strict { BindingPolicy::Strict } else { BindingPolicy::Lenient };
        let config = RuntimeConfig::new().with_binding(binding).with_checksum(verify_checksum);
        let image: &'static [u8] = Box::leak(image.into_boxed_slice());
        let temp = if temp_pool == 0 { None } else { Some(leak(temp_pool)) };
        let pools = ArenaPools::new(leak(method_pool), leak(planned_pool), temp);

        let mut ctx = InferenceContext::with_config(config);
        ctx.init(image, pools).map_err(to_py_err)?;
        let output_len = ctx
            .method()
            .and_then(|m| m.meta().output_tensor_meta(0).ok())
            .map_or(0, |t| t.nbytes());
        Ok(Self { ctx, output_len })
    }

    /// Run once and return output 0.
    fn run(&mut self, input: Vec<i8>) -> PyResult<Vec<i8>> {
        let mut output = vec![0i8; self.output_len.max(1)];
        let written = self
            .ctx
            .run_checked(bytemuck::cast_slice(&input), bytemuck::cast_slice_mut(&mut output), None)
            .map_err(to_py_err)?;
        output.truncate(written);
        Ok(output)
    }

    /// C-style status of one run, as firmware would see it.
    fn run_status(&mut self, input: Vec<i8>) -> i32 {
        let mut output = vec![0i8; self.output_len.max(1)];
        self.ctx.run_i8(&input, &mut output).code()
    }

    fn predict(&mut self, input: Vec<i8>) -> PyResult<usize> {
        let scores = self.run(input)?;
        argmax_i8(&scores).ok_or_else(|| PyValueError::new_err("program has an empty output"))
    }

    /// Clear a faulted method.
    fn reset(&mut self) -> PyResult<()> {
        self.ctx.recover().map_err(to_py_err)
    }

    fn executions(&self) -> u32 {
        self.ctx.method().map_or(0, |m| m.executions())
    }

    fn planned_bytes(&self) -> usize {
        self.ctx.method().map_or(0, |m| m.meta().planned_bytes())
    }

    fn scratch_bytes(&self) -> usize {
        self.ctx.method().map_or(0, |m| m.meta().scratch_bytes())
    }

    fn method_bytes(&self) -> usize {
        self.ctx.method().map_or(0, |m| m.method_bytes())
    }

    fn state(&self) -> String {
        self.ctx.method().map_or_else(|| "Uninitialized".to_string(), |m| format!("{:?}", m.state()))
    }
}

#[pymodule]
fn nano_exec_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySequentialProgram>()?;
    m.add_class::<PyRuntime>()?;
    Ok(())
}
