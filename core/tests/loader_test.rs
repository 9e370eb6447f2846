//! Program image validation: every malformed image is rejected with a typed
//! `LoadError` before any memory is planned.

mod common;

use common::*;
use nano_exec_core::format::{OpCode, OpRecord, HEADER_LEN, NO_VALUE};
use nano_exec_core::*;

fn load_err(image: &[u8]) -> LoadError {
    match Program::load(image) {
        Err(RuntimeError::Load(e)) => e,
        Err(other) => panic!("expected a load error, got {other}"),
        Ok(_) => panic!("image unexpectedly loaded"),
    }
}

/// One-op method `relu(x) -> y` with the given value records.
fn relu_image(x: Shape, x_buffer: u16, x_offset: u32, y_offset: u32, planned: u32) -> Vec<u8> {
    let mut def = MethodDef::new("forward");
    def.planned_buffer(planned);
    let x = def.planned_tensor(DType::Int8, x, x_buffer, x_offset);
    let y = def.planned_tensor(DType::Int8, Shape::d1(4), 0, y_offset);
    def.input(x).output(y);
    def.op(&Op { kind: OpKind::Relu(ops::Relu), input: x as usize, params: [None, None], output: y as usize });
    let mut builder = ProgramBuilder::new();
    builder.method(def);
    builder.build()
}

// =============================================================================
// Header
// =============================================================================

#[test]
fn test_valid_image_loads() {
    let image = mnist_program();
    let program = Program::load(&image).unwrap();
    let meta = program.method_meta("forward").unwrap();
    assert_eq!(meta.num_ops(), 4);
    assert_eq!(meta.num_values(), 9);
    assert_eq!(meta.input_tensor_meta(0).unwrap().shape, Shape::d4(1, 1, 28, 28));
    assert_eq!(meta.output_tensor_meta(0).unwrap().shape, Shape::d1(10));
}

#[test]
fn test_empty_and_short_buffers() {
    assert_eq!(load_err(&[]), LoadError::BufferTooShort { required: HEADER_LEN, actual: 0 });
    let image = mnist_program();
    assert_eq!(load_err(&image[..20]), LoadError::BufferTooShort { required: HEADER_LEN, actual: 20 });
}

#[test]
fn test_bad_magic() {
    let mut image = mnist_program();
    image[0] = b'X';
    assert_eq!(load_err(&image), LoadError::BadMagic);
}

#[test]
fn test_unsupported_version() {
    let mut image = mnist_program();
    image[4] = 2;
    assert_eq!(load_err(&image), LoadError::UnsupportedVersion(2));
}

#[test]
fn test_truncated_image() {
    let image = mnist_program();
    let cut = image.len() - 100;
    assert_eq!(load_err(&image[..cut]), LoadError::Truncated { declared: image.len(), actual: cut });
}

#[test]
fn test_corrupt_payload_fails_checksum() {
    let mut image = mnist_program();
    image[HEADER_LEN + 40] ^= 0x80;
    assert!(matches!(load_err(&image), LoadError::ChecksumMismatch { .. }));
}

#[test]
fn test_load_error_codes_reach_the_status_channel() {
    let mut image = mnist_program();
    image[0] = 0;
    let err = Program::load(&image).unwrap_err();
    assert_eq!(err.code(), 0x302);
}

// =============================================================================
// Tables and operands
// =============================================================================

#[test]
fn test_unknown_opcode() {
    let mut def = MethodDef::new("forward");
    def.planned_buffer(8);
    let x = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 0);
    let y = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 4);
    def.input(x).output(y);
    def.ops.push(OpRecord { opcode: 42, inputs: [x, NO_VALUE, NO_VALUE], output: y, params: [0; 5] });
    let mut builder = ProgramBuilder::new();
    builder.method(def);
    assert_eq!(load_err(&builder.build()), LoadError::UnknownOpcode(42));
}

#[test]
fn test_overlapping_operands_are_rejected() {
    let image = relu_image(Shape::d1(4), 0, 0, 2, 8);
    assert_eq!(load_err(&image), LoadError::AliasedOperands { op: 0 });
    assert!(Program::load(&relu_image(Shape::d1(4), 0, 0, 4, 8)).is_ok());
}

#[test]
fn test_op_writing_over_method_input_is_rejected() {
    // relu(x) -> t, then relu(t) -> y where y reuses x's bytes.
    let mut def = MethodDef::new("forward");
    def.planned_buffer(8);
    let x = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 0);
    let t = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 4);
    let y = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 0);
    def.input(x).output(y);
    def.op(&Op { kind: OpKind::Relu(ops::Relu), input: x as usize, params: [None, None], output: t as usize });
    def.op(&Op { kind: OpKind::Relu(ops::Relu), input: t as usize, params: [None, None], output: y as usize });
    let mut builder = ProgramBuilder::new();
    builder.method(def);

    let err = load_err(&builder.build());
    assert_eq!(err, LoadError::InputOverwritten { op: 1, input: 0 });
    assert_eq!(err.code(), 22);
}

#[test]
fn test_tensor_past_its_planned_buffer() {
    let image = relu_image(Shape::d1(4), 0, 6, 0, 8);
    assert_eq!(load_err(&image), LoadError::PlannedRange { buffer: 0 });
}

#[test]
fn test_missing_planned_buffer() {
    let image = relu_image(Shape::d1(4), 3, 0, 4, 8);
    assert_eq!(load_err(&image), LoadError::PlannedBufferIndex { index: 3, count: 1 });
}

#[test]
fn test_shape_disagreement_between_op_and_output() {
    let image = relu_image(Shape::d1(3), 0, 0, 4, 8);
    assert_eq!(load_err(&image), LoadError::ShapeMismatch { op: 0, expected: 3, actual: 4 });
}

#[test]
fn test_constant_method_input_is_rejected() {
    let mut builder = ProgramBuilder::new();
    let offset = builder.constant_i8(&[1, 2, 3, 4]);
    let mut def = MethodDef::new("forward");
    def.planned_buffer(4);
    let x = def.constant_tensor(DType::Int8, Shape::d1(4), offset);
    let y = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 0);
    def.input(x).output(y);
    builder.method(def);
    assert_eq!(load_err(&builder.build()), LoadError::IoKind { index: 0 });
}

#[test]
fn test_constant_past_segment_end() {
    let mut builder = ProgramBuilder::new();
    builder.constant(&[0; 4]);
    let mut def = MethodDef::new("forward");
    def.planned_buffer(4);
    let x = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 0);
    def.constant_tensor(DType::Int8, Shape::d1(16), 0);
    def.input(x).output(x);
    builder.method(def);
    assert_eq!(load_err(&builder.build()), LoadError::ConstantRange);
}

#[test]
fn test_dense_weights_must_be_constants() {
    let mut def = MethodDef::new("forward");
    def.planned_buffer(16);
    let x = def.planned_tensor(DType::Int8, Shape::d1(2), 0, 0);
    let w = def.planned_tensor(DType::Int8, Shape::d2(2, 2), 0, 4);
    let b = def.planned_tensor(DType::Int8, Shape::d1(2), 0, 8);
    let y = def.planned_tensor(DType::Int8, Shape::d1(2), 0, 12);
    def.input(x).output(y);
    def.ops.push(OpRecord { opcode: OpCode::Dense as u8, inputs: [x, w, b], output: y, params: [1, 0, 0, 0, 0] });
    let mut builder = ProgramBuilder::new();
    builder.method(def);
    assert_eq!(load_err(&builder.build()), LoadError::OperandKind { op: 0, operand: 1 });
}

#[test]
fn test_scalar_outputs_are_not_tensors() {
    let mut def = MethodDef::new("forward");
    def.planned_buffer(4);
    let x = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 0);
    let n = def.int(10);
    def.input(x).output(n);
    let mut builder = ProgramBuilder::new();
    builder.method(def);
    let image = builder.build();

    let program = Program::load(&image).unwrap();
    let meta = program.method_meta("forward").unwrap();
    assert_eq!(meta.value(1), Ok(Value::Int(10)));
    assert_eq!(
        meta.output_tensor_meta(0),
        Err(RuntimeError::Binding(BindingError::NotATensor { index: 0 }))
    );
}

// =============================================================================
// Multiple methods
// =============================================================================

#[test]
fn test_methods_are_found_by_name() {
    let mut def = MethodDef::new("forward");
    def.planned_buffer(8);
    let x = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 0);
    let y = def.planned_tensor(DType::Int8, Shape::d1(4), 0, 4);
    def.input(x).output(y);
    def.op(&Op { kind: OpKind::Tanh(ops::Tanh), input: x as usize, params: [None, None], output: y as usize });
    let mut builder = ProgramBuilder::new();
    builder.method(MethodDef::new("noop")).method(def);
    let image = builder.build();

    let program = Program::load(&image).unwrap();
    assert_eq!(program.num_methods(), 2);
    assert_eq!(program.method_name(1).unwrap(), "forward");
    assert_eq!(program.method_meta("forward").unwrap().num_ops(), 1);
    assert_eq!(program.method_meta("noop").unwrap().num_ops(), 0);
    assert!(program.method_name(2).is_err());
}

#[test]
fn test_custom_entry_point() {
    let image = SequentialBuilder::new(Shape::d1(4)).relu().with_name("classify").build().unwrap();
    let mut pools = TestPools::new();

    let mut ctx = InferenceContext::new();
    assert_eq!(
        ctx.init(&image, pools.split()).err(),
        Some(RuntimeError::Binding(BindingError::MethodNotFound))
    );

    let mut pools = TestPools::new();
    let mut ctx = InferenceContext::with_config(RuntimeConfig::new().with_entry_point("classify"));
    ctx.init(&image, pools.split()).unwrap();
    let mut out = [0i8; 4];
    assert_eq!(ctx.run_i8(&[-1, 2, -3, 4], &mut out), Status::Ok);
    assert_eq!(out, [0, 2, 0, 4]);
}
