//! Host-side image builder.
//!
//! [`ProgramBuilder`] writes any image the format can express, malformed ones
//! included, which is what loader tests need. [`SequentialBuilder`] sits on
//! top and turns a layer stack into a valid `forward` method. Buffer 0 holds
//! the input alone so it survives repeated executes; activations ping-pong
//! between buffers 1 and 2 (layer `i` writes `1 + i % 2`), so every tensor
//! shares bytes with the one two steps back.

use std::string::String;
use std::vec::Vec;

use crate::config::DEFAULT_ENTRY_POINT;
use crate::error::{LoadError, RuntimeResult};
use crate::format::{
    self, Header, MethodRecord, OpRecord, ValueRecord, HEADER_LEN, KIND_CONSTANT, KIND_INT, KIND_PLANNED,
    METHOD_RECORD_LEN, OP_RECORD_LEN, VALUE_RECORD_LEN, VERSION,
};
use crate::ops::{Conv2d, Delegate, Dense, Flatten, MaxPool2d, Op, OpKind, Relu, Sigmoid, Softmax, Tanh};
use crate::tensor::{DType, Shape};

fn dims_of(shape: &Shape) -> [u32; 4] {
    let mut dims = [0u32; 4];
    for (d, &s) in dims.iter_mut().zip(shape.as_slice()) {
        *d = s as u32;
    }
    dims
}

/// One method's tables, in wire form.
#[derive(Debug, Clone, Default)]
pub struct MethodDef {
    pub name: String,
    pub planned_sizes: Vec<u32>,
    pub values: Vec<ValueRecord>,
    pub inputs: Vec<u16>,
    pub outputs: Vec<u16>,
    pub ops: Vec<OpRecord>,
}

impl MethodDef {
    pub fn new(name: &str) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Declare a planned buffer; returns its index.
    pub fn planned_buffer(&mut self, size: u32) -> u16 {
        self.planned_sizes.push(size);
        (self.planned_sizes.len() - 1) as u16
    }

    pub fn value(&mut self, rec: ValueRecord) -> u16 {
        self.values.push(rec);
        (self.values.len() - 1) as u16
    }

    pub fn planned_tensor(&mut self, dtype: DType, shape: Shape, buffer: u16, offset: u32) -> u16 {
        self.value(ValueRecord {
            kind: KIND_PLANNED,
            dtype: dtype as u8,
            ndim: shape.ndim as u8,
            buffer,
            offset,
            dims: dims_of(&shape),
        })
    }

    pub fn constant_tensor(&mut self, dtype: DType, shape: Shape, offset: u32) -> u16 {
        self.value(ValueRecord {
            kind: KIND_CONSTANT,
            dtype: dtype as u8,
            ndim: shape.ndim as u8,
            buffer: 0,
            offset,
            dims: dims_of(&shape),
        })
    }

    pub fn int(&mut self, v: i32) -> u16 {
        self.value(ValueRecord { kind: KIND_INT, offset: v as u32, ..ValueRecord::default() })
    }

    pub fn input(&mut self, id: u16) -> &mut Self {
        self.inputs.push(id);
        self
    }

    pub fn output(&mut self, id: u16) -> &mut Self {
        self.outputs.push(id);
        self
    }

    pub fn op(&mut self, op: &Op) -> &mut Self {
        self.ops.push(op.encode());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
    methods: Vec<MethodDef>,
    constants: Vec<u8>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the constant segment (4-byte aligned); returns
    /// their offset within it.
    pub fn constant(&mut self, bytes: &[u8]) -> u32 {
        while self.constants.len() % 4 != 0 {
            self.constants.push(0);
        }
        let offset = self.constants.len() as u32;
        self.constants.extend_from_slice(bytes);
        offset
    }

    pub fn constant_i8(&mut self, data: &[i8]) -> u32 {
        self.constant(bytemuck::cast_slice(data))
    }

    pub fn method(&mut self, def: MethodDef) -> &mut Self {
        self.methods.push(def);
        self
    }

    /// Serialize. Offsets are laid out in emission order and the checksum
    /// covers everything after the header.
    pub fn build(&self) -> Vec<u8> {
        let table_len = self.methods.len() * METHOD_RECORD_LEN;
        let mut body: Vec<u8> = Vec::new();
        let mut records = Vec::with_capacity(self.methods.len());
        let base = HEADER_LEN + table_len;

        for m in &self.methods {
            let at = |body: &Vec<u8>| (base + body.len()) as u32;
            let mut rec = MethodRecord {
                name_len: m.name.len() as u16,
                input_count: m.inputs.len() as u8,
                output_count: m.outputs.len() as u8,
                value_count: m.values.len() as u16,
                op_count: m.ops.len() as u16,
                planned_count: m.planned_sizes.len() as u16,
                ..MethodRecord::default()
            };

            rec.name_offset = at(&body);
            body.extend_from_slice(m.name.as_bytes());
            while body.len() % 4 != 0 {
                body.push(0);
            }

            rec.planned_sizes_offset = at(&body);
            for size in &m.planned_sizes {
                body.extend_from_slice(&size.to_le_bytes());
            }

            rec.values_offset = at(&body);
            for v in &m.values {
                let start = body.len();
                body.resize(start + VALUE_RECORD_LEN, 0);
                v.write(&mut body[start..]);
            }

            rec.inputs_offset = at(&body);
            for id in &m.inputs {
                body.extend_from_slice(&id.to_le_bytes());
            }
            rec.outputs_offset = at(&body);
            for id in &m.outputs {
                body.extend_from_slice(&id.to_le_bytes());
            }
            while body.len() % 4 != 0 {
                body.push(0);
            }

            rec.ops_offset = at(&body);
            for op in &m.ops {
                let start = body.len();
                body.resize(start + OP_RECORD_LEN, 0);
                op.write(&mut body[start..]);
            }
            records.push(rec);
        }

        let constant_offset = base + body.len();
        body.extend_from_slice(&self.constants);

        let total = base + body.len();
        let mut image = std::vec![0u8; total];
        for (i, rec) in records.iter().enumerate() {
            let start = HEADER_LEN + i * METHOD_RECORD_LEN;
            rec.write(&mut image[start..start + METHOD_RECORD_LEN]);
        }
        image[base..].copy_from_slice(&body);

        let header = Header {
            version: VERSION,
            method_count: self.methods.len() as u16,
            total_len: total as u32,
            method_table_offset: HEADER_LEN as u32,
            constant_offset: constant_offset as u32,
            constant_len: self.constants.len() as u32,
            checksum: format::checksum(&image[HEADER_LEN..]),
        };
        header.write(&mut image[..HEADER_LEN]);
        image
    }
}

#[derive(Debug, Clone)]
enum Layer {
    Dense { weights: Vec<i8>, bias: Vec<i8>, op: Dense },
    Conv2d { kernel: Vec<i8>, bias: Vec<i8>, kh: usize, kw: usize, op: Conv2d },
    Delegate { payload: Vec<u8>, op: Delegate },
    Plain(OpKind),
}

/// Layer stack compiled into a single-input, single-output method.
#[derive(Debug, Clone)]
pub struct SequentialBuilder {
    name: String,
    input: Shape,
    layers: Vec<Layer>,
}

impl SequentialBuilder {
    pub fn new(input: Shape) -> Self {
        Self { name: DEFAULT_ENTRY_POINT.into(), input, layers: Vec::new() }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    /// Weights are `[out × in]` row-major; `out` is `bias.len()`.
    pub fn dense(mut self, weights: &[i8], bias: &[i8], requant_m: i32, requant_shift: u32) -> Self {
        self.layers.push(Layer::Dense {
            weights: weights.to_vec(),
            bias: bias.to_vec(),
            op: Dense { requant_m, requant_shift },
        });
        self
    }

    /// Kernel is `[out_ch × in_ch × kh × kw]`; `out_ch` is `bias.len()`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        mut self,
        kernel: &[i8],
        bias: &[i8],
        kh: usize,
        kw: usize,
        stride: usize,
        padding: usize,
        requant_m: i32,
        requant_shift: u32,
    ) -> Self {
        self.layers.push(Layer::Conv2d {
            kernel: kernel.to_vec(),
            bias: bias.to_vec(),
            kh,
            kw,
            op: Conv2d { stride, padding, requant_m, requant_shift },
        });
        self
    }

    pub fn max_pool(mut self, pool_h: usize, pool_w: usize, stride: usize) -> Self {
        self.layers.push(Layer::Plain(OpKind::MaxPool2d(MaxPool2d { pool_h, pool_w, stride })));
        self
    }

    pub fn relu(mut self) -> Self {
        self.layers.push(Layer::Plain(OpKind::Relu(Relu)));
        self
    }

    pub fn sigmoid(mut self) -> Self {
        self.layers.push(Layer::Plain(OpKind::Sigmoid(Sigmoid)));
        self
    }

    pub fn tanh(mut self) -> Self {
        self.layers.push(Layer::Plain(OpKind::Tanh(Tanh)));
        self
    }

    pub fn softmax(mut self) -> Self {
        self.layers.push(Layer::Plain(OpKind::Softmax(Softmax)));
        self
    }

    pub fn flatten(mut self) -> Self {
        self.layers.push(Layer::Plain(OpKind::Flatten(Flatten)));
        self
    }

    /// Subgraph run by the accelerator, producing `output_len` elements.
    pub fn delegate(mut self, payload: &[u8], output_len: usize) -> Self {
        self.layers.push(Layer::Delegate { payload: payload.to_vec(), op: Delegate { output_len } });
        self
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Plan, validate shapes and serialize.
    pub fn build(&self) -> RuntimeResult<Vec<u8>> {
        let mut program = ProgramBuilder::new();
        let mut def = MethodDef::new(&self.name);
        let mut sizes = [0u32; 3];

        let mut shape = self.input;
        let mut current = def.planned_tensor(DType::Int8, shape, 0, 0);
        sizes[0] = shape.total() as u32;
        def.input(current);

        for (index, layer) in self.layers.iter().enumerate() {
            let (kind, params) = match layer {
                Layer::Dense { weights, bias, op } => {
                    let out = bias.len();
                    let in_features = if out == 0 { 0 } else { weights.len() / out };
                    let w = def.constant_tensor(DType::Int8, Shape::d2(out, in_features), program.constant_i8(weights));
                    let b = def.constant_tensor(DType::Int8, Shape::d1(out), program.constant_i8(bias));
                    (OpKind::Dense(*op), [Some(w), Some(b)])
                }
                Layer::Conv2d { kernel, bias, kh, kw, op } => {
                    let in_ch = shape.chw().map_or(0, |(c, _, _)| c);
                    let k_shape = Shape::d4(bias.len(), in_ch, *kh, *kw);
                    if k_shape.total() != kernel.len() {
                        let (expected, actual) = (k_shape.total(), kernel.len());
                        return Err(LoadError::ShapeMismatch { op: index, expected, actual }.into());
                    }
                    let k = def.constant_tensor(DType::Int8, k_shape, program.constant_i8(kernel));
                    let b = def.constant_tensor(DType::Int8, Shape::d1(bias.len()), program.constant_i8(bias));
                    (OpKind::Conv2d(*op), [Some(k), Some(b)])
                }
                Layer::Delegate { payload, op } => {
                    let p = def.constant_tensor(DType::UInt8, Shape::d1(payload.len()), program.constant(payload));
                    (OpKind::Delegate(*op), [Some(p), None])
                }
                Layer::Plain(kind) => (*kind, [None, None]),
            };

            let param_shapes = params.map(|id| {
                id.map(|id| {
                    let rec = &def.values[id as usize];
                    let dims: Vec<usize> = rec.dims[..rec.ndim as usize].iter().map(|&d| d as usize).collect();
                    Shape::from_dims(&dims)
                })
                .transpose()
            });
            let param_shapes = [param_shapes[0]?, param_shapes[1]?];
            let out_shape = kind
                .kernel()
                .output_shape(&shape, param_shapes)
                .ok_or(LoadError::InvalidParam { op: index })?;

            let buffer = 1 + index % 2;
            sizes[buffer] = sizes[buffer].max(out_shape.total() as u32);
            let output = def.planned_tensor(DType::Int8, out_shape, buffer as u16, 0);
            def.op(&Op {
                kind,
                input: current as usize,
                params: params.map(|p| p.map(usize::from)),
                output: output as usize,
            });
            current = output;
            shape = out_shape;
        }

        let buffers = 1 + self.layers.len().min(2);
        for size in &sizes[..buffers] {
            def.planned_buffer(*size);
        }
        def.output(current);
        program.method(def);
        Ok(program.build())
    }
}
