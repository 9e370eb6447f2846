//! Quantized i8 kernels used by the op interpreter.
//!
//! Every kernel accumulates in i32 and requantizes with a fixed-point
//! multiplier and right shift, `sat((acc * m) >> shift)`, the same scheme the
//! model exporter used to pick `m` and `shift`. An i8 product is at most
//! 127 * 127, so an i32 accumulator holds roughly 133k of them before it can
//! overflow; no layer in a microcontroller model comes close.
//!
//! Shapes are validated when the program is loaded; the checks here guard the
//! slice lengths the executor actually resolved.

use crate::error::ExecutionError;

pub type KernelResult<T> = Result<T, ExecutionError>;

/// Requantization shift for an inner product of `k` terms.
///
/// The largest accumulator is `k × 127 × 127`; shifting by `ceil(log2 k) + 7`
/// maps it back into i8.
///
/// - k=9   (3×3 conv, 1 channel): shift=11
/// - k=784 (dense over 28×28):     shift=17
#[inline]
pub fn compute_requant_shift(k: usize) -> u32 {
    let ceil_log2 = match k {
        0 | 1 => 0,
        _ => usize::BITS - (k - 1).leading_zeros(),
    };
    ceil_log2 + 7
}

#[inline(always)]
fn requantize(acc: i32, requant_m: i32, requant_shift: u32) -> i64 {
    (acc as i64 * requant_m as i64) >> requant_shift.min(63)
}

/// Clamp to i8. Takes i64 so products and bias sums never wrap first.
#[inline(always)]
fn saturate(v: i64) -> i8 {
    v.clamp(-128, 127) as i8
}

#[inline(always)]
fn dot(a: &[i8], b: impl Iterator<Item = i8>) -> i32 {
    a.iter().zip(b).map(|(&x, y)| x as i32 * y as i32).sum()
}

fn expect_len(actual: usize, expected: usize) -> KernelResult<()> {
    if actual != expected {
        return Err(ExecutionError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

// =============================================================================
// Matrix kernels
// =============================================================================

/// `out[rows × cols] = sat((A[rows × k] · B[k × cols] * m) >> shift)`, row-major.
#[allow(clippy::too_many_arguments)]
pub fn quantized_matmul_i8(
    a: &[i8],
    b: &[i8],
    output: &mut [i8],
    rows: usize,
    k: usize,
    cols: usize,
    requant_m: i32,
    requant_shift: u32,
) -> KernelResult<()> {
    expect_len(a.len(), rows * k)?;
    expect_len(b.len(), k * cols)?;
    expect_len(output.len(), rows * cols)?;

    for (a_row, out_row) in a.chunks_exact(k.max(1)).zip(output.chunks_exact_mut(cols.max(1))) {
        for (j, out) in out_row.iter_mut().enumerate() {
            let column = b.iter().skip(j).step_by(cols.max(1)).copied();
            *out = saturate(requantize(dot(a_row, column), requant_m, requant_shift));
        }
    }
    Ok(())
}

/// Fully-connected layer: `out[o] = sat(((Σ w[o,i]·x[i]) * M >> shift) + b[o])`.
///
/// Weights are `[out_features × in_features]` row-major, as exported.
pub fn dense_i8(
    input: &[i8],
    weights: &[i8],
    bias: &[i8],
    output: &mut [i8],
    requant_m: i32,
    requant_shift: u32,
) -> KernelResult<()> {
    let in_features = input.len();
    let out_features = output.len();
    expect_len(weights.len(), out_features * in_features)?;
    expect_len(bias.len(), out_features)?;

    for (o, out) in output.iter_mut().enumerate() {
        let row = &weights[o * in_features..(o + 1) * in_features];
        let acc = dot(row, input.iter().copied());
        *out = saturate(requantize(acc, requant_m, requant_shift) + bias[o] as i64);
    }
    Ok(())
}

// =============================================================================
// Convolution
// =============================================================================

/// Geometry of one 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_ch: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_ch: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    /// (out_h, out_w), or `None` if the kernel does not fit the padded input.
    pub fn output_hw(&self) -> Option<(usize, usize)> {
        conv2d_output_size(self.in_h, self.in_w, self.kh, self.kw, self.stride, self.padding)
    }

    /// Scratch bytes needed for the im2col matrix.
    pub fn im2col_len(&self) -> usize {
        match self.output_hw() {
            Some((oh, ow)) => self.in_ch * self.kh * self.kw * oh * ow,
            None => 0,
        }
    }

    /// Input pixel under kernel tap `(ky, kx)` for output `(oy, ox)`, or
    /// `None` when it falls in the zero padding.
    #[inline(always)]
    fn tap(&self, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (oy * self.stride + ky).checked_sub(self.padding)?;
        let ix = (ox * self.stride + kx).checked_sub(self.padding)?;
        (iy < self.in_h && ix < self.in_w).then_some((iy, ix))
    }
}

/// Quantized 2D convolution over CHW input, lowered to im2col + matmul.
///
/// Kernel is `[out_ch × in_ch × kh × kw]`, bias `[out_ch]`. `im2col` is the
/// op's scratch and must hold at least [`ConvGeometry::im2col_len`] bytes.
#[allow(clippy::too_many_arguments)]
pub fn conv2d_i8(
    input: &[i8],
    kernel: &[i8],
    bias: &[i8],
    output: &mut [i8],
    im2col: &mut [i8],
    geo: &ConvGeometry,
    requant_m: i32,
    requant_shift: u32,
) -> KernelResult<()> {
    let (out_h, out_w) = geo.output_hw().ok_or(ExecutionError::InvalidParameter)?;
    let plane = geo.in_h * geo.in_w;
    let taps = geo.in_ch * geo.kh * geo.kw;
    let pixels = out_h * out_w;

    expect_len(input.len(), geo.in_ch * plane)?;
    expect_len(kernel.len(), geo.out_ch * taps)?;
    expect_len(bias.len(), geo.out_ch)?;
    expect_len(output.len(), geo.out_ch * pixels)?;
    let needed = taps * pixels;
    let available = im2col.len();
    let cols = im2col
        .get_mut(..needed)
        .ok_or(ExecutionError::BufferTooSmall { required: needed, available })?;

    // Row `tap` of the matrix holds that kernel tap's input for every output
    // pixel.
    for (tap, row) in cols.chunks_exact_mut(pixels.max(1)).enumerate() {
        let c = tap / (geo.kh * geo.kw);
        let (ky, kx) = ((tap / geo.kw) % geo.kh, tap % geo.kw);
        for (pixel, slot) in row.iter_mut().enumerate() {
            *slot = geo
                .tap(pixel / out_w, pixel % out_w, ky, kx)
                .map_or(0, |(iy, ix)| input[c * plane + iy * geo.in_w + ix]);
        }
    }

    quantized_matmul_i8(kernel, cols, output, geo.out_ch, taps, pixels, requant_m, requant_shift)?;

    for (plane_out, &b) in output.chunks_exact_mut(pixels.max(1)).zip(bias) {
        for v in plane_out.iter_mut() {
            *v = saturate(*v as i64 + b as i64);
        }
    }
    Ok(())
}

/// Output spatial size of a convolution, `None` for a zero stride or a
/// kernel larger than the padded input.
pub fn conv2d_output_size(
    in_h: usize,
    in_w: usize,
    kh: usize,
    kw: usize,
    stride: usize,
    padding: usize,
) -> Option<(usize, usize)> {
    if stride == 0 || kh == 0 || kw == 0 {
        return None;
    }
    let span_h = (in_h + 2 * padding).checked_sub(kh)?;
    let span_w = (in_w + 2 * padding).checked_sub(kw)?;
    Some((span_h / stride + 1, span_w / stride + 1))
}

// =============================================================================
// Pooling
// =============================================================================

/// Max pooling over `[channels × in_h × in_w]`; windows never leave the input.
#[allow(clippy::too_many_arguments)]
pub fn max_pool_2d(
    input: &[i8],
    output: &mut [i8],
    channels: usize,
    in_h: usize,
    in_w: usize,
    pool_h: usize,
    pool_w: usize,
    stride: usize,
) -> KernelResult<()> {
    let (out_h, out_w) =
        pool_output_size(in_h, in_w, pool_h, pool_w, stride).ok_or(ExecutionError::InvalidParameter)?;
    expect_len(input.len(), channels * in_h * in_w)?;
    expect_len(output.len(), channels * out_h * out_w)?;

    let planes_in = input.chunks_exact((in_h * in_w).max(1));
    let planes_out = output.chunks_exact_mut((out_h * out_w).max(1));
    for (src, dst) in planes_in.zip(planes_out) {
        for (i, out) in dst.iter_mut().enumerate() {
            let (y0, x0) = ((i / out_w) * stride, (i % out_w) * stride);
            *out = (y0..y0 + pool_h)
                .flat_map(|y| src[y * in_w + x0..y * in_w + x0 + pool_w].iter().copied())
                .max()
                .unwrap_or(i8::MIN);
        }
    }
    Ok(())
}

pub fn pool_output_size(
    in_h: usize,
    in_w: usize,
    pool_h: usize,
    pool_w: usize,
    stride: usize,
) -> Option<(usize, usize)> {
    if stride == 0 || pool_h == 0 || pool_w == 0 || pool_h > in_h || pool_w > in_w {
        return None;
    }
    Some(((in_h - pool_h) / stride + 1, (in_w - pool_w) / stride + 1))
}

// =============================================================================
// Activations (all in place)
// =============================================================================

pub fn relu_i8(data: &mut [i8]) {
    data.iter_mut().for_each(|v| *v = (*v).max(0));
}

// sigmoid_lut[i + 128] = round(sigmoid(i / 16.0) * 127)
static SIGMOID_LUT: [i8; 256] = [
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  1,  1,  1,  1,  1,  1,  1,  1,
    1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  2,  2,  2,  2,  2,  2,
    2,  2,  3,  3,  3,  3,  3,  4,  4,  4,  4,  4,  5,  5,  5,  6,
    6,  6,  7,  7,  8,  8,  9,  9, 10, 10, 11, 11, 12, 13, 14, 14,
   15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 26, 27, 28, 30, 31, 33,
   34, 36, 37, 39, 41, 42, 44, 46, 48, 50, 52, 54, 56, 58, 60, 62,
   64, 65, 67, 69, 71, 73, 75, 77, 79, 81, 83, 85, 86, 88, 90, 91,
   93, 94, 96, 97, 99,100,101,103,104,105,106,107,108,109,110,111,
  112,113,113,114,115,116,116,117,117,118,118,119,119,120,120,121,
  121,121,122,122,122,123,123,123,123,123,124,124,124,124,124,125,
  125,125,125,125,125,125,125,126,126,126,126,126,126,126,126,126,
  126,126,126,126,126,126,126,126,126,127,127,127,127,127,127,127,
  127,127,127,127,127,127,127,127,127,127,127,127,127,127,127,127,
  127,127,127,127,127,127,127,127,127,127,127,127,127,127,127,127,
];

// tanh_lut[i + 128] = round(tanh(i / 32.0) * 127)
static TANH_LUT: [i8; 256] = [
  -127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,
  -127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-127,-126,-126,-126,
  -126,-126,-126,-126,-126,-126,-126,-126,-126,-126,-126,-126,-126,-126,-125,-125,
  -125,-125,-125,-125,-125,-125,-125,-124,-124,-124,-124,-124,-123,-123,-123,-123,
  -122,-122,-122,-122,-121,-121,-120,-120,-120,-119,-119,-118,-118,-117,-116,-116,
  -115,-114,-113,-113,-112,-111,-110,-109,-108,-107,-105,-104,-103,-101,-100, -98,
   -97, -95, -93, -91, -89, -87, -85, -83, -81, -78, -76, -73, -70, -68, -65, -62,
   -59, -56, -52, -49, -46, -42, -38, -35, -31, -27, -24, -20, -16, -12,  -8,  -4,
     0,   4,   8,  12,  16,  20,  24,  27,  31,  35,  38,  42,  46,  49,  52,  56,
    59,  62,  65,  68,  70,  73,  76,  78,  81,  83,  85,  87,  89,  91,  93,  95,
    97,  98, 100, 101, 103, 104, 105, 107, 108, 109, 110, 111, 112, 113, 113, 114,
   115, 116, 116, 117, 118, 118, 119, 119, 120, 120, 120, 121, 121, 122, 122, 122,
   122, 123, 123, 123, 123, 124, 124, 124, 124, 124, 125, 125, 125, 125, 125, 125,
   125, 125, 125, 126, 126, 126, 126, 126, 126, 126, 126, 126, 126, 126, 126, 126,
   126, 126, 126, 126, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127,
   127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127, 127,
];

#[inline(always)]
fn lookup(table: &[i8; 256], data: &mut [i8]) {
    for v in data.iter_mut() {
        *v = table[(*v as i16 + 128) as usize];
    }
}

/// Logistic curve through [`SIGMOID_LUT`]; input is read as `x / 16`, output
/// lands in [0, 127].
pub fn sigmoid_i8(data: &mut [i8]) {
    lookup(&SIGMOID_LUT, data);
}

/// Hyperbolic tangent through [`TANH_LUT`]; input is read as `x / 32`,
/// output lands in [-127, 127].
pub fn tanh_i8(data: &mut [i8]) {
    lookup(&TANH_LUT, data);
}

/// Longest vector `softmax_i8` accepts; the exp table lives on the stack.
pub const SOFTMAX_MAX_LEN: usize = 256;

/// Approximate softmax: logits to pseudo-probabilities in [0, 127].
///
/// `exp(l - max)` is replaced by the ramp `max(0, 128 + 2(l - max))`, which
/// keeps the ordering of the logits and sums without overflow.
pub fn softmax_i8(logits: &[i8], output: &mut [i8]) -> KernelResult<()> {
    expect_len(output.len(), logits.len())?;
    let len = logits.len();
    if len > SOFTMAX_MAX_LEN {
        return Err(ExecutionError::BufferTooSmall { required: len, available: SOFTMAX_MAX_LEN });
    }
    let Some(peak) = logits.iter().copied().max() else {
        return Ok(());
    };

    let mut ramp = [0i32; SOFTMAX_MAX_LEN];
    let ramp = &mut ramp[..len];
    for (r, &l) in ramp.iter_mut().zip(logits) {
        *r = (128 + 2 * (l as i32 - peak as i32)).max(0);
    }
    // The peak itself always ramps to 128, so the total is never zero.
    let total: i32 = ramp.iter().sum();
    for (out, &r) in output.iter_mut().zip(ramp.iter()) {
        *out = (r * 127 / total) as i8;
    }
    Ok(())
}

/// Index of the maximum value; the first one wins on ties.
pub fn argmax_i8(data: &[i8]) -> Option<usize> {
    let mut best: Option<(usize, i8)> = None;
    for (i, &v) in data.iter().enumerate() {
        match best {
            Some((_, max)) if v <= max => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
