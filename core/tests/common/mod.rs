//! Shared fixtures: a handwritten "7", a drawn "1" and a template model
//! that tells them apart.

#![allow(dead_code)]

use nano_exec_core::math::max_pool_2d;
use nano_exec_core::*;

/// 28x28 grayscale digit, pixels stored as two's-complement i8.
pub static DIGIT_SEVEN: [i8; 784] = [
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,84,-71,-97,-105,60,36,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,-34,-2,-2,-2,-2,-15,-58,-58,-58,-58,-58,-58,-58,-58,-86,52,0,0,0,0,0,0,
    0,0,0,0,0,0,67,114,72,114,-93,-29,-2,-31,-2,-2,-2,-6,-27,-2,-2,-116,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,17,66,14,67,67,67,59,21,-20,-2,106,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,83,-3,-47,18,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,22,-23,-1,83,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,-127,-2,-18,44,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,59,-7,-2,62,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,-123,-2,-69,5,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,9,-51,-8,58,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,126,-2,-74,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,75,-5,-16,57,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,19,-35,-2,-90,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,3,-53,-2,-37,35,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,38,-2,-2,77,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,31,-32,-2,115,1,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,-123,-2,-2,52,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,61,-14,-2,-2,52,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,121,-2,-2,-37,40,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,121,-2,-49,18,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0
];

pub type TestPools = StaticPools<4096, 4096, 1024>;

/// A "1": one vertical stroke two pixels wide, rows 4..24.
pub fn digit_one() -> [i8; 784] {
    let mut img = [0i8; 784];
    for row in 4..24 {
        img[row * 28 + 13] = 100;
        img[row * 28 + 14] = 100;
    }
    img
}

/// 2x2 max-pool of a 28x28 digit (14x14).
pub fn pooled(digit: &[i8; 784]) -> [i8; 196] {
    let mut out = [0i8; 196];
    max_pool_2d(digit, &mut out, 1, 28, 28, 2, 2, 2).unwrap();
    out
}

/// Conv 1x1 (identity) -> MaxPool 2x2 -> Flatten -> Dense(196 -> 10).
///
/// A template matcher, not a trained network: row 7 of the dense layer is
/// the sign of the pooled `DIGIT_SEVEN` and row 1 the sign of the pooled
/// `digit_one()`, every other row is zero. The "7" is recognised because its
/// own template was built from it; `digit_one()` is what keeps the
/// classification from being a foregone conclusion.
///
/// Scores: the "7" gives 126 on class 7 and 36 on class 1; the "1" gives 125
/// on class 1 and 31 on class 7.
pub fn mnist_program() -> Vec<u8> {
    let mut weights = vec![0i8; 10 * 196];
    for (class, digit) in [(7, DIGIT_SEVEN), (1, digit_one())] {
        for (w, p) in weights[class * 196..(class + 1) * 196].iter_mut().zip(pooled(&digit)) {
            *w = p.signum();
        }
    }
    SequentialBuilder::new(Shape::d4(1, 1, 28, 28))
        .conv2d(&[1], &[0], 1, 1, 1, 0, 1, 0)
        .max_pool(2, 2, 2)
        .flatten()
        .dense(&weights, &[0; 10], 1, 4)
        .build()
        .unwrap()
}

/// Single delegate op over a 4-element input.
pub fn delegate_program() -> Vec<u8> {
    SequentialBuilder::new(Shape::d1(4)).delegate(b"neg", 4).build().unwrap()
}

/// Negates its input when handed the `neg` payload.
#[derive(Default)]
pub struct NegatingNpu {
    pub invocations: u32,
}

impl Accelerator for NegatingNpu {
    fn initialize(&mut self) -> Result<(), DriverFault> {
        Ok(())
    }

    fn invoke(&mut self, payload: &[u8], input: &[i8], output: &mut [i8]) -> Result<(), DriverFault> {
        self.invocations += 1;
        if payload != b"neg" {
            return Err(DriverFault(-22));
        }
        for (o, &i) in output.iter_mut().zip(input) {
            *o = i.saturating_neg();
        }
        Ok(())
    }
}

/// Fails every call with the same driver code.
pub struct BrokenNpu(pub i32);

impl Accelerator for BrokenNpu {
    fn initialize(&mut self) -> Result<(), DriverFault> {
        Err(DriverFault(self.0))
    }

    fn invoke(&mut self, _payload: &[u8], _input: &[i8], _output: &mut [i8]) -> Result<(), DriverFault> {
        Err(DriverFault(self.0))
    }
}

/// Records every colour change and the total time spent waiting.
#[derive(Default)]
pub struct LedLog {
    pub colors: Vec<Color>,
    pub waited_ms: u32,
}

impl StatusIndicator for LedLog {
    fn set(&mut self, color: Color) {
        self.colors.push(color);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.waited_ms += ms;
    }
}
