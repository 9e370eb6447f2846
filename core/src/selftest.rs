//! On-device self-test: run one known sample repeatedly and count how often
//! the prediction matches.

use core::fmt::Write;

use log::{info, warn};

use crate::context::InferenceContext;
use crate::math::argmax_i8;
use crate::platform::{Color, StatusIndicator};

/// Largest score vector printed and compared.
pub const MAX_SCORES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestReport {
    pub passed: u32,
    pub total: u32,
    /// Prediction of the last successful round.
    pub last_prediction: Option<usize>,
}

impl SelfTestReport {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// Run `sample` through `ctx` `rounds` times, expecting class `expected`.
/// Scores and verdicts go to `console`; a failed run counts as a miss and the
/// loop continues.
pub fn evaluate(
    ctx: &mut InferenceContext<'_>,
    sample: &[i8],
    expected: usize,
    rounds: u32,
    console: &mut dyn Write,
    mut indicator: Option<&mut dyn StatusIndicator>,
) -> SelfTestReport {
    let mut report = SelfTestReport { passed: 0, total: rounds, last_prediction: None };
    let _ = writeln!(console, "[TEST] Running {} tests...\r", rounds);

    for round in 0..rounds {
        if let Some(led) = indicator.as_deref_mut() {
            led.set(Color::BLUE);
        }
        let _ = writeln!(console, "--- Test {}/{} ---\r", round + 1, rounds);

        let mut scores = [0i8; MAX_SCORES];
        let written = match ctx.run_checked(bytemuck::cast_slice(sample), bytemuck::cast_slice_mut(&mut scores), None) {
            Ok(n) => n,
            Err(e) => {
                warn!("self-test round {} failed: {}", round + 1, e);
                let _ = writeln!(console, "[ERROR] Inference failed: {}\r", e);
                if let Some(led) = indicator.as_deref_mut() {
                    led.set(Color::RED);
                    led.delay_ms(500);
                }
                // A faulted method stays faulted until reset.
                let _ = ctx.recover();
                continue;
            }
        };
        let scores = &scores[..written];

        let _ = write!(console, "[INF] Scores: ");
        for (i, s) in scores.iter().enumerate() {
            let _ = write!(console, "{}:{} ", i, s);
        }
        let _ = writeln!(console, "\r");

        let predicted = argmax_i8(scores);
        report.last_prediction = predicted.or(report.last_prediction);
        let pass = predicted == Some(expected);
        if pass {
            report.passed += 1;
        }
        let _ = writeln!(
            console,
            "[RES] Pred:{} Exp:{} -> {}\r\n\r",
            predicted.map_or(-1, |p| p as i64),
            expected,
            if pass { "PASS" } else { "FAIL" }
        );
        if let Some(led) = indicator.as_deref_mut() {
            led.set(if pass { Color::CYAN } else { Color::RED });
            led.delay_ms(300);
            led.set(Color::OFF);
            led.delay_ms(200);
        }
    }

    let _ = writeln!(console, "  RESULTS: {}/{} passed\r", report.passed, report.total);
    let _ = writeln!(console, "[SYS] {}\r", if report.all_passed() { "All PASSED" } else { "Some FAILED" });
    if let Some(led) = indicator {
        led.set(if report.all_passed() { Color::CYAN } else { Color::RED });
    }
    info!("self-test: {}/{} passed", report.passed, report.total);
    report
}
