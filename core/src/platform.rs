//! Narrow contracts for the hardware collaborators the pipeline drives.
//!
//! The core calls each of these at most once per bring-up stage and treats
//! the result as pass/fail. Drivers report failures as an opaque
//! [`DriverFault`] code; nothing here retries or reconfigures them.

use bitflags::bitflags;

/// Vendor driver status code of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverFault(pub i32);

/// Pin mux and clock configuration.
pub trait Board {
    fn configure_pins(&mut self) -> Result<(), DriverFault>;
}

/// Power switch for the SRAM region that backs the arenas.
pub trait PowerDomain {
    fn enable_arena_memory(&mut self) -> Result<(), DriverFault>;
}

/// Neural accelerator able to run delegated subgraphs.
pub trait Accelerator {
    fn initialize(&mut self) -> Result<(), DriverFault>;

    /// Run one compiled subgraph. `payload` is the blob stored in the program.
    fn invoke(&mut self, payload: &[u8], input: &[i8], output: &mut [i8]) -> Result<(), DriverFault>;
}

bitflags! {
    /// RGB status LED channels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Color: u8 {
        const RED   = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE  = 1 << 2;

        const YELLOW = Self::RED.bits() | Self::GREEN.bits();
        const CYAN   = Self::GREEN.bits() | Self::BLUE.bits();
        const WHITE  = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits();
    }
}

impl Color {
    pub const OFF: Self = Self::empty();
}

/// Visible stage signalling. Infallible: a broken LED must never change
/// what the pipeline does.
pub trait StatusIndicator {
    fn set(&mut self, color: Color);
    fn delay_ms(&mut self, ms: u32);

    /// `count` on/off pulses of `color`.
    fn blink(&mut self, color: Color, count: u32, period_ms: u32) {
        for _ in 0..count {
            self.set(color);
            self.delay_ms(period_ms / 2);
            self.set(Color::OFF);
            self.delay_ms(period_ms / 2);
        }
    }
}

/// Board without a switchable power domain.
pub struct AlwaysOn;

impl PowerDomain for AlwaysOn {
    fn enable_arena_memory(&mut self) -> Result<(), DriverFault> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        log: [Color; 8],
        len: usize,
        waited: u32,
    }

    impl StatusIndicator for Recorder {
        fn set(&mut self, color: Color) {
            self.log[self.len] = color;
            self.len += 1;
        }
        fn delay_ms(&mut self, ms: u32) {
            self.waited += ms;
        }
    }

    #[test]
    fn mixed_colours_combine_channels() {
        assert!(Color::YELLOW.contains(Color::RED | Color::GREEN));
        assert!(!Color::CYAN.contains(Color::RED));
        assert_eq!(Color::WHITE.bits(), 0b111);
        assert!(Color::OFF.is_empty());
    }

    #[test]
    fn blink_alternates_on_and_off() {
        let mut led = Recorder { log: [Color::OFF; 8], len: 0, waited: 0 };
        led.blink(Color::GREEN, 2, 100);
        assert_eq!(&led.log[..4], &[Color::GREEN, Color::OFF, Color::GREEN, Color::OFF]);
        assert_eq!(led.waited, 200);
    }
}
