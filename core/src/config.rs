//! Build-time sizing and runtime policy.

use crate::error::{ConfigError, RuntimeResult};

/// Method allocator pool: loader tables, value slots, planned span table.
pub const METHOD_POOL_SIZE: usize = 512 * 1024;
/// Planned memory pool: every memory-planned activation buffer.
pub const PLANNED_POOL_SIZE: usize = 512 * 1024;
/// Temp pool: per-op scratch (im2col), reused across ops and inferences.
pub const TEMP_POOL_SIZE: usize = 256 * 1024;
/// Alignment of static pools and of every planned buffer.
pub const ARENA_ALIGN: usize = 16;
/// Name of the method run by the inference context.
pub const DEFAULT_ENTRY_POINT: &str = "forward";

/// What to do when a caller binds a different number of bytes than the
/// input tensor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingPolicy {
    /// Copy `min(provided, declared)` bytes and log the shortfall.
    Lenient,
    /// Reject the binding with `BindingError::SizeMismatch`.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub entry_point: &'static str,
    pub alignment: usize,
    pub binding: BindingPolicy,
    pub verify_checksum: bool,
}

impl RuntimeConfig {
    pub const fn new() -> Self {
        Self {
            entry_point: DEFAULT_ENTRY_POINT,
            alignment: ARENA_ALIGN,
            binding: BindingPolicy::Lenient,
            verify_checksum: true,
        }
    }

    pub const fn with_entry_point(mut self, entry_point: &'static str) -> Self {
        self.entry_point = entry_point;
        self
    }

    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub const fn with_binding(mut self, binding: BindingPolicy) -> Self {
        self.binding = binding;
        self
    }

    pub const fn with_checksum(mut self, verify_checksum: bool) -> Self {
        self.verify_checksum = verify_checksum;
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.entry_point.is_empty() {
            return Err(ConfigError::EmptyEntryPoint.into());
        }
        if !self.alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(self.alignment).into());
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;

    #[test]
    fn default_config_is_valid() {
        assert!(RuntimeConfig::new().validate().is_ok());
        assert_eq!(RuntimeConfig::default().entry_point, "forward");
    }

    #[test]
    fn rejects_bad_alignment_and_empty_entry_point() {
        let bad_align = RuntimeConfig::new().with_alignment(24);
        assert_eq!(
            bad_align.validate(),
            Err(RuntimeError::Configuration(ConfigError::InvalidAlignment(24)))
        );
        let no_name = RuntimeConfig::new().with_entry_point("");
        assert_eq!(
            no_name.validate(),
            Err(RuntimeError::Configuration(ConfigError::EmptyEntryPoint))
        );
    }
}
