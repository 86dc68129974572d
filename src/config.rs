//! Runtime construction parameters.
//!
//! Mirrors the five knobs `ef_init` took as plain arguments (`stack_size`,
//! `limit_min`, `limit_max`, `shrink_millisecs`, `count_per_shrink`) plus the
//! poll event-buffer capacity `main.c` hardcoded to 1024, collected into one
//! struct with a builder so callers don't have to remember argument order.

/// Parameters for [`crate::runtime::Runtime::new`].
///
/// `Default` reproduces the values the original demo (`main.c`) used.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub(crate) stack_size: usize,
    pub(crate) limit_min: usize,
    pub(crate) limit_max: usize,
    pub(crate) shrink_millisecs: u64,
    pub(crate) count_per_shrink: i32,
    pub(crate) poll_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_size: 64 * 1024,
            limit_min: 256,
            limit_max: 512,
            shrink_millisecs: 60_000,
            count_per_shrink: 16,
            poll_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder { config: RuntimeConfig::default() }
    }
}

/// Builds a [`RuntimeConfig`] one field at a time, falling back to
/// [`RuntimeConfig::default`] for anything left unset.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    pub fn limit_min(mut self, count: usize) -> Self {
        self.config.limit_min = count;
        self
    }

    pub fn limit_max(mut self, count: usize) -> Self {
        self.config.limit_max = count;
        self
    }

    pub fn shrink_millisecs(mut self, millisecs: u64) -> Self {
        self.config.shrink_millisecs = millisecs;
        self
    }

    pub fn count_per_shrink(mut self, count: i32) -> Self {
        self.config.count_per_shrink = count;
        self
    }

    pub fn poll_capacity(mut self, capacity: usize) -> Self {
        self.config.poll_capacity = capacity;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_original_demo_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stack_size, 64 * 1024);
        assert_eq!(config.limit_min, 256);
        assert_eq!(config.limit_max, 512);
        assert_eq!(config.shrink_millisecs, 60_000);
        assert_eq!(config.count_per_shrink, 16);
        assert_eq!(config.poll_capacity, 1024);
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let config = RuntimeConfig::builder().stack_size(128 * 1024).limit_max(32).build();
        assert_eq!(config.stack_size, 128 * 1024);
        assert_eq!(config.limit_max, 32);
        assert_eq!(config.limit_min, 256);
    }
}
