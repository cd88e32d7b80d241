use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// WebAssembly page size; linear memory grows in these units.
pub const WASM_PAGE: u32 = 65536;

/// Configuration for a [`ReferenceHost`](crate::ReferenceHost).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// First address the host may hand out for mappings.
    pub heap_base: u32,
    /// Ceiling on linear memory, in bytes.
    pub memory_limit: u32,
    /// Linear memory size at startup, in bytes.
    pub initial_memory: u32,
    /// Granularity of the host's address-space decisions.
    pub page_size: u32,
    /// Queue async completions until released, instead of finishing them inline.
    pub deferred_completions: bool,
    /// Reported by `_emscripten_get_progname`.
    pub program_name: String,
    /// Fixed offset east of UTC for the local-time conversions.
    pub timezone_offset_secs: i32,
    /// Directory side modules are looked up in when not registered explicitly.
    pub module_search_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            heap_base: 65536,
            memory_limit: 16 * 1024 * 1024,
            initial_memory: 1024 * 1024,
            page_size: 4096,
            deferred_completions: true,
            program_name: "sandbridge".to_string(),
            timezone_offset_secs: 0,
            module_search_path: None,
        }
    }
}

impl HostConfig {
    /// Parse a configuration from TOML bytes.
    pub fn from_toml(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Toml(format!("Invalid UTF-8: {}", e)))?;
        let config: Self = toml::from_str(text).map_err(|e| Error::Toml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::InvalidInput(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.heap_base % self.page_size != 0 {
            return Err(Error::InvalidInput(
                "heap_base must be page aligned".to_string(),
            ));
        }
        if self.initial_memory > self.memory_limit || self.heap_base >= self.memory_limit {
            return Err(Error::InvalidInput(format!(
                "memory layout does not fit: heap_base={:#x} initial={:#x} limit={:#x}",
                self.heap_base, self.initial_memory, self.memory_limit
            )));
        }
        if self.timezone_offset_secs.abs() >= 86400 {
            return Err(Error::InvalidInput(
                "timezone_offset_secs must be less than a day".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let config = HostConfig::from_toml(b"").unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn overrides_apply() {
        let config = HostConfig::from_toml(
            br#"
            deferred_completions = false
            program_name = "demo"
            timezone_offset_secs = 3600
            "#,
        )
        .unwrap();
        assert!(!config.deferred_completions);
        assert_eq!(config.program_name, "demo");
        assert_eq!(config.heap_base, 65536);
    }

    #[test]
    fn heap_beyond_limit_is_rejected() {
        let result = HostConfig::from_toml(b"heap_base = 65536\nmemory_limit = 4096");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
