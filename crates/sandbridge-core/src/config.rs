use crate::handle::MAX_SLOTS;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tunables for a [`Bridge`](crate::Bridge).
///
/// Every field is optional in TOML; missing fields take their defaults.
///
/// ```toml
/// page_size = 4096
/// max_handles = 256
/// allow_exec = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Granularity for offset alignment and host allocation.
    pub page_size: u32,
    /// Capacity of the handle table.
    pub max_handles: u32,
    /// Whether `PROT_EXEC` mappings are accepted.
    pub allow_exec: bool,
    /// Largest single mapping the bridge will ask the host for.
    pub max_mapping_len: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_handles: 1024,
            allow_exec: false,
            max_mapping_len: 256 * 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration from TOML bytes.
    pub fn from_toml(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Config(format!("Invalid UTF-8: {}", e)))?;
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.max_handles == 0 || self.max_handles > MAX_SLOTS {
            return Err(Error::Config(format!(
                "max_handles must be in 1..={}, got {}",
                MAX_SLOTS, self.max_handles
            )));
        }
        if self.max_mapping_len < self.page_size {
            return Err(Error::Config(
                "max_mapping_len must hold at least one page".to_string(),
            ));
        }
        Ok(())
    }
}
