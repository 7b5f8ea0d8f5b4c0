use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding [`DistConfig::granule_bytes`].
pub const ENV_GRANULE_BYTES: &str = "BURN_DISTARRAY_GRANULE_BYTES";
/// Environment variable overriding [`DistConfig::max_devices`].
pub const ENV_MAX_DEVICES: &str = "BURN_DISTARRAY_MAX_DEVICES";

/// Default granule: the virtual-memory allocation granularity of the device driver.
pub const DEFAULT_GRANULE_BYTES: usize = 2 << 20;

/// Process-level settings shared by every storage and launcher built from one
/// [`DeviceRegistry`](crate::runtime::DeviceRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistConfig {
    /// Size in bytes of one granule, the unit of device allocation and bulk copy.
    pub granule_bytes: usize,
    /// Upper bound on the number of devices used, `None` for all installed devices.
    pub max_devices: Option<usize>,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            granule_bytes: DEFAULT_GRANULE_BYTES,
            max_devices: None,
        }
    }
}

impl DistConfig {
    /// Sets the granule size.
    pub fn with_granule_bytes(mut self, granule_bytes: usize) -> Self {
        self.granule_bytes = granule_bytes;
        self
    }

    /// Caps the number of devices.
    pub fn with_max_devices(mut self, max_devices: usize) -> Self {
        self.max_devices = Some(max_devices);
        self
    }

    /// Builds the default configuration and applies the `BURN_DISTARRAY_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_GRANULE_BYTES) {
            config.granule_bytes = parse_usize(ENV_GRANULE_BYTES, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_DEVICES) {
            config.max_devices = match parse_usize(ENV_MAX_DEVICES, &value)? {
                0 => None,
                max => Some(max),
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the granule is a non-zero power of two.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.granule_bytes.is_power_of_two() {
            return Err(ConfigError::InvalidGranule(self.granule_bytes));
        }
        Ok(())
    }
}

fn parse_usize(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}
