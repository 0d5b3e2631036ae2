//! Session-wide configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The default modulus of the sharing field (2^62).
pub const DEFAULT_FIELD_SIZE: u64 = 1 << 62;
/// The default base of the fixed-point encoding.
pub const DEFAULT_BASE: u32 = 10;
/// The default number of fractional digits of the fixed-point encoding.
pub const DEFAULT_PRECISION_FRACTIONAL: u32 = 3;

const MIN_FIELD_SIZE: u64 = 1 << 8;
const MAX_FIELD_SIZE: u64 = 1 << 63;

/// Parameters shared by every tensor created in a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Modulus of the additive sharing, values above `field_size / 2` decode as negative.
    pub field_size: u64,
    /// Base of the fixed-point encoding.
    pub base: u32,
    /// Number of fractional digits, the scale is `base^precision_fractional`.
    pub precision_fractional: u32,
    /// Seed of the session's default crypto provider, OS entropy is used if absent.
    pub provider_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            field_size: DEFAULT_FIELD_SIZE,
            base: DEFAULT_BASE,
            precision_fractional: DEFAULT_PRECISION_FRACTIONAL,
            provider_seed: None,
        }
    }
}

impl Config {
    /// Sets the field size.
    pub fn with_field_size(mut self, field_size: u64) -> Self {
        self.field_size = field_size;
        self
    }

    /// Sets the fixed-point encoding.
    pub fn with_precision(mut self, base: u32, precision_fractional: u32) -> Self {
        self.base = base;
        self.precision_fractional = precision_fractional;
        self
    }

    /// Makes the default crypto provider deterministic.
    pub fn with_provider_seed(mut self, seed: u64) -> Self {
        self.provider_seed = Some(seed);
        self
    }

    /// Checks that the parameters describe a usable field and encoding.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FIELD_SIZE..=MAX_FIELD_SIZE).contains(&self.field_size) {
            return Err(Error::InvalidArgument(format!(
                "field size {} must be between 2^8 and 2^63",
                self.field_size
            )));
        }
        if self.base < 2 {
            return Err(Error::InvalidArgument(format!(
                "fixed-point base {} must be at least 2",
                self.base
            )));
        }
        let scale = (self.base as u64).checked_pow(self.precision_fractional);
        match scale {
            Some(scale) if scale < self.field_size / 4 => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "scale {}^{} does not fit into the field",
                self.base, self.precision_fractional
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_fields_and_bases() {
        assert!(Config::default().with_field_size(7).validate().is_err());
        assert!(Config::default().with_precision(1, 3).validate().is_err());
        assert!(Config::default().with_precision(10, 30).validate().is_err());
    }

    #[test]
    fn config_survives_serialization() {
        let config: Config = bincode::deserialize(&bincode::serialize(&Config::default()).unwrap())
            .unwrap();
        assert_eq!(config, Config::default());
    }
}
