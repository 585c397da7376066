//! Cache configuration.

use std::num::NonZeroUsize;

use serde::Deserialize;

const DEFAULT_CAPACITY: usize = 50;

/// Holding-cache configuration from `riserva.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held in memory.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            capacity: settings.capacity.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.capacity, 50);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig { capacity: 0 };
        assert_eq!(config.capacity_non_zero().get(), 1);
    }
}
