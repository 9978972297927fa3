//! Space configuration
//!
//! Loaded from TOML or assembled through the facade builder.
//!
//! ```toml
//! name = "orders"
//! mvcc_enabled = false
//! all_in_cache = true
//! require_id_property = true
//! default_lease_ms = 60000
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SpaceError};

/// Settings of one space (one grid node partition)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpaceConfig {
    /// Space name, used in log fields
    pub name: String,
    /// Keep MVCC generation chains and resolve visibility through them
    pub mvcc_enabled: bool,
    /// Every entry is resident in memory; enables randomized scan rotation
    pub all_in_cache: bool,
    /// Reject writes of types without an id property value
    pub require_id_property: bool,
    /// Reject writes of routed types that carry no routing value
    pub require_routing_value: bool,
    /// Lease used when a write names none; `None` is forever
    pub default_lease_ms: Option<u64>,
    /// FIFO rescans allowed before a FIFO reject is treated as a conflict
    pub fifo_retry_limit: u32,
    /// How often the reaper retires expired non-blocking templates
    pub reaper_interval_ms: u64,
    /// Node is a local cache: updates must not move versions backwards
    pub local_cache_mode: bool,
    /// Local updates with a non-zero packet version are version-checked
    pub versioned_updates: bool,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            name: "space".to_string(),
            mvcc_enabled: false,
            all_in_cache: true,
            require_id_property: false,
            require_routing_value: false,
            default_lease_ms: None,
            fifo_retry_limit: 64,
            reaper_interval_ms: 50,
            local_cache_mode: false,
            versioned_updates: true,
        }
    }
}

impl SpaceConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: SpaceConfig = toml::from_str(text)
            .map_err(|e| SpaceError::InvalidOperation(format!("invalid space config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SpaceError::InvalidOperation(
                "space name must not be empty".to_string(),
            ));
        }
        if self.reaper_interval_ms == 0 {
            return Err(SpaceError::InvalidOperation(
                "reaper_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Default lease as a duration
    pub fn default_lease(&self) -> Option<Duration> {
        self.default_lease_ms.map(Duration::from_millis)
    }

    /// Reaper interval as a duration
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SpaceConfig::default();
        assert!(config.all_in_cache);
        assert!(!config.mvcc_enabled);
        assert_eq!(config.default_lease(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = SpaceConfig::from_toml(
            r#"
            name = "orders"
            mvcc_enabled = true
            default_lease_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "orders");
        assert!(config.mvcc_enabled);
        assert_eq!(config.default_lease(), Some(Duration::from_millis(1500)));
        assert_eq!(config.fifo_retry_limit, 64);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(SpaceConfig::from_toml("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_zero_reaper_interval_rejected() {
        assert!(SpaceConfig::from_toml("reaper_interval_ms = 0").is_err());
    }
}
