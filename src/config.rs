//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::gatt::GattError;

/// Smallest ATT MTU allowed on LE.
pub const MIN_MTU: usize = 23;

/// Largest ATT MTU a peer may request.
pub const MAX_MTU: usize = 517;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// MTU of a fresh connection.
    pub default_mtu: usize,
    /// Upper bound applied to MTU requests.
    pub max_mtu: usize,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
    /// Recent events replayed to a subscriber that joins late.
    pub event_replay: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_mtu: MIN_MTU,
            max_mtu: MAX_MTU,
            event_capacity: 64,
            event_replay: 10,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, GattError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| GattError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GattError> {
        if self.default_mtu < MIN_MTU {
            return Err(GattError::Config(format!(
                "default_mtu {} below minimum {}",
                self.default_mtu, MIN_MTU
            )));
        }
        if self.max_mtu < self.default_mtu {
            return Err(GattError::Config(format!(
                "max_mtu {} below default_mtu {}",
                self.max_mtu, self.default_mtu
            )));
        }
        if self.event_capacity == 0 {
            return Err(GattError::Config("event_capacity must be positive".into()));
        }
        if self.event_replay > self.event_capacity {
            return Err(GattError::Config(format!(
                "event_replay {} exceeds event_capacity {}",
                self.event_replay, self.event_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_mtu, 23);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = EngineConfig::from_json(r#"{ "max_mtu": 247 }"#).unwrap();
        assert_eq!(config.max_mtu, 247);
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{ "default_mtu": 10 }"#),
            Err(GattError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{ "event_capacity": 4, "event_replay": 8 }"#),
            Err(GattError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_json("not json"),
            Err(GattError::Config(_))
        ));
    }
}
