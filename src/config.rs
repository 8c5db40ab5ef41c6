//! Engine configuration
//!
//! All timeouts are in milliseconds. Values missing from a JSON document
//! fall back to [`EngineConfig::default`].

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lowest link protocol version that uses 4-byte circuit ids
pub const MIN_SECURE_LINK_VERSION: u16 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Versions offered in our VERSIONS cell
    pub link_versions: Vec<u16>,
    /// Refuse to negotiate anything lower than this
    pub min_link_version: u16,
    pub connect_timeout_ms: u64,
    /// Link handshake, and each CREATE2 / EXTEND2 / TRUNCATE round trip
    pub handshake_timeout_ms: u64,
    /// Depth of each circuit's inbound mailbox
    pub mailbox_capacity: usize,
    pub default_circuit_length: usize,
    pub standby_circuits: usize,
    pub keepalive_interval_ms: u64,
    /// Bounded retry for directory-facing lookups
    pub directory_retries: u32,
    /// RELAY_EARLY cells a circuit may send
    pub max_relay_early: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            link_versions: vec![4, 5],
            min_link_version: MIN_SECURE_LINK_VERSION,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 30_000,
            mailbox_capacity: 64,
            default_circuit_length: 3,
            standby_circuits: 2,
            keepalive_interval_ms: 60_000,
            directory_retries: 3,
            max_relay_early: 8,
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON configuration and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| TorError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.link_versions.is_empty() {
            return Err(TorError::Config("no link versions offered".into()));
        }
        if self.min_link_version < MIN_SECURE_LINK_VERSION {
            return Err(TorError::Config(format!(
                "min_link_version {} is below {}",
                self.min_link_version, MIN_SECURE_LINK_VERSION
            )));
        }
        if !self
            .link_versions
            .iter()
            .any(|v| *v >= self.min_link_version)
        {
            return Err(TorError::Config(
                "every offered link version is below the minimum".into(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(TorError::Config("mailbox_capacity must be non-zero".into()));
        }
        if self.default_circuit_length == 0 {
            return Err(TorError::Config(
                "default_circuit_length must be non-zero".into(),
            ));
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
        ] {
            if value == 0 {
                return Err(TorError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.link_versions, vec![4, 5]);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"mailbox_capacity": 8}"#).unwrap();
        assert_eq!(config.mailbox_capacity, 8);
        assert_eq!(config.default_circuit_length, 3);
    }

    #[test]
    fn test_rejects_downgrade_floor() {
        let err = EngineConfig::from_json(r#"{"min_link_version": 3}"#).unwrap_err();
        assert!(matches!(err, TorError::Config(_)));

        let err = EngineConfig::from_json(r#"{"link_versions": [3]}"#).unwrap_err();
        assert!(matches!(err, TorError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_mailbox() {
        assert!(EngineConfig::from_json(r#"{"mailbox_capacity": 0}"#).is_err());
    }

    #[test]
    fn test_rejects_zero_durations() {
        for field in ["connect_timeout_ms", "handshake_timeout_ms", "keepalive_interval_ms"] {
            let json = format!(r#"{{"{}": 0}}"#, field);
            match EngineConfig::from_json(&json) {
                Err(TorError::Config(msg)) => assert!(msg.contains(field)),
                other => panic!("{} = 0 accepted: {:?}", field, other.map(|_| ())),
            }
        }
        let config = EngineConfig {
            keepalive_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
