//! Session configuration
//!
//! All values are supplied by the embedding application; this crate never
//! reads configuration files or environment variables itself.
//!
//! ```rust
//! use uplink_session::config::UplinkSessionConfig;
//! use uplink_session::message::MessagePriority;
//!
//! let config = UplinkSessionConfig::default()
//!     .with_capacity(MessagePriority::Low, 8)
//!     .with_goodbye_confirmation_timeout_ms(2_000)
//!     .with_verbose_logging();
//! assert!(config.validate().is_ok());
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::message::MessagePriority;

/// Default time to wait for the remote side's handshake response
pub const DEFAULT_HANDSHAKE_RESPONSE_TIMEOUT_MS: u64 = 10_000;

/// Default time to wait for the remote side to confirm our goodbye
pub const DEFAULT_GOODBYE_CONFIRMATION_TIMEOUT_MS: u64 = 10_000;

/// Default time after which a missing heartbeat response is fatal
pub const DEFAULT_HEARTBEAT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

/// Default interval of the heartbeat watchdog
pub const DEFAULT_HEARTBEAT_CHECK_INTERVAL_MS: u64 = 5_000;

/// Configuration of one uplink session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkSessionConfig {
    /// Maximum number of queued outbound blocks per priority level
    pub outbox_capacities: BTreeMap<MessagePriority, usize>,

    /// Handshake response timeout (msec); also the threshold for logging slow heartbeat round trips
    pub handshake_response_timeout_ms: u64,

    /// How long to wait for the remote goodbye after sending ours (msec)
    pub goodbye_confirmation_timeout_ms: u64,

    /// How long a heartbeat may stay unanswered (msec)
    pub heartbeat_response_timeout_ms: u64,

    /// Tick interval of the heartbeat watchdog (msec)
    pub heartbeat_check_interval_ms: u64,

    /// Log every outbound and inbound message block
    pub verbose_logging: bool,
}

impl Default for UplinkSessionConfig {
    fn default() -> Self {
        let mut outbox_capacities = BTreeMap::new();
        outbox_capacities.insert(MessagePriority::Low, 10);
        outbox_capacities.insert(MessagePriority::Normal, 50);
        outbox_capacities.insert(MessagePriority::High, 100);
        outbox_capacities.insert(MessagePriority::Critical, 100);
        Self {
            outbox_capacities,
            handshake_response_timeout_ms: DEFAULT_HANDSHAKE_RESPONSE_TIMEOUT_MS,
            goodbye_confirmation_timeout_ms: DEFAULT_GOODBYE_CONFIRMATION_TIMEOUT_MS,
            heartbeat_response_timeout_ms: DEFAULT_HEARTBEAT_RESPONSE_TIMEOUT_MS,
            heartbeat_check_interval_ms: DEFAULT_HEARTBEAT_CHECK_INTERVAL_MS,
            verbose_logging: false,
        }
    }
}

impl UplinkSessionConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the capacity of one priority level
    pub fn with_capacity(mut self, priority: MessagePriority, capacity: usize) -> Self {
        self.outbox_capacities.insert(priority, capacity);
        self
    }

    /// Replace all outbox capacities
    pub fn with_capacities(mut self, capacities: BTreeMap<MessagePriority, usize>) -> Self {
        self.outbox_capacities = capacities;
        self
    }

    /// Set the handshake response timeout
    pub fn with_handshake_response_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.handshake_response_timeout_ms = timeout_ms;
        self
    }

    /// Set the goodbye confirmation timeout
    pub fn with_goodbye_confirmation_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.goodbye_confirmation_timeout_ms = timeout_ms;
        self
    }

    /// Set the heartbeat response timeout
    pub fn with_heartbeat_response_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.heartbeat_response_timeout_ms = timeout_ms;
        self
    }

    /// Set the heartbeat watchdog interval
    pub fn with_heartbeat_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_check_interval_ms = interval_ms;
        self
    }

    /// Enable per-message logging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    pub fn handshake_response_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_response_timeout_ms)
    }

    pub fn goodbye_confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.goodbye_confirmation_timeout_ms)
    }

    pub fn heartbeat_response_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_response_timeout_ms)
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_interval_ms)
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        for priority in MessagePriority::ALL {
            match self.outbox_capacities.get(&priority) {
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "missing outbox capacity for priority {}",
                        priority
                    )))
                }
                Some(0) => {
                    return Err(ConfigError::Invalid(format!(
                        "outbox capacity for priority {} must be greater than zero",
                        priority
                    )))
                }
                Some(_) => {}
            }
        }
        if self.goodbye_confirmation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "goodbye confirmation timeout must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat check interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = UplinkSessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.goodbye_confirmation_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_capacity_is_rejected() {
        let mut capacities = BTreeMap::new();
        capacities.insert(MessagePriority::Low, 1);
        let config = UplinkSessionConfig::default().with_capacities(capacities);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let config = UplinkSessionConfig::default().with_capacity(MessagePriority::High, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_with_partial_fields() {
        let config = UplinkSessionConfig::from_json_str(
            r#"{ "goodbye_confirmation_timeout_ms": 500, "verbose_logging": true }"#,
        )
        .unwrap();
        assert_eq!(config.goodbye_confirmation_timeout_ms, 500);
        assert!(config.verbose_logging);
        assert_eq!(config.outbox_capacities.len(), MessagePriority::COUNT);
    }

    #[test]
    fn test_json_capacities_by_name() {
        let config = UplinkSessionConfig::from_json_str(
            r#"{ "outbox_capacities": { "low": 1, "normal": 2, "high": 3, "critical": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.outbox_capacities[&MessagePriority::High], 3);
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        assert!(matches!(
            UplinkSessionConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
