//! Channel configuration.
//!
//! Every field has a default, so a config can be built from a partial JSON
//! object.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::channel::ChannelConfig;
//!
//! let config = ChannelConfig::from_json(r#"{ "sync_timeout_ms": 250 }"#).unwrap();
//! assert_eq!(config.max_message_size, 64 * 1024 * 1024);
//! assert_eq!(config.sync_timeout().unwrap().as_millis(), 250);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IpcError, Result};
use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, INLINE_BODY_THRESHOLD, MAX_ATTACHMENTS};

/// Limits and timeouts for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest body accepted in either direction.
    pub max_message_size: u32,
    /// Bodies above this size travel out of line where the backend can.
    pub inline_threshold: usize,
    /// Most attachments one message may carry, including an out-of-line body.
    pub max_attachments: u32,
    /// How long a sync call waits for its reply. `None` waits forever.
    pub sync_timeout_ms: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inline_threshold: INLINE_BODY_THRESHOLD,
            max_attachments: MAX_ATTACHMENTS,
            sync_timeout_ms: None,
        }
    }
}

impl ChannelConfig {
    /// Parse a config from JSON, filling unset fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the limits are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.max_attachments == 0 {
            return Err(IpcError::Protocol(
                "max_attachments must leave room for an out-of-line body".into(),
            ));
        }
        if self.inline_threshold > self.max_message_size as usize {
            return Err(IpcError::Protocol(format!(
                "inline_threshold {} exceeds max_message_size {}",
                self.inline_threshold, self.max_message_size
            )));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.inline_threshold, 4096);
        assert_eq!(config.max_attachments, 64);
        assert!(config.sync_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = ChannelConfig::from_json(r#"{ "inline_threshold": 128 }"#).unwrap();
        assert_eq!(config.inline_threshold, 128);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            ChannelConfig::from_json("{ not json"),
            Err(IpcError::Json(_))
        ));
        assert!(ChannelConfig::from_json(r#"{ "max_attachments": 0 }"#).is_err());
        assert!(
            ChannelConfig::from_json(r#"{ "max_message_size": 10, "inline_threshold": 100 }"#)
                .is_err()
        );
    }
}
