//! Service Configuration
//!
//! Typed tunables for one cache instance. The defaults match what memcached
//! clients expect out of the box.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default read-ahead reservation for connection input buffers (16 KB).
pub const DEFAULT_READAHEAD: usize = 16 * 1024;

/// Default maximum number of pipelined requests handled per flush.
pub const DEFAULT_BATCH_COUNT: usize = 20;

/// Default number of records visited per expiration batch.
pub const DEFAULT_EXPIRE_BATCH_SIZE: u32 = 50;

/// Default time budget, in seconds, for one full expiration sweep.
pub const DEFAULT_EXPIRE_TIME_BUDGET: u32 = 3600;

/// Highest verbosity level.
pub const MAX_VERBOSITY: u8 = 3;

/// Which wire protocol connections speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    /// Pick per connection from the first byte received
    #[default]
    Negotiate,
    /// memcached text protocol only
    Text,
    /// memcached binary protocol only
    Binary,
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolMode::Negotiate => "negotiate",
            ProtocolMode::Text => "text",
            ProtocolMode::Binary => "binary",
        })
    }
}

/// Error returned when parsing a [`ProtocolMode`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown protocol '{0}' (expected text, binary or negotiate)")]
pub struct UnknownProtocol(pub String);

impl FromStr for ProtocolMode {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "negotiate" | "auto" => Ok(ProtocolMode::Negotiate),
            "text" | "ascii" => Ok(ProtocolMode::Text),
            "binary" => Ok(ProtocolMode::Binary),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

/// Expiration engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireConfig {
    /// Whether the expiration task should run
    pub enabled: bool,
    /// Records visited per transaction
    pub batch_size: u32,
    /// Target duration of a full sweep, in seconds
    pub time_budget: u32,
}

impl Default for ExpireConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: DEFAULT_EXPIRE_BATCH_SIZE,
            time_budget: DEFAULT_EXPIRE_TIME_BUDGET,
        }
    }
}

/// All tunables of a service.
///
/// The struct is `Copy`; readers take a snapshot with
/// [`Service::config`](crate::service::Service::config) and never hold the
/// lock while working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Bytes reserved in a connection's input buffer after each flush
    pub readahead: usize,
    /// Max pipelined requests handled between two flushes
    pub batch_count: usize,
    /// Expiration engine settings
    pub expire: ExpireConfig,
    /// Whether `flush_all` is allowed
    pub flush_enabled: bool,
    /// Logging verbosity, 0..=3
    pub verbosity: u8,
    /// Wire protocol selection
    pub protocol: ProtocolMode,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            readahead: DEFAULT_READAHEAD,
            batch_count: DEFAULT_BATCH_COUNT,
            expire: ExpireConfig::default(),
            flush_enabled: true,
            verbosity: 0,
            protocol: ProtocolMode::Negotiate,
        }
    }
}

/// Normalizes a requested verbosity level: values above [`MAX_VERBOSITY`] are
/// clamped to it.
pub fn clamp_verbosity(level: u32) -> u8 {
    level.min(u32::from(MAX_VERBOSITY)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.readahead, 16384);
        assert_eq!(config.batch_count, 20);
        assert!(config.expire.enabled);
        assert_eq!(config.expire.batch_size, 50);
        assert_eq!(config.expire.time_budget, 3600);
        assert!(config.flush_enabled);
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.protocol, ProtocolMode::Negotiate);
    }

    #[test]
    fn test_clamp_verbosity() {
        assert_eq!(clamp_verbosity(0), 0);
        assert_eq!(clamp_verbosity(2), 2);
        assert_eq!(clamp_verbosity(3), 3);
        assert_eq!(clamp_verbosity(4), 3);
        assert_eq!(clamp_verbosity(u32::MAX), 3);
    }

    #[test]
    fn test_protocol_mode_from_str() {
        assert_eq!("text".parse(), Ok(ProtocolMode::Text));
        assert_eq!("BINARY".parse(), Ok(ProtocolMode::Binary));
        assert_eq!("negotiate".parse(), Ok(ProtocolMode::Negotiate));
        assert_eq!(
            "resp".parse::<ProtocolMode>(),
            Err(UnknownProtocol("resp".to_string()))
        );
    }
}
