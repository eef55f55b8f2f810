// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::Creation;

/// Maximum number of flow messages aggregated between two storage inserts
pub const FLOW_BULK_INSERT_DEFAULT: usize = 100;

/// Deadline of each bulk insert, in seconds
pub const FLOW_BULK_INSERT_DEADLINE_DEFAULT: u64 = 5;

/// Delay between two bulks when the storage backend asks for `bulk_maxdelay = 0`
pub const FLOW_BULK_MAX_DELAY_DEFAULT: u64 = 5;

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100_000;
pub const DEFAULT_FLOW_PORT: u16 = 8082;
pub const DEFAULT_FLOW_HOST: &str = "0.0.0.0";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Transport used by agents to push flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// One flow message per UDP datagram
    Udp,
    /// Flow messages framed over websocket connections
    WebSocket,
}

impl FromStr for Protocol {
    type Err = Creation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "udp" | "datagram" => Ok(Protocol::Udp),
            "websocket" | "persistent-connection" => Ok(Protocol::WebSocket),
            other => Err(Creation::InvalidProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Settings of the storage backend the flows are written to.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Name of the active backend (e.g. "memory")
    pub backend: String,
    /// Driver declared by the backend. `bulk_maxdelay` only applies when one is set.
    pub driver: Option<String>,
    /// Maximum delay between two bulk inserts, in seconds. 0 selects the default.
    pub bulk_maxdelay: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            driver: None,
            bulk_maxdelay: 0,
        }
    }
}

/// Thresholds driving the batcher flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkSettings {
    /// Number of buffered flow messages that triggers a flush
    pub bulk_insert: usize,
    /// Maximum time a flow message stays buffered
    pub deadline: Duration,
}

/// Configuration of the flow server
#[derive(Debug, Clone)]
pub struct FlowServerConfig {
    /// Transport agents use to reach the server
    pub protocol: Protocol,
    /// Host to bind the transport to
    pub host: String,
    /// Port to bind the transport to, 0 picks an ephemeral port
    pub port: u16,
    /// Number of queued flow messages above which new messages are dropped
    pub max_buffer_size: usize,
    /// Number of flow messages per bulk insert
    pub bulk_insert_count: usize,
    /// Seconds between two bulk inserts when traffic is low
    pub bulk_insert_deadline_secs: u64,
    pub storage: StorageConfig,
    /// Token agents must present on websocket connections
    pub auth_token: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for FlowServerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            host: DEFAULT_FLOW_HOST.to_string(),
            port: DEFAULT_FLOW_PORT,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            bulk_insert_count: FLOW_BULK_INSERT_DEFAULT,
            bulk_insert_deadline_secs: FLOW_BULK_INSERT_DEADLINE_DEFAULT,
            storage: StorageConfig::default(),
            auth_token: None,
            log_level: "info".to_string(),
        }
    }
}

impl FlowServerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, Creation> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup using the environment variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Creation>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let protocol = match lookup("FLOW_PROTOCOL") {
            Some(protocol) => protocol.parse()?,
            None => defaults.protocol,
        };
        let host = lookup("FLOW_LISTEN_HOST").unwrap_or(defaults.host);
        let port = parse_or(&lookup, "FLOW_LISTEN_PORT", defaults.port)?;
        let max_buffer_size = parse_or(&lookup, "FLOW_MAX_BUFFER_SIZE", defaults.max_buffer_size)?;
        let bulk_insert_count =
            parse_or(&lookup, "FLOW_BULK_INSERT_COUNT", defaults.bulk_insert_count)?;
        let bulk_insert_deadline_secs = parse_or(
            &lookup,
            "FLOW_BULK_INSERT_DEADLINE",
            defaults.bulk_insert_deadline_secs,
        )?;
        let storage = StorageConfig {
            backend: lookup("FLOW_STORAGE_BACKEND").unwrap_or(defaults.storage.backend),
            driver: lookup("FLOW_STORAGE_DRIVER").filter(|driver| !driver.trim().is_empty()),
            bulk_maxdelay: parse_or(&lookup, "FLOW_STORAGE_BULK_MAXDELAY", 0)?,
        };
        let auth_token = lookup("FLOW_AUTH_TOKEN").filter(|token| !token.is_empty());
        let log_level = lookup("FLOW_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            protocol,
            host,
            port,
            max_buffer_size,
            bulk_insert_count,
            bulk_insert_deadline_secs,
            storage,
            auth_token,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Creation> {
        if self.host.trim().is_empty() {
            return Err(Creation::InvalidConfig(
                "listen host cannot be empty".to_string(),
            ));
        }

        if self.bulk_insert_count == 0 {
            return Err(Creation::InvalidConfig(
                "bulk insert count must be greater than 0".to_string(),
            ));
        }

        if self.bulk_insert_deadline_secs == 0 {
            return Err(Creation::InvalidConfig(
                "bulk insert deadline must be greater than 0".to_string(),
            ));
        }

        if self.storage.bulk_maxdelay < 0 {
            return Err(Creation::NegativeBulkMaxDelay(self.storage.bulk_maxdelay));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(Creation::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Derives the bulk thresholds. A storage backend declaring a driver overrides the
    /// deadline with its `bulk_maxdelay`.
    pub fn bulk_settings(&self) -> Result<BulkSettings, Creation> {
        let mut deadline = Duration::from_secs(self.bulk_insert_deadline_secs);

        if self.storage.driver.is_some() {
            let bulk_maxdelay = match self.storage.bulk_maxdelay {
                delay if delay < 0 => return Err(Creation::NegativeBulkMaxDelay(delay)),
                0 => FLOW_BULK_MAX_DELAY_DEFAULT,
                delay => delay.unsigned_abs(),
            };
            deadline = Duration::from_secs(bulk_maxdelay);
        }

        Ok(BulkSettings {
            bulk_insert: self.bulk_insert_count,
            deadline,
        })
    }

    /// Address the transport binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, Creation>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Creation::InvalidConfig(format!("{key}={raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = FlowServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.bulk_settings().unwrap(),
            BulkSettings {
                bulk_insert: 100,
                deadline: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn test_from_lookup_with_defaults() {
        let config = FlowServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8082);
        assert_eq!(config.max_buffer_size, 100_000);
        assert_eq!(config.bulk_insert_count, 100);
        assert_eq!(config.bulk_insert_deadline_secs, 5);
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.auth_token, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = FlowServerConfig::from_lookup(lookup(&[
            ("FLOW_PROTOCOL", "WebSocket"),
            ("FLOW_LISTEN_HOST", "127.0.0.1"),
            ("FLOW_LISTEN_PORT", "9000"),
            ("FLOW_MAX_BUFFER_SIZE", "10"),
            ("FLOW_BULK_INSERT_COUNT", "3"),
            ("FLOW_BULK_INSERT_DEADLINE", "1"),
            ("FLOW_STORAGE_DRIVER", "memory"),
            ("FLOW_STORAGE_BULK_MAXDELAY", "7"),
            ("FLOW_AUTH_TOKEN", "secret"),
            ("FLOW_LOG_LEVEL", "DEBUG"),
        ]))
        .unwrap();

        assert_eq!(config.protocol, Protocol::WebSocket);
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.max_buffer_size, 10);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(
            config.bulk_settings().unwrap(),
            BulkSettings {
                bulk_insert: 3,
                deadline: Duration::from_secs(7),
            }
        );
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("Datagram".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!(
            "WEBSOCKET".parse::<Protocol>().unwrap(),
            Protocol::WebSocket
        );
        assert_eq!(
            "persistent-connection".parse::<Protocol>().unwrap(),
            Protocol::WebSocket
        );
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(Creation::InvalidProtocol(p)) if p == "sctp"
        ));
    }

    #[test]
    fn test_invalid_protocol_from_lookup() {
        let result = FlowServerConfig::from_lookup(lookup(&[("FLOW_PROTOCOL", "tcp")]));
        assert!(matches!(result, Err(Creation::InvalidProtocol(_))));
    }

    #[test]
    fn test_unparsable_number_is_rejected() {
        let result = FlowServerConfig::from_lookup(lookup(&[("FLOW_LISTEN_PORT", "http")]));
        assert!(matches!(result, Err(Creation::InvalidConfig(_))));
    }

    #[test]
    fn test_negative_bulk_maxdelay_is_rejected() {
        let result =
            FlowServerConfig::from_lookup(lookup(&[("FLOW_STORAGE_BULK_MAXDELAY", "-1")]));
        assert!(matches!(result, Err(Creation::NegativeBulkMaxDelay(-1))));

        let config = FlowServerConfig {
            storage: StorageConfig {
                backend: "memory".to_string(),
                driver: Some("memory".to_string()),
                bulk_maxdelay: -5,
            },
            ..Default::default()
        };
        assert!(matches!(
            config.bulk_settings(),
            Err(Creation::NegativeBulkMaxDelay(-5))
        ));
    }

    #[test]
    fn test_zero_bulk_maxdelay_uses_default() {
        let config = FlowServerConfig {
            bulk_insert_deadline_secs: 30,
            storage: StorageConfig {
                backend: "memory".to_string(),
                driver: Some("memory".to_string()),
                bulk_maxdelay: 0,
            },
            ..Default::default()
        };
        assert_eq!(
            config.bulk_settings().unwrap().deadline,
            Duration::from_secs(FLOW_BULK_MAX_DELAY_DEFAULT)
        );
    }

    #[test]
    fn test_bulk_maxdelay_ignored_without_driver() {
        let config = FlowServerConfig {
            bulk_insert_deadline_secs: 2,
            storage: StorageConfig {
                backend: "memory".to_string(),
                driver: None,
                bulk_maxdelay: 9,
            },
            ..Default::default()
        };
        assert_eq!(
            config.bulk_settings().unwrap().deadline,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let config = FlowServerConfig {
            bulk_insert_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FlowServerConfig {
            bulk_insert_deadline_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = FlowServerConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_host() {
        let config = FlowServerConfig {
            host: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
