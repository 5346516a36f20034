//! Configuration structures for Offramp
//!
//! This module defines all configuration types used by the dispatch core and
//! the gateway. Configurations are loaded from YAML files and can be
//! overridden by environment variables.

use crate::error::{OfframpError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for Offramp components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfframpConfig {
    /// Server binding address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Dispatch core configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Dispatch core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum depth of each worker's private request queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Bounded capacity of each streaming channel
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,

    /// Load-balancing policy across workers
    #[serde(default)]
    pub policy: RoutePolicy,

    /// Timeout for non-streaming waits in seconds (0 = unlimited)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period for shutdown in milliseconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Number of demo worker instances spawned by the hosting binary
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            stream_capacity: default_stream_capacity(),
            policy: RoutePolicy::default(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            workers: default_workers(),
        }
    }
}

/// Load-balancing policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Rotate across live workers
    RoundRobin,

    /// Pick the live worker with the shallowest queue
    LeastDepth,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        RoutePolicy::RoundRobin
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_queue_depth() -> usize {
    32
}

fn default_stream_capacity() -> usize {
    8
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    5000
}

fn default_workers() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl OfframpConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            OfframpError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: OfframpConfig = serde_yaml::from_str(&content).map_err(|e| {
            OfframpError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(OfframpConfig {
            bind_address: std::env::var("OFFRAMP_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("OFFRAMP_PORT")
                .unwrap_or_else(|_| "8001".to_string())
                .parse()
                .map_err(|_| OfframpError::Config("Invalid port number".to_string()))?,
            dispatch: DispatchConfig::default(),
            observability: ObservabilityConfig::default(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.queue_depth == 0 {
            return Err(OfframpError::config("queue_depth must be at least 1"));
        }

        if self.dispatch.stream_capacity == 0 || self.dispatch.stream_capacity > 64 {
            return Err(OfframpError::config(
                "stream_capacity must be between 1 and 64",
            ));
        }

        if self.dispatch.workers == 0 {
            return Err(OfframpError::config("workers must be at least 1"));
        }

        Ok(())
    }

    /// Get the non-streaming wait timeout as Duration, if bounded
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.dispatch.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.dispatch.request_timeout_secs))
        }
    }

    /// Get the shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.dispatch.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OfframpConfig {
            bind_address: "0.0.0.0".to_string(),
            port: 8001,
            dispatch: DispatchConfig::default(),
            observability: ObservabilityConfig::default(),
        };

        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.queue_depth, 32);
        assert_eq!(config.dispatch.stream_capacity, 8);
        assert_eq!(config.dispatch.policy, RoutePolicy::RoundRobin);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_validation_rejects_zero_queue() {
        let mut config = OfframpConfig {
            bind_address: "0.0.0.0".to_string(),
            port: 8001,
            dispatch: DispatchConfig::default(),
            observability: ObservabilityConfig::default(),
        };
        config.dispatch.queue_depth = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
bind_address: "127.0.0.1"
port: 9000
dispatch:
  queue_depth: 4
  stream_capacity: 2
  policy: least_depth
"#;

        let config: OfframpConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 9000);
        assert_eq!(config.dispatch.queue_depth, 4);
        assert_eq!(config.dispatch.policy, RoutePolicy::LeastDepth);
        // Unspecified fields take their defaults.
        assert_eq!(config.dispatch.request_timeout_secs, 30);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_unbounded_request_timeout() {
        let mut config = OfframpConfig::from_env().unwrap();
        config.dispatch.request_timeout_secs = 0;
        assert_eq!(config.request_timeout(), None);
    }
}
