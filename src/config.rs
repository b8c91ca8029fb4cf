//! Typed configuration document covering every orchestration knob.
//!
//! Loading from a file (TOML/JSON/YAML, detected by the `config` crate) is
//! provided as ambient plumbing; the CLI front-end that discovers *which*
//! file to load and merges env overrides is out of scope for this crate.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ZergError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub default_count: usize,
    pub max_count: usize,
    pub context_threshold: f64,
    pub timeout_seconds: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            default_count: 5,
            max_count: 10,
            context_threshold: 0.70,
            timeout_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 49152,
            range_end: 65535,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_seconds: 10,
            max_backoff_seconds: 300,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub enabled: bool,
    pub failure_rate_threshold: f64,
    pub window_size: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_rate_threshold: 0.5,
            window_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ErrorRecoveryConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub backpressure: BackpressureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub network_isolation: bool,
    pub filesystem_sandbox: bool,
    pub secrets_scanning: bool,
    pub read_only_root: bool,
    pub no_new_privileges: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            network_isolation: false,
            filesystem_sandbox: false,
            secrets_scanning: true,
            read_only_root: false,
            no_new_privileges: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image_name: String,
    pub network: String,
    pub memory_limit: String,
    pub cpu_limit: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image_name: "zerg-worker:latest".to_string(),
            network: "bridge".to_string(),
            memory_limit: "4g".to_string(),
            cpu_limit: "2.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZergConfig {
    pub workers: WorkersConfig,
    pub ports: PortsConfig,
    pub merge_timeout_seconds: u64,
    pub merge_max_retries: u32,
    pub retry: RetryConfig,
    pub error_recovery: ErrorRecoveryConfig,
    pub security: SecurityConfig,
    pub container: ContainerConfig,
}

impl Default for ZergConfig {
    fn default() -> Self {
        Self {
            workers: WorkersConfig::default(),
            ports: PortsConfig::default(),
            merge_timeout_seconds: 600,
            merge_max_retries: 3,
            retry: RetryConfig::default(),
            error_recovery: ErrorRecoveryConfig::default(),
            security: SecurityConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

impl ZergConfig {
    /// Loads configuration from a file, overlaying onto the documented
    /// defaults. Format (TOML/JSON/YAML) is inferred from the extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(|e| {
                ZergError::config(format!("failed to seed config defaults: {e}"))
            })?)
            .add_source(config::File::from(path));

        let built = builder
            .build()
            .map_err(|e| ZergError::config(format!("failed to load {}: {e}", path.display())))?;

        built
            .try_deserialize()
            .map_err(|e| ZergError::config(format!("invalid configuration: {e}")))
    }

    /// Exponential backoff for a task-level failure retry, per the retry
    /// config: `min(base * 2^retry_count, max)`.
    pub fn retry_backoff(&self, retry_count: u32) -> u64 {
        let scaled = self
            .retry
            .base_backoff_seconds
            .saturating_mul(1u64 << retry_count.min(32));
        scaled.min(self.retry.max_backoff_seconds)
    }

    /// Backoff for a level merge retry attempt (1-indexed): `10, 20, 40, ...`
    pub fn merge_backoff(&self, attempt: u32) -> u64 {
        10u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ZergConfig::default();
        assert_eq!(cfg.merge_timeout_seconds, 600);
        assert_eq!(cfg.merge_max_retries, 3);
        assert_eq!(cfg.retry.base_backoff_seconds, 10);
        assert_eq!(cfg.retry.max_backoff_seconds, 300);
        assert_eq!(cfg.error_recovery.circuit_breaker.failure_threshold, 3);
        assert_eq!(cfg.error_recovery.circuit_breaker.cooldown_seconds, 60);
        assert_eq!(cfg.error_recovery.backpressure.failure_rate_threshold, 0.5);
    }

    #[test]
    fn merge_backoff_sequence() {
        let cfg = ZergConfig::default();
        assert_eq!(cfg.merge_backoff(1), 10);
        assert_eq!(cfg.merge_backoff(2), 20);
        assert_eq!(cfg.merge_backoff(3), 40);
        assert_eq!(cfg.merge_backoff(4), 80);
    }

    #[test]
    fn retry_backoff_caps_at_max() {
        let cfg = ZergConfig::default();
        assert_eq!(cfg.retry_backoff(0), 10);
        assert_eq!(cfg.retry_backoff(1), 20);
        assert_eq!(cfg.retry_backoff(2), 40);
        assert_eq!(cfg.retry_backoff(10), 300); // clamps to max_backoff_seconds
    }
}
