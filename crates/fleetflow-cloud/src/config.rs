//! Reconciler configuration
//!
//! Defaults suit Azure Resource Manager. Every field can be overridden from a
//! JSON document or from `FLEETFLOW_RECONCILE_*` environment variables.

use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "FLEETFLOW_RECONCILE_";

/// Exponential backoff used while waiting for a write to become visible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Maximum number of re-reads
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between re-reads (milliseconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between re-reads (milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Overall convergence deadline (milliseconds)
    #[serde(default = "default_convergence_timeout")]
    pub timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_convergence_timeout() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            timeout_ms: default_convergence_timeout(),
        }
    }
}

impl BackoffConfig {
    /// Delay before re-read number `attempt` (zero-based), capped at `max_delay_ms`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What an upsert does when the target name already holds different properties
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Replace the existing entry silently
    #[default]
    Overwrite,
    /// Fail with [`CloudError::DuplicateName`]
    Reject,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "reject" | "strict" => Ok(Self::Reject),
            other => Err(CloudError::InvalidConfig(format!(
                "unknown duplicate policy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Deadline for a submitted operation to finish (milliseconds)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Re-read schedule after a successful write
    #[serde(default)]
    pub convergence: BackoffConfig,

    /// Also wait for removed entries to disappear from reads
    #[serde(default = "default_verify_removal")]
    pub verify_removal: bool,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Give up acquiring the aggregate lock after this long; blocks
    /// indefinitely when unset
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
}

fn default_operation_timeout() -> u64 {
    30 * 60 * 1000
}
fn default_verify_removal() -> bool {
    true
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout(),
            convergence: BackoffConfig::default(),
            verify_removal: default_verify_removal(),
            duplicate_policy: DuplicatePolicy::default(),
            lock_timeout_ms: None,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Defaults overlaid with `FLEETFLOW_RECONCILE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("OPERATION_TIMEOUT_MS")? {
            config.operation_timeout_ms = v;
        }
        if let Some(v) = env_parse("CONVERGENCE_TIMEOUT_MS")? {
            config.convergence.timeout_ms = v;
        }
        if let Some(v) = env_parse("CONVERGENCE_MAX_ATTEMPTS")? {
            config.convergence.max_attempts = v;
        }
        if let Some(v) = env_parse("CONVERGENCE_INITIAL_DELAY_MS")? {
            config.convergence.initial_delay_ms = v;
        }
        if let Some(v) = env_parse("VERIFY_REMOVAL")? {
            config.verify_removal = v;
        }
        if let Some(v) = env_parse("DUPLICATE_POLICY")? {
            config.duplicate_policy = v;
        }
        if let Some(v) = env_parse("LOCK_TIMEOUT_MS")? {
            config.lock_timeout_ms = Some(v);
        }

        Ok(config)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match std::env::var(&key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CloudError::InvalidConfig(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = BackoffConfig {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            multiplier: 2.0,
            timeout_ms: 60000,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(10000)); // capped
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ReconcilerConfig::from_json(
            r#"{"duplicate_policy": "reject", "convergence": {"max_attempts": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.convergence.max_attempts, 3);
        assert_eq!(config.convergence.initial_delay_ms, 500);
        assert!(config.verify_removal);
        assert_eq!(config.lock_timeout(), None);
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                ("FLEETFLOW_RECONCILE_LOCK_TIMEOUT_MS", Some("2500")),
                ("FLEETFLOW_RECONCILE_DUPLICATE_POLICY", Some("strict")),
                ("FLEETFLOW_RECONCILE_VERIFY_REMOVAL", Some("false")),
            ],
            || {
                let config = ReconcilerConfig::from_env().unwrap();
                assert_eq!(config.lock_timeout(), Some(Duration::from_millis(2500)));
                assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
                assert!(!config.verify_removal);
                assert_eq!(config.operation_timeout_ms, 30 * 60 * 1000);
            },
        );
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        temp_env::with_var(
            "FLEETFLOW_RECONCILE_OPERATION_TIMEOUT_MS",
            Some("soon"),
            || {
                let err = ReconcilerConfig::from_env().unwrap_err();
                assert!(matches!(err, CloudError::InvalidConfig(_)));
            },
        );
    }
}
