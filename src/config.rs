//! Run configuration (SPEC_FULL.md §9): the tunables every Discovery unit,
//! the Orchestrator's pools, and the State Store's retention policy read
//! from, loaded once at startup.

use crate::error::{InventoryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with a hard cap, optionally jittered by up to
    /// 25% (spec.md §5 retry policy).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.max_delay_ms);
        let delay_ms = if self.jitter {
            let jitter_span = capped / 4;
            let offset = if jitter_span == 0 {
                0
            } else {
                rand::random::<u64>() % jitter_span
            };
            capped.saturating_sub(jitter_span / 2).saturating_add(offset)
        } else {
            capped
        };
        std::time::Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_max_concurrent_accounts() -> usize {
    4
}
fn default_max_workers_per_account() -> usize {
    4
}
fn default_account_timeout_secs() -> u64 {
    1800
}
fn default_pagination_page_cap() -> usize {
    5
}
fn default_retention_days() -> u32 {
    90
}
fn default_max_snapshots() -> usize {
    30
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}
fn default_delta_attribute_whitelist() -> Vec<String> {
    vec![
        "tags".into(),
        "status".into(),
        "state".into(),
        "security_groups".into(),
        "public_access".into(),
        "encrypted".into(),
        "parent_resource".into(),
        "child_resources".into(),
        "dependencies".into(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_concurrent_accounts")]
    pub max_concurrent_accounts: usize,
    #[serde(default = "default_max_workers_per_account")]
    pub max_workers_per_account: usize,
    #[serde(default = "default_account_timeout_secs")]
    pub account_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_pagination_page_cap")]
    pub pagination_page_cap: usize,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    #[serde(default = "default_delta_attribute_whitelist")]
    pub delta_attribute_whitelist: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            max_concurrent_accounts: default_max_concurrent_accounts(),
            max_workers_per_account: default_max_workers_per_account(),
            account_timeout_secs: default_account_timeout_secs(),
            retry: RetryPolicy::default(),
            pagination_page_cap: default_pagination_page_cap(),
            circuit_breaker: CircuitBreakerConfig::default(),
            state_dir: default_state_dir(),
            retention_days: default_retention_days(),
            max_snapshots: default_max_snapshots(),
            delta_attribute_whitelist: default_delta_attribute_whitelist(),
        }
    }
}

impl RunConfig {
    /// Loads a `RunConfig` from `.json`, `.yaml`, or `.yml`; falls back to
    /// trying JSON then YAML when the extension is unrecognized, matching
    /// the Policy Loader's own dual-format convention.
    pub fn load(path: impl AsRef<Path>) -> Result<RunConfig> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| InventoryError::Unexpected {
            context: format!("reading config file {}", path.display()),
            message: e.to_string(),
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_slice(&bytes).map_err(|e| InventoryError::Unexpected {
                context: "parsing run config as YAML".into(),
                message: e.to_string(),
            })
        } else {
            serde_json::from_slice(&bytes)
                .or_else(|_| serde_yaml::from_slice(&bytes))
                .map_err(|e| InventoryError::Unexpected {
                    context: "parsing run config".into(),
                    message: e.to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.max_concurrent_accounts, 4);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retention_days, 90);
        assert_eq!(cfg.max_snapshots, 30);
    }

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 200,
            max_delay_ms: 1000,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0).as_millis(), 200);
        assert_eq!(policy.delay_for_attempt(10).as_millis(), 1000);
    }
}
