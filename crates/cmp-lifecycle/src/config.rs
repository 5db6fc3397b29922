//! Life-cycle engine configuration.

use std::time::Duration;

use cmp_core::models::approval::ApproverSpec;
use cmp_core::models::scan::ScanTarget;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::RoleDefinition;

/// Configuration for every life-cycle component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub pipeline: PipelineConfig,
    pub renewal: RenewalConfig,
    pub discovery: DiscoveryConfig,
    pub approval: ApprovalConfig,
    /// Roles added to (or replacing) the built-in ones.
    pub roles: Vec<RoleDefinition>,
}

/// Issuance pipeline worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds between sweeps for pending requests (default: 5).
    pub poll_interval_secs: u64,
    /// Requests processed concurrently (default: 8).
    pub max_concurrent: usize,
    /// Requests claimed per sweep (default: 50).
    pub batch_size: u64,
    /// Per-call CA adapter timeout in milliseconds (default: 30_000).
    pub adapter_timeout_ms: u64,
    /// Adapter used for renewals of certificates that record none.
    pub default_adapter_id: Option<Uuid>,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_concurrent: 8,
            batch_size: 50,
            adapter_timeout_ms: 30_000,
            default_adapter_id: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }
}

/// Exponential backoff for transient CA failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Adapter calls per request, including the first (default: 5).
    pub max_attempts: u32,
    /// Delay after the first failed attempt in milliseconds (default: 500).
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds (default: 30_000).
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays (default: 2.0).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Renewal scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    pub enabled: bool,
    /// Seconds between scheduler ticks (default: 3600).
    pub interval_secs: u64,
    /// Days before expiry a certificate becomes eligible (default: 30).
    pub window_days: i64,
    /// Certificates handled per tick (default: 100).
    pub batch_size: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            window_days: 30,
            batch_size: 100,
        }
    }
}

impl RenewalConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::days(self.window_days.max(0))
    }
}

/// Discovery scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Seconds between scans (default: 3600).
    pub interval_secs: u64,
    /// Concurrent probes (default: 16).
    pub workers: usize,
    /// TCP connect timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: u64,
    /// TLS handshake timeout in milliseconds (default: 5000).
    pub handshake_timeout_ms: u64,
    pub targets: Vec<ScanTarget>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            workers: 16,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            targets: Vec::new(),
        }
    }
}

/// Who approves gated issuance requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub approvers: Vec<ApproverSpec>,
    /// Approvals needed before issuance (default: 1).
    pub required_approvals: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            approvers: Vec::new(),
            required_approvals: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: LifecycleConfig = serde_json::from_str(
            r#"{"pipeline":{"max_concurrent":2},"discovery":{"targets":[{"host":"a","port":443}]}}"#,
        )
        .unwrap();
        assert_eq!(config.pipeline.max_concurrent, 2);
        assert_eq!(config.pipeline.retry.max_attempts, 5);
        assert_eq!(config.renewal.window_days, 30);
        assert_eq!(config.discovery.targets[0].address(), "a:443");
        assert_eq!(config.approval.required_approvals, 1);
    }
}
