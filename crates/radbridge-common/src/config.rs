//! Engine configuration

use serde::{Deserialize, Serialize};

/// Top-level engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry behavior for projections queued on store outages
    #[serde(default)]
    pub retry: RetrySettings,
    /// Control-channel (CoA) dispatch settings
    #[serde(default)]
    pub control: ControlSettings,
    /// Tunnel address pool CIDR shared across all tenants
    #[serde(default = "default_pool_cidr")]
    pub tunnel_pool_cidr: String,
    /// Reconciliation sweep interval seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How long an orphaned projection survives before the sweeper
    /// withdraws it, to tolerate eventual deletion races
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            control: ControlSettings::default(),
            tunnel_pool_cidr: default_pool_cidr(),
            sweep_interval_secs: default_sweep_interval(),
            orphan_grace_secs: default_orphan_grace(),
        }
    }
}

/// Exponential backoff settings for store-unavailable retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetrySettings {
    /// Delay before the given attempt (1-based), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Control-message dispatch settings (RFC 5176 side channel)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Well-known CoA port on each NAS
    #[serde(default = "default_coa_port")]
    pub port: u16,
    /// Per-attempt response timeout
    #[serde(default = "default_coa_timeout")]
    pub timeout_ms: u64,
    /// Bounded delivery attempts; failure past this is reported, not retried
    #[serde(default = "default_coa_attempts")]
    pub max_attempts: u32,
    /// Base delay before re-sending a failed attempt; doubles per retry
    #[serde(default = "default_coa_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            port: default_coa_port(),
            timeout_ms: default_coa_timeout(),
            max_attempts: default_coa_attempts(),
            retry_delay_ms: default_coa_retry_delay(),
        }
    }
}

impl ControlSettings {
    /// Delay before sending the given attempt (1-based): nothing before
    /// the first, then exponential from `retry_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        if attempt <= 1 {
            return std::time::Duration::ZERO;
        }
        let exp = (attempt - 2).min(8);
        std::time::Duration::from_millis(self.retry_delay_ms.saturating_mul(1u64 << exp))
    }
}

fn default_pool_cidr() -> String {
    "10.8.0.0/24".to_string()
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_orphan_grace() -> u64 {
    900
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_coa_port() -> u16 {
    3799
}

fn default_coa_timeout() -> u64 {
    5_000
}

fn default_coa_attempts() -> u32 {
    3
}

fn default_coa_retry_delay() -> u64 {
    1_000
}
