//! Tenant-side domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Tenant ID
pub type TenantId = Uuid;

/// A tenant-scoped subscriber account.
///
/// The username is globally unique across all tenants: the shared AAA store
/// has a single flat username namespace and authorizes by username alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    /// Stable subscriber ID
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Flat-namespace username (e.g. PPPoE login)
    pub username: String,
    /// Credential secret
    pub secret: String,
    /// Lifecycle state
    pub state: SubscriberState,
    /// Name of the bandwidth policy this subscriber is grouped under
    pub policy: String,
    /// Monotonic version from the tenant side; bumped on every mutation
    pub source_version: u64,
    /// Optional static address pushed as a reply attribute
    pub static_ip: Option<IpAddr>,
    /// Optional wall-clock expiration of the account
    pub expires_at: Option<DateTime<Utc>>,
}

impl Subscriber {
    pub fn new(tenant_id: TenantId, username: &str, secret: &str, policy: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            username: username.to_string(),
            secret: secret.to_string(),
            state: SubscriberState::Active,
            policy: policy.to_string(),
            source_version: 1,
            static_ip: None,
            expires_at: None,
        }
    }

    /// Whether the projected credential should carry the reject marker.
    pub fn is_disabled(&self) -> bool {
        !matches!(self.state, SubscriberState::Active)
    }
}

/// Subscriber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberState {
    Active,
    Suspended,
    Pending,
}

/// Projection status written back to the tenant side.
///
/// An operator must never see a silent gap between the displayed plan and
/// the enforced plan; a stuck projection shows up here with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionStatus {
    Synced,
    Pending { reason: String },
    Failed { reason: String },
}

/// Named bandwidth enforcement policy, referenced by subscribers via a
/// group assignment so policy edits propagate without per-subscriber writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthPolicy {
    pub tenant_id: TenantId,
    /// Unique policy name within the tenant; group names derive from it
    pub name: String,
    pub download_kbps: u32,
    pub upload_kbps: u32,
    /// Optional burst configuration
    pub burst: Option<BurstSettings>,
    /// Optional data-volume cap with fair-use fallback
    pub volume_cap: Option<VolumeCap>,
    pub session_timeout_secs: Option<u32>,
    pub idle_timeout_secs: Option<u32>,
    /// Max concurrent sessions
    pub simultaneous_use: u16,
    /// Accounting interim-update interval
    pub interim_interval_secs: u32,
}

impl BandwidthPolicy {
    pub fn new(tenant_id: TenantId, name: &str, download_kbps: u32, upload_kbps: u32) -> Self {
        Self {
            tenant_id,
            name: name.to_string(),
            download_kbps,
            upload_kbps,
            burst: None,
            volume_cap: None,
            session_timeout_secs: None,
            idle_timeout_secs: None,
            simultaneous_use: 1,
            interim_interval_secs: 300,
        }
    }

    /// Group name the policy materializes under in the shared store.
    pub fn group_name(&self) -> String {
        format!("policy_{}", self.name.to_lowercase().replace(' ', "_"))
    }

    /// Fallback group used once the volume cap is exhausted.
    pub fn fallback_group_name(&self) -> String {
        format!("fup_{}", self.name.to_lowercase().replace(' ', "_"))
    }
}

/// Burst rate settings, only enforced when the threshold is non-zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstSettings {
    pub download_kbps: u32,
    pub upload_kbps: u32,
    pub threshold_kbps: u32,
    pub duration_secs: u32,
    /// Queue priority 1 (highest) to 8 (lowest)
    pub priority: u8,
}

/// Monthly data cap with a fair-use fallback rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCap {
    pub monthly_mb: u64,
    pub fallback_download_kbps: u32,
    pub fallback_upload_kbps: u32,
}

/// A network access server registered by a tenant.
///
/// The address must be unique across the whole shared registry: the AAA
/// server authorizes requests by address + secret irrespective of tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NasDevice {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    /// Declared public address or deterministically assigned tunnel address
    pub address: IpAddr,
    /// Shared secret for AAA and control-channel requests
    pub secret: String,
    pub kind: NasKind,
    /// Whether the device honors live attribute-update control messages
    pub supports_coa: bool,
    /// Serial of the identity certificate bound to this device, if issued
    pub certificate_serial: Option<String>,
}

impl NasDevice {
    pub fn new(tenant_id: TenantId, name: &str, address: IpAddr, secret: &str, kind: NasKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            address,
            secret: secret.to_string(),
            kind,
            supports_coa: kind.supports_coa_by_default(),
            certificate_serial: None,
        }
    }
}

/// Device vendor kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NasKind {
    Mikrotik,
    Cisco,
    Ubiquiti,
    Other,
}

impl NasKind {
    /// Field experience: attribute-change CoA is dependable on MikroTik and
    /// Cisco firmware, unknown elsewhere.
    pub fn supports_coa_by_default(&self) -> bool {
        matches!(self, Self::Mikrotik | Self::Cisco)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_names() {
        let tenant = Uuid::new_v4();
        let policy = BandwidthPolicy::new(tenant, "Home 10M", 10_000, 5_000);

        assert_eq!(policy.group_name(), "policy_home_10m");
        assert_eq!(policy.fallback_group_name(), "fup_home_10m");
    }

    #[test]
    fn test_disabled_states() {
        let tenant = Uuid::new_v4();
        let mut sub = Subscriber::new(tenant, "u1", "pw", "basic");
        assert!(!sub.is_disabled());

        sub.state = SubscriberState::Suspended;
        assert!(sub.is_disabled());

        sub.state = SubscriberState::Pending;
        assert!(sub.is_disabled());
    }
}
