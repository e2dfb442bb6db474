//! Tenant-side change feed
//!
//! The engine never owns tenant data; it reads subscribers, policies and
//! devices through [`TenantDirectory`] and learns about mutations through
//! [`ChangeEvent`]s delivered over an mpsc channel. Projection status flows
//! the other way so the tenant UI can show sync state per subscriber.

use async_trait::async_trait;
use dashmap::DashMap;
use radbridge_common::{BandwidthPolicy, NasDevice, ProjectionStatus, Subscriber, TenantId};
use std::net::IpAddr;

/// A mutation notification from the tenant side. Events carry keys, not
/// payloads: the engine re-reads the current record so a stale event can
/// never overwrite a newer state.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    SubscriberUpserted { tenant_id: TenantId, username: String },
    SubscriberRemoved { tenant_id: TenantId, username: String },
    PolicyChanged { tenant_id: TenantId, name: String },
    NasUpserted { tenant_id: TenantId, address: IpAddr },
    NasRemoved { address: IpAddr },
}

/// Read access to tenant records plus the projection-status writeback.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn subscribers(&self) -> Vec<Subscriber>;
    async fn subscriber(&self, tenant_id: TenantId, username: &str) -> Option<Subscriber>;
    async fn subscribers_on_policy(&self, tenant_id: TenantId, policy: &str) -> Vec<Subscriber>;
    async fn policy(&self, tenant_id: TenantId, name: &str) -> Option<BandwidthPolicy>;
    async fn nas_device(&self, address: IpAddr) -> Option<NasDevice>;
    async fn nas_devices(&self) -> Vec<NasDevice>;

    /// Record the projection status an operator sees next to the subscriber.
    async fn record_status(&self, tenant_id: TenantId, username: &str, status: ProjectionStatus);
    async fn status(&self, tenant_id: TenantId, username: &str) -> Option<ProjectionStatus>;
}

/// In-memory directory, used by tests and by deployments that push full
/// snapshots instead of exposing a remote directory service.
#[derive(Default)]
pub struct MemoryDirectory {
    subscribers: DashMap<(TenantId, String), Subscriber>,
    policies: DashMap<(TenantId, String), BandwidthPolicy>,
    devices: DashMap<IpAddr, NasDevice>,
    statuses: DashMap<(TenantId, String), ProjectionStatus>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_subscriber(&self, subscriber: Subscriber) {
        self.subscribers.insert(
            (subscriber.tenant_id, subscriber.username.clone()),
            subscriber,
        );
    }

    pub fn remove_subscriber(&self, tenant_id: TenantId, username: &str) {
        self.subscribers.remove(&(tenant_id, username.to_string()));
        self.statuses.remove(&(tenant_id, username.to_string()));
    }

    pub fn upsert_policy(&self, policy: BandwidthPolicy) {
        self.policies
            .insert((policy.tenant_id, policy.name.clone()), policy);
    }

    pub fn upsert_nas(&self, device: NasDevice) {
        self.devices.insert(device.address, device);
    }

    pub fn remove_nas(&self, address: IpAddr) {
        self.devices.remove(&address);
    }
}

#[async_trait]
impl TenantDirectory for MemoryDirectory {
    async fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.iter().map(|e| e.value().clone()).collect()
    }

    async fn subscriber(&self, tenant_id: TenantId, username: &str) -> Option<Subscriber> {
        self.subscribers
            .get(&(tenant_id, username.to_string()))
            .map(|e| e.value().clone())
    }

    async fn subscribers_on_policy(&self, tenant_id: TenantId, policy: &str) -> Vec<Subscriber> {
        self.subscribers
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.policy == policy)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn policy(&self, tenant_id: TenantId, name: &str) -> Option<BandwidthPolicy> {
        self.policies
            .get(&(tenant_id, name.to_string()))
            .map(|e| e.value().clone())
    }

    async fn nas_device(&self, address: IpAddr) -> Option<NasDevice> {
        self.devices.get(&address).map(|e| e.value().clone())
    }

    async fn nas_devices(&self) -> Vec<NasDevice> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    async fn record_status(&self, tenant_id: TenantId, username: &str, status: ProjectionStatus) {
        self.statuses
            .insert((tenant_id, username.to_string()), status);
    }

    async fn status(&self, tenant_id: TenantId, username: &str) -> Option<ProjectionStatus> {
        self.statuses
            .get(&(tenant_id, username.to_string()))
            .map(|e| e.value().clone())
    }
}
