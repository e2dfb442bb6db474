//! RadBridge shared domain model
//!
//! Tenant-scoped records (subscribers, bandwidth policies, network access
//! servers) are the source of truth; the engine projects them into a shared,
//! flat AAA store that has no tenant concept. The types here are the
//! tenant-side view that every other crate consumes.

pub mod config;
pub mod model;

pub use config::{ControlSettings, EngineConfig, RetrySettings};
pub use model::{
    BandwidthPolicy, BurstSettings, NasDevice, NasKind, ProjectionStatus, Subscriber,
    SubscriberState, TenantId, VolumeCap,
};
