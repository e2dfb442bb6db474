//! Store seam

use crate::rows::{CheckRow, GroupReplyRow, NasRow, ProjectionMeta, ReplyRow, UserGroupRow};
use async_trait::async_trait;
use radbridge_common::TenantId;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// Transient: the shared store cannot be reached. Callers queue and retry.
    #[error("shared AAA store unreachable")]
    Unavailable,

    /// The flat username namespace already holds this name for another tenant.
    #[error("username already owned by another tenant: {0}")]
    UsernameTaken(String),

    /// NAS addresses are unique across the whole registry.
    #[error("NAS address already registered: {0}")]
    AddressTaken(IpAddr),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Write/read contract against the shared AAA tables.
///
/// All writes are idempotent upserts keyed the way the AAA server keys its
/// tables (username + attribute, username + group, NAS address). The engine
/// never deletes credential rows for live subscribers; disable is a value
/// change on the credential's reject marker.
#[async_trait]
pub trait AaaStore: Send + Sync {
    // Check attributes
    async fn upsert_check(&self, row: CheckRow) -> StoreResult<()>;
    async fn delete_check(&self, username: &str, attribute: &str) -> StoreResult<bool>;
    async fn checks_for(&self, username: &str) -> StoreResult<Vec<CheckRow>>;

    // Reply attributes are replaced as a set per username
    async fn replace_replies(&self, username: &str, rows: Vec<ReplyRow>) -> StoreResult<()>;
    async fn replies_for(&self, username: &str) -> StoreResult<Vec<ReplyRow>>;

    // Group membership and group-level attributes
    async fn set_group(&self, row: UserGroupRow) -> StoreResult<()>;
    async fn group_for(&self, username: &str) -> StoreResult<Option<UserGroupRow>>;
    async fn replace_group_replies(
        &self,
        groupname: &str,
        rows: Vec<GroupReplyRow>,
    ) -> StoreResult<()>;
    async fn group_replies_for(&self, groupname: &str) -> StoreResult<Vec<GroupReplyRow>>;

    // NAS registry
    async fn upsert_nas(&self, row: NasRow) -> StoreResult<()>;
    async fn nas_by_address(&self, address: IpAddr) -> StoreResult<Option<NasRow>>;
    async fn remove_nas(&self, address: IpAddr) -> StoreResult<bool>;

    // Projection bookkeeping
    async fn projection_meta(&self, username: &str) -> StoreResult<Option<ProjectionMeta>>;
    async fn set_projection_meta(&self, username: &str, meta: ProjectionMeta) -> StoreResult<()>;
    async fn owner_of(&self, username: &str) -> StoreResult<Option<TenantId>>;

    // Enumeration for the reconciliation sweeper
    async fn projected_usernames(&self) -> StoreResult<Vec<String>>;

    /// Tear down every row belonging to a username. Reserved for projections
    /// whose owning subscriber is gone past the grace period.
    async fn purge_user(&self, username: &str) -> StoreResult<()>;
}
