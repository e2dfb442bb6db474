//! In-memory reference store
//!
//! DashMap-backed implementation of [`AaaStore`]. Production deployments
//! point the same trait at the AAA server's SQL tables; this implementation
//! backs tests and keeps the row-group semantics honest, including an
//! availability toggle for exercising the store-unreachable paths.

use crate::rows::{CheckRow, GroupReplyRow, NasRow, ProjectionMeta, ReplyRow, UserGroupRow};
use crate::store::{AaaStore, StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use radbridge_common::TenantId;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory AAA store
pub struct MemoryStore {
    /// Check rows keyed by (username, attribute)
    checks: DashMap<(String, String), CheckRow>,
    /// Reply rows per username
    replies: DashMap<String, Vec<ReplyRow>>,
    /// Group membership per username
    groups: DashMap<String, UserGroupRow>,
    /// Group reply rows per group
    group_replies: DashMap<String, Vec<GroupReplyRow>>,
    /// NAS registry keyed by address
    nas: DashMap<IpAddr, NasRow>,
    /// Projection bookkeeping per username
    meta: DashMap<String, ProjectionMeta>,
    /// Reachability toggle for failure-path tests
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            checks: DashMap::new(),
            replies: DashMap::new(),
            groups: DashMap::new(),
            group_replies: DashMap::new(),
            nas: DashMap::new(),
            meta: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage of the shared store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Directly overwrite a check row value, bypassing ownership checks.
    /// Models out-of-band manual edits the sweeper must repair.
    pub fn corrupt_check(&self, username: &str, attribute: &str, value: &str) {
        if let Some(mut row) = self.checks.get_mut(&(username.to_string(), attribute.to_string())) {
            row.value = value.to_string();
        }
    }

    /// Same as [`Self::corrupt_check`] for reply rows.
    pub fn corrupt_reply(&self, username: &str, attribute: &str, value: &str) {
        if let Some(mut rows) = self.replies.get_mut(username) {
            for row in rows.iter_mut() {
                if row.attribute == attribute {
                    row.value = value.to_string();
                }
            }
        }
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn check_owner(&self, username: &str, tenant_id: TenantId) -> StoreResult<()> {
        if let Some(meta) = self.meta.get(username) {
            if meta.tenant_id != tenant_id {
                return Err(StoreError::UsernameTaken(username.to_string()));
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AaaStore for MemoryStore {
    async fn upsert_check(&self, row: CheckRow) -> StoreResult<()> {
        self.check_reachable()?;
        self.check_owner(&row.username, row.tenant_id)?;
        self.checks
            .insert((row.username.clone(), row.attribute.clone()), row);
        Ok(())
    }

    async fn delete_check(&self, username: &str, attribute: &str) -> StoreResult<bool> {
        self.check_reachable()?;
        Ok(self
            .checks
            .remove(&(username.to_string(), attribute.to_string()))
            .is_some())
    }

    async fn checks_for(&self, username: &str) -> StoreResult<Vec<CheckRow>> {
        self.check_reachable()?;
        Ok(self
            .checks
            .iter()
            .filter(|entry| entry.key().0 == username)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn replace_replies(&self, username: &str, rows: Vec<ReplyRow>) -> StoreResult<()> {
        self.check_reachable()?;
        if let Some(row) = rows.first() {
            self.check_owner(username, row.tenant_id)?;
        }
        self.replies.insert(username.to_string(), rows);
        Ok(())
    }

    async fn replies_for(&self, username: &str) -> StoreResult<Vec<ReplyRow>> {
        self.check_reachable()?;
        Ok(self
            .replies
            .get(username)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn set_group(&self, row: UserGroupRow) -> StoreResult<()> {
        self.check_reachable()?;
        self.check_owner(&row.username, row.tenant_id)?;
        self.groups.insert(row.username.clone(), row);
        Ok(())
    }

    async fn group_for(&self, username: &str) -> StoreResult<Option<UserGroupRow>> {
        self.check_reachable()?;
        Ok(self.groups.get(username).map(|row| row.clone()))
    }

    async fn replace_group_replies(
        &self,
        groupname: &str,
        rows: Vec<GroupReplyRow>,
    ) -> StoreResult<()> {
        self.check_reachable()?;
        self.group_replies.insert(groupname.to_string(), rows);
        Ok(())
    }

    async fn group_replies_for(&self, groupname: &str) -> StoreResult<Vec<GroupReplyRow>> {
        self.check_reachable()?;
        Ok(self
            .group_replies
            .get(groupname)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn upsert_nas(&self, row: NasRow) -> StoreResult<()> {
        self.check_reachable()?;
        if let Some(existing) = self.nas.get(&row.address) {
            if existing.tenant_id != row.tenant_id {
                return Err(StoreError::AddressTaken(row.address));
            }
        }
        self.nas.insert(row.address, row);
        Ok(())
    }

    async fn nas_by_address(&self, address: IpAddr) -> StoreResult<Option<NasRow>> {
        self.check_reachable()?;
        Ok(self.nas.get(&address).map(|row| row.clone()))
    }

    async fn remove_nas(&self, address: IpAddr) -> StoreResult<bool> {
        self.check_reachable()?;
        Ok(self.nas.remove(&address).is_some())
    }

    async fn projection_meta(&self, username: &str) -> StoreResult<Option<ProjectionMeta>> {
        self.check_reachable()?;
        Ok(self.meta.get(username).map(|meta| meta.clone()))
    }

    async fn set_projection_meta(&self, username: &str, meta: ProjectionMeta) -> StoreResult<()> {
        self.check_reachable()?;
        self.check_owner(username, meta.tenant_id)?;
        self.meta.insert(username.to_string(), meta);
        Ok(())
    }

    async fn owner_of(&self, username: &str) -> StoreResult<Option<TenantId>> {
        self.check_reachable()?;
        Ok(self.meta.get(username).map(|meta| meta.tenant_id))
    }

    async fn projected_usernames(&self) -> StoreResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self.meta.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn purge_user(&self, username: &str) -> StoreResult<()> {
        self.check_reachable()?;
        self.checks.retain(|key, _| key.0 != username);
        self.replies.remove(username);
        self.groups.remove(username);
        self.meta.remove(username);
        Ok(())
    }
}
