//! AAA projector
//!
//! Turns tenant subscriber records into flat rows in the shared store.
//! Writes are idempotent and ordered so that a crash mid-projection leaves
//! the subscriber either on the old attribute set or the new one, never on
//! an unauthorizable mix: the credential row anchors ownership and goes
//! first, group membership flips last.

use crate::EngineError;
use dashmap::DashMap;
use parking_lot::Mutex;
use radbridge_common::{BandwidthPolicy, RetrySettings, Subscriber, TenantId};
use radbridge_policy::{resolve, AttributeTriple};
use radbridge_store::{
    AaaStore, CheckRow, GroupReplyRow, ProjectionMeta, ReplyRow, StoreError, UserGroupRow,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened to a projection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectOutcome {
    /// Rows written, store now reflects this source version
    Applied,
    /// The store already holds an equal or newer version; nothing written
    Stale { stored: u64 },
    /// Store unreachable; the projection sits in the retry queue
    Queued,
}

/// Retry-queue drain results.
#[derive(Debug, Default)]
pub struct FlushStats {
    pub applied: usize,
    pub requeued: usize,
    /// Projections that exhausted their retry budget this pass
    pub dropped: Vec<(TenantId, String)>,
}

struct QueuedProjection {
    subscriber: Subscriber,
    policy: BandwidthPolicy,
    attempts: u32,
}

pub struct Projector {
    store: Arc<dyn AaaStore>,
    retry: RetrySettings,
    /// Per-username write serialization; concurrent projections for
    /// different usernames proceed in parallel
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    queue: Mutex<VecDeque<QueuedProjection>>,
}

impl Projector {
    pub fn new(store: Arc<dyn AaaStore>, retry: RetrySettings) -> Self {
        Self {
            store,
            retry,
            locks: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Project a subscriber, skipping if the store already holds an equal
    /// or newer source version. Store outages queue instead of failing.
    pub async fn project(
        &self,
        subscriber: &Subscriber,
        policy: &BandwidthPolicy,
    ) -> Result<ProjectOutcome, EngineError> {
        let lock = self.user_lock(&subscriber.username);
        let _guard = lock.lock().await;

        match self.apply(subscriber, policy, false).await {
            Err(EngineError::Store(StoreError::Unavailable)) => {
                warn!(
                    username = %subscriber.username,
                    version = subscriber.source_version,
                    "Store unavailable, projection queued"
                );
                self.enqueue(subscriber.clone(), policy.clone(), 0);
                Ok(ProjectOutcome::Queued)
            }
            other => other,
        }
    }

    /// Project unconditionally, ignoring the stored version. Used by the
    /// sweeper and by operator-triggered resyncs where the rows themselves
    /// are suspected wrong even though the version matches.
    pub async fn reproject(
        &self,
        subscriber: &Subscriber,
        policy: &BandwidthPolicy,
    ) -> Result<ProjectOutcome, EngineError> {
        let lock = self.user_lock(&subscriber.username);
        let _guard = lock.lock().await;
        self.apply(subscriber, policy, true).await
    }

    async fn apply(
        &self,
        subscriber: &Subscriber,
        policy: &BandwidthPolicy,
        force: bool,
    ) -> Result<ProjectOutcome, EngineError> {
        let resolved = resolve(subscriber, policy)?;

        if !force {
            if let Some(meta) = self.store.projection_meta(&subscriber.username).await? {
                if meta.tenant_id == subscriber.tenant_id
                    && meta.source_version >= subscriber.source_version
                {
                    return Ok(ProjectOutcome::Stale {
                        stored: meta.source_version,
                    });
                }
            }
        }

        // Credential first: it carries the tenant tag, so a username claimed
        // by another tenant fails here before anything else is touched.
        for triple in &resolved.checks {
            self.store
                .upsert_check(check_row(subscriber, triple))
                .await?;
        }

        // Retire check attributes the new state no longer resolves, e.g.
        // the reject marker after a reinstate.
        let current = self.store.checks_for(&subscriber.username).await?;
        for row in current {
            if !resolved.checks.iter().any(|t| t.name == row.attribute) {
                self.store
                    .delete_check(&subscriber.username, &row.attribute)
                    .await?;
            }
        }

        let replies = resolved
            .replies
            .iter()
            .map(|t| reply_row(subscriber, t))
            .collect();
        self.store
            .replace_replies(&subscriber.username, replies)
            .await?;

        // Group-level attributes before membership, so a first member never
        // points at an empty group.
        self.materialize_groups(policy).await?;
        self.store
            .set_group(UserGroupRow {
                username: subscriber.username.clone(),
                groupname: resolved.group.clone(),
                priority: 1,
                tenant_id: subscriber.tenant_id,
            })
            .await?;

        self.store
            .set_projection_meta(
                &subscriber.username,
                ProjectionMeta {
                    tenant_id: subscriber.tenant_id,
                    source_version: subscriber.source_version,
                    projected_at: chrono::Utc::now(),
                },
            )
            .await?;

        debug!(
            username = %subscriber.username,
            version = subscriber.source_version,
            group = %resolved.group,
            "Projection applied"
        );
        Ok(ProjectOutcome::Applied)
    }

    /// Write the group-level reply rows for a policy (and its fair-use
    /// fallback group when the policy caps volume). Policy edits call this
    /// directly; every member picks up the change on next authorization.
    pub async fn materialize_groups(&self, policy: &BandwidthPolicy) -> Result<(), EngineError> {
        let attrs = radbridge_policy::group_attributes(policy)?;
        let group = policy.group_name();
        self.store
            .replace_group_replies(&group, group_rows(policy, &group, &attrs))
            .await?;

        if let Some(attrs) = radbridge_policy::fallback_group_attributes(policy)? {
            let fallback = policy.fallback_group_name();
            self.store
                .replace_group_replies(&fallback, group_rows(policy, &fallback, &attrs))
                .await?;
        }
        Ok(())
    }

    /// Tear down every projected row for a username.
    pub async fn withdraw(&self, username: &str) -> Result<(), EngineError> {
        let lock = self.user_lock(username);
        let _guard = lock.lock().await;
        self.store.purge_user(username).await?;
        debug!(username, "Projection withdrawn");
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// One retry pass over the queue. Still-unreachable projections go back
    /// with a bumped attempt count until the budget runs out.
    pub async fn flush_queued(&self) -> FlushStats {
        let mut stats = FlushStats::default();
        let pending: Vec<QueuedProjection> = self.queue.lock().drain(..).collect();

        for mut item in pending {
            let lock = self.user_lock(&item.subscriber.username);
            let _guard = lock.lock().await;

            match self.apply(&item.subscriber, &item.policy, false).await {
                Ok(_) => stats.applied += 1,
                Err(EngineError::Store(StoreError::Unavailable)) => {
                    item.attempts += 1;
                    if item.attempts >= self.retry.max_attempts {
                        error!(
                            username = %item.subscriber.username,
                            attempts = item.attempts,
                            "Projection dropped after retry budget"
                        );
                        stats
                            .dropped
                            .push((item.subscriber.tenant_id, item.subscriber.username));
                    } else {
                        stats.requeued += 1;
                        self.enqueue(item.subscriber, item.policy, item.attempts);
                    }
                }
                Err(err) => {
                    error!(
                        username = %item.subscriber.username,
                        %err,
                        "Queued projection failed permanently"
                    );
                    stats
                        .dropped
                        .push((item.subscriber.tenant_id, item.subscriber.username));
                }
            }
        }
        stats
    }

    /// Background retry worker with exponential backoff keyed to the oldest
    /// queued attempt count.
    pub async fn run_retry_worker(self: Arc<Self>) {
        loop {
            let attempts = self
                .queue
                .lock()
                .front()
                .map(|item| item.attempts + 1)
                .unwrap_or(1);
            tokio::time::sleep(self.retry.delay_for_attempt(attempts)).await;
            if self.queued() > 0 {
                let stats = self.flush_queued().await;
                debug!(
                    applied = stats.applied,
                    requeued = stats.requeued,
                    dropped = stats.dropped.len(),
                    "Retry pass"
                );
            }
        }
    }

    fn enqueue(&self, subscriber: Subscriber, policy: BandwidthPolicy, attempts: u32) {
        let mut queue = self.queue.lock();
        // Only the newest version per username is worth retrying.
        queue.retain(|item| item.subscriber.username != subscriber.username);
        queue.push_back(QueuedProjection {
            subscriber,
            policy,
            attempts,
        });
    }

    fn user_lock(&self, username: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn check_row(subscriber: &Subscriber, triple: &AttributeTriple) -> CheckRow {
    CheckRow {
        username: subscriber.username.clone(),
        attribute: triple.name.clone(),
        op: triple.op.as_str().to_string(),
        value: triple.value.clone(),
        tenant_id: subscriber.tenant_id,
    }
}

fn reply_row(subscriber: &Subscriber, triple: &AttributeTriple) -> ReplyRow {
    ReplyRow {
        username: subscriber.username.clone(),
        attribute: triple.name.clone(),
        op: triple.op.as_str().to_string(),
        value: triple.value.clone(),
        tenant_id: subscriber.tenant_id,
    }
}

fn group_rows(
    policy: &BandwidthPolicy,
    groupname: &str,
    attrs: &[AttributeTriple],
) -> Vec<GroupReplyRow> {
    attrs
        .iter()
        .map(|t| GroupReplyRow {
            groupname: groupname.to_string(),
            attribute: t.name.clone(),
            op: t.op.as_str().to_string(),
            value: t.value.clone(),
            tenant_id: policy.tenant_id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use radbridge_common::SubscriberState;
    use radbridge_store::MemoryStore;
    use uuid::Uuid;

    fn setup() -> (Arc<MemoryStore>, Projector, Subscriber, BandwidthPolicy) {
        let store = Arc::new(MemoryStore::new());
        let projector = Projector::new(store.clone(), RetrySettings::default());
        let tenant = Uuid::new_v4();
        let subscriber = Subscriber::new(tenant, "alice", "pw", "basic");
        let policy = BandwidthPolicy::new(tenant, "basic", 10_000, 5_000);
        (store, projector, subscriber, policy)
    }

    #[tokio::test]
    async fn test_project_writes_all_rows() {
        let (store, projector, subscriber, policy) = setup();

        let outcome = projector.project(&subscriber, &policy).await.unwrap();
        assert_eq!(outcome, ProjectOutcome::Applied);

        let checks = store.checks_for("alice").await.unwrap();
        assert!(checks
            .iter()
            .any(|r| r.attribute == "Cleartext-Password" && r.value == "pw"));

        let group = store.group_for("alice").await.unwrap().unwrap();
        assert_eq!(group.groupname, "policy_basic");

        let group_replies = store.group_replies_for("policy_basic").await.unwrap();
        assert!(group_replies
            .iter()
            .any(|r| r.attribute == "Mikrotik-Rate-Limit"));
    }

    #[tokio::test]
    async fn test_stale_version_is_skipped() {
        let (store, projector, mut subscriber, policy) = setup();

        subscriber.source_version = 5;
        subscriber.secret = "newer".to_string();
        projector.project(&subscriber, &policy).await.unwrap();

        subscriber.source_version = 3;
        subscriber.secret = "older".to_string();
        let outcome = projector.project(&subscriber, &policy).await.unwrap();
        assert_eq!(outcome, ProjectOutcome::Stale { stored: 5 });

        let checks = store.checks_for("alice").await.unwrap();
        assert!(checks.iter().any(|r| r.value == "newer"));
    }

    #[tokio::test]
    async fn test_reinstate_removes_reject_marker() {
        let (store, projector, mut subscriber, policy) = setup();

        subscriber.state = SubscriberState::Suspended;
        projector.project(&subscriber, &policy).await.unwrap();
        let checks = store.checks_for("alice").await.unwrap();
        assert!(checks.iter().any(|r| r.attribute == "Auth-Type"));

        subscriber.state = SubscriberState::Active;
        subscriber.source_version += 1;
        projector.project(&subscriber, &policy).await.unwrap();
        let checks = store.checks_for("alice").await.unwrap();
        assert!(!checks.iter().any(|r| r.attribute == "Auth-Type"));
    }

    #[tokio::test]
    async fn test_outage_queues_then_flushes() {
        let (store, projector, subscriber, policy) = setup();

        store.set_available(false);
        let outcome = projector.project(&subscriber, &policy).await.unwrap();
        assert_eq!(outcome, ProjectOutcome::Queued);
        assert_eq!(projector.queued(), 1);

        store.set_available(true);
        let stats = projector.flush_queued().await;
        assert_eq!(stats.applied, 1);
        assert_eq!(projector.queued(), 0);
        assert!(store.group_for("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queue_keeps_only_newest_version() {
        let (store, projector, mut subscriber, policy) = setup();

        store.set_available(false);
        projector.project(&subscriber, &policy).await.unwrap();
        subscriber.source_version = 2;
        projector.project(&subscriber, &policy).await.unwrap();

        assert_eq!(projector.queued(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_purges_everything() {
        let (store, projector, subscriber, policy) = setup();

        projector.project(&subscriber, &policy).await.unwrap();
        projector.withdraw("alice").await.unwrap();

        assert!(store.checks_for("alice").await.unwrap().is_empty());
        assert!(store.group_for("alice").await.unwrap().is_none());
        assert!(store.projection_meta("alice").await.unwrap().is_none());
    }
}
