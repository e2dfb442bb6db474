//! Reconciliation sweeper
//!
//! Periodically walks desired state (tenant directory) against actual state
//! (shared store rows) and repairs whatever drifted: rows edited behind the
//! engine's back, projections stuck in the retry queue, orphaned rows whose
//! subscriber is gone, overdue certificates and quarantined accounting
//! events. The sweeper is the convergence backstop; everything else in the
//! engine is allowed to be best-effort because this isn't.

use crate::accounting::AccountingIngestor;
use crate::control::{resolve_control_target, SessionController};
use crate::feed::TenantDirectory;
use crate::projector::Projector;
use crate::EngineError;
use chrono::{DateTime, Duration, Utc};
use radbridge_common::{EngineConfig, ProjectionStatus, Subscriber};
use radbridge_policy::resolve;
use radbridge_store::AaaStore;
use serde::Serialize;
use radbridge_trust::TrustRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Subscribers compared against their projected rows
    pub checked: usize,
    /// Drifted projections rewritten
    pub repaired: usize,
    /// Orphaned projections withdrawn past the grace period
    pub withdrawn: usize,
    /// Certificates flipped to expired
    pub expired_certificates: usize,
    /// Quarantined accounting events attributed this pass
    pub reattributed_events: usize,
    /// Queued projections applied from the retry queue
    pub retried_projections: usize,
    /// Live sessions of wall-clock-expired subscribers disconnected
    pub expired_disconnects: usize,
}

pub struct Sweeper {
    store: Arc<dyn AaaStore>,
    projector: Arc<Projector>,
    directory: Arc<dyn TenantDirectory>,
    ingestor: Arc<AccountingIngestor>,
    controller: Arc<SessionController>,
    trust: Arc<TrustRegistry>,
    config: EngineConfig,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn AaaStore>,
        projector: Arc<Projector>,
        directory: Arc<dyn TenantDirectory>,
        ingestor: Arc<AccountingIngestor>,
        controller: Arc<SessionController>,
        trust: Arc<TrustRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            projector,
            directory,
            ingestor,
            controller,
            trust,
            config,
        }
    }

    /// One full reconciliation pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();

        // Drain the retry queue first so the drift comparison below sees
        // fresh rows instead of re-repairing what was merely queued.
        let flush = self.projector.flush_queued().await;
        report.retried_projections = flush.applied;
        for (tenant_id, username) in flush.dropped {
            self.directory
                .record_status(
                    tenant_id,
                    &username,
                    ProjectionStatus::Failed {
                        reason: "retry budget exhausted".to_string(),
                    },
                )
                .await;
        }

        let subscribers = self.directory.subscribers().await;
        let mut desired: HashSet<String> = HashSet::with_capacity(subscribers.len());

        for subscriber in &subscribers {
            desired.insert(subscriber.username.clone());
            let Some(policy) = self
                .directory
                .policy(subscriber.tenant_id, &subscriber.policy)
                .await
            else {
                warn!(
                    username = %subscriber.username,
                    policy = %subscriber.policy,
                    "Subscriber references unknown policy, skipped"
                );
                continue;
            };

            report.checked += 1;
            match self.drifted(subscriber).await {
                Ok(false) => {}
                Ok(true) => match self.projector.reproject(subscriber, &policy).await {
                    Ok(_) => {
                        report.repaired += 1;
                        self.directory
                            .record_status(
                                subscriber.tenant_id,
                                &subscriber.username,
                                ProjectionStatus::Synced,
                            )
                            .await;
                    }
                    Err(err) => {
                        warn!(username = %subscriber.username, %err, "Drift repair failed");
                    }
                },
                Err(err) => {
                    warn!(username = %subscriber.username, %err, "Drift check failed");
                }
            }
        }

        // Projections whose subscriber is gone. The grace period tolerates
        // a directory read racing a just-created subscriber.
        let grace = Duration::seconds(self.config.orphan_grace_secs as i64);
        for username in self.store.projected_usernames().await? {
            if desired.contains(&username) {
                continue;
            }
            let Some(meta) = self.store.projection_meta(&username).await? else {
                continue;
            };
            if now - meta.projected_at >= grace {
                self.projector.withdraw(&username).await?;
                report.withdrawn += 1;
            }
        }

        // Wall-clock-expired accounts: the projected Expiration attribute
        // rejects the next authentication, but an already-open session
        // needs a push to end.
        for subscriber in &subscribers {
            let expired = subscriber.expires_at.map(|t| t <= now).unwrap_or(false);
            if !expired {
                continue;
            }
            for session in self.ingestor.open_sessions_for(&subscriber.username) {
                if let Some(nas) = resolve_control_target(
                    self.directory.as_ref(),
                    self.store.as_ref(),
                    session.nas_address,
                )
                .await
                {
                    if self
                        .controller
                        .disconnect(&nas, &subscriber.username, Some(session.session_id))
                        .await
                    {
                        report.expired_disconnects += 1;
                    }
                }
            }
        }

        report.expired_certificates = self.trust.expire_due(now);
        report.reattributed_events = self.ingestor.requeue_quarantined().await?;

        info!(
            checked = report.checked,
            repaired = report.repaired,
            withdrawn = report.withdrawn,
            expired = report.expired_certificates,
            reattributed = report.reattributed_events,
            retried = report.retried_projections,
            expired_disconnects = report.expired_disconnects,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Compare a subscriber's desired rows against what the store holds.
    async fn drifted(&self, subscriber: &Subscriber) -> Result<bool, EngineError> {
        let Some(policy) = self
            .directory
            .policy(subscriber.tenant_id, &subscriber.policy)
            .await
        else {
            return Ok(false);
        };
        let resolved = resolve(subscriber, &policy)?;

        if self
            .store
            .projection_meta(&subscriber.username)
            .await?
            .is_none()
        {
            return Ok(true);
        }

        let checks = self.store.checks_for(&subscriber.username).await?;
        if checks.len() != resolved.checks.len() {
            return Ok(true);
        }
        for triple in &resolved.checks {
            if !checks.iter().any(|row| {
                row.attribute == triple.name
                    && row.op == triple.op.as_str()
                    && row.value == triple.value
            }) {
                return Ok(true);
            }
        }

        let replies = self.store.replies_for(&subscriber.username).await?;
        if replies.len() != resolved.replies.len() {
            return Ok(true);
        }
        for triple in &resolved.replies {
            if !replies.iter().any(|row| {
                row.attribute == triple.name
                    && row.op == triple.op.as_str()
                    && row.value == triple.value
            }) {
                return Ok(true);
            }
        }

        match self.store.group_for(&subscriber.username).await? {
            Some(row) if row.groupname == resolved.group => Ok(false),
            _ => Ok(true),
        }
    }

    /// Periodic sweep loop.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep(Utc::now()).await {
                warn!(%err, "Sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryDirectory;
    use async_trait::async_trait;
    use radbridge_coa::{CoaError, ControlChannel, ControlReply, ControlRequest};
    use radbridge_common::{BandwidthPolicy, ControlSettings, RetrySettings};
    use radbridge_store::MemoryStore;
    use uuid::Uuid;

    struct AckChannel;

    #[async_trait]
    impl ControlChannel for AckChannel {
        async fn send(
            &self,
            _request: &ControlRequest,
            _secret: &str,
            _port: u16,
        ) -> Result<ControlReply, CoaError> {
            Ok(ControlReply::Ack)
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        projector: Arc<Projector>,
        directory: Arc<MemoryDirectory>,
        ingestor: Arc<AccountingIngestor>,
        sweeper: Sweeper,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let projector = Arc::new(Projector::new(store.clone(), RetrySettings::default()));
        let directory = Arc::new(MemoryDirectory::new());
        let ingestor = Arc::new(AccountingIngestor::new(store.clone()));
        let controller = Arc::new(SessionController::new(
            Arc::new(AckChannel),
            ControlSettings::default(),
        ));
        let trust = Arc::new(TrustRegistry::new("10.8.0.0/24").unwrap());
        let sweeper = Sweeper::new(
            store.clone(),
            projector.clone(),
            directory.clone(),
            ingestor.clone(),
            controller,
            trust,
            EngineConfig::default(),
        );
        Fixture {
            store,
            projector,
            directory,
            ingestor,
            sweeper,
        }
    }

    fn seed(fixture: &Fixture) -> Subscriber {
        let tenant = Uuid::new_v4();
        let subscriber = Subscriber::new(tenant, "alice", "pw", "basic");
        let policy = BandwidthPolicy::new(tenant, "basic", 10_000, 5_000);
        fixture.directory.upsert_subscriber(subscriber.clone());
        fixture.directory.upsert_policy(policy);
        subscriber
    }

    #[tokio::test]
    async fn test_sweep_repairs_edited_rows() {
        let f = fixture();
        let subscriber = seed(&f);
        let policy = f
            .directory
            .policy(subscriber.tenant_id, "basic")
            .await
            .unwrap();
        f.projector.project(&subscriber, &policy).await.unwrap();

        // Someone edits the credential behind the engine's back.
        f.store.corrupt_check("alice", "Cleartext-Password", "hacked");

        let report = f.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.repaired, 1);

        let checks = f.store.checks_for("alice").await.unwrap();
        assert!(checks.iter().any(|r| r.value == "pw"));
    }

    #[tokio::test]
    async fn test_sweep_leaves_converged_rows_alone() {
        let f = fixture();
        let subscriber = seed(&f);
        let policy = f
            .directory
            .policy(subscriber.tenant_id, "basic")
            .await
            .unwrap();
        f.projector.project(&subscriber, &policy).await.unwrap();

        let report = f.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.repaired, 0);
        assert_eq!(report.withdrawn, 0);
    }

    #[tokio::test]
    async fn test_sweep_projects_missing_subscriber() {
        let f = fixture();
        seed(&f);

        let report = f.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.repaired, 1);
        assert!(f.store.group_for("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_orphan_withdrawn_only_past_grace() {
        let f = fixture();
        let subscriber = seed(&f);
        let policy = f
            .directory
            .policy(subscriber.tenant_id, "basic")
            .await
            .unwrap();
        f.projector.project(&subscriber, &policy).await.unwrap();
        f.directory.remove_subscriber(subscriber.tenant_id, "alice");

        // Inside the grace window the rows stay.
        let report = f.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.withdrawn, 0);
        assert!(f.store.group_for("alice").await.unwrap().is_some());

        // Past the grace window they go.
        let later = Utc::now() + Duration::seconds(1_000);
        let report = f.sweeper.sweep(later).await.unwrap();
        assert_eq!(report.withdrawn, 1);
        assert!(f.store.group_for("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_flushes_retry_queue() {
        let f = fixture();
        let subscriber = seed(&f);
        let policy = f
            .directory
            .policy(subscriber.tenant_id, "basic")
            .await
            .unwrap();

        f.store.set_available(false);
        f.projector.project(&subscriber, &policy).await.unwrap();
        f.store.set_available(true);

        let report = f.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.retried_projections, 1);
        assert_eq!(f.projector.queued(), 0);
    }

    #[tokio::test]
    async fn test_expired_subscriber_sessions_disconnected() {
        let f = fixture();
        let mut subscriber = seed(&f);
        subscriber.expires_at = Some(Utc::now() - Duration::hours(1));
        f.directory.upsert_subscriber(subscriber.clone());

        let nas_address: std::net::IpAddr = "192.0.2.1".parse().unwrap();
        f.store
            .upsert_nas(radbridge_store::NasRow {
                address: nas_address,
                shortname: "router-1".to_string(),
                kind: "mikrotik".to_string(),
                secret: "s3cret".to_string(),
                tenant_id: subscriber.tenant_id,
            })
            .await
            .unwrap();
        f.directory.upsert_nas(radbridge_common::NasDevice::new(
            subscriber.tenant_id,
            "router-1",
            nas_address,
            "s3cret",
            radbridge_common::NasKind::Mikrotik,
        ));
        f.ingestor
            .ingest(radbridge_store::AccountingEvent {
                session_id: "sess-1".to_string(),
                username: "alice".to_string(),
                nas_address,
                kind: radbridge_store::AccountingEventKind::Start,
                timestamp: Utc::now(),
                input_octets: 0,
                output_octets: 0,
                terminate_cause: None,
            })
            .await
            .unwrap();

        let report = f.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.expired_disconnects, 1);
    }

    #[tokio::test]
    async fn test_sweep_reattributes_quarantine() {
        let f = fixture();
        let subscriber = seed(&f);
        let event = radbridge_store::AccountingEvent {
            session_id: "sess-1".to_string(),
            username: "alice".to_string(),
            nas_address: "192.0.2.1".parse().unwrap(),
            kind: radbridge_store::AccountingEventKind::Start,
            timestamp: Utc::now(),
            input_octets: 0,
            output_octets: 0,
            terminate_cause: None,
        };
        f.ingestor.ingest(event).await.unwrap();
        assert_eq!(f.ingestor.quarantined(), 1);

        f.store
            .upsert_nas(radbridge_store::NasRow {
                address: "192.0.2.1".parse().unwrap(),
                shortname: "router-1".to_string(),
                kind: "mikrotik".to_string(),
                secret: "s3cret".to_string(),
                tenant_id: subscriber.tenant_id,
            })
            .await
            .unwrap();

        let report = f.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.reattributed_events, 1);
        assert_eq!(f.ingestor.quarantined(), 0);
    }
}
