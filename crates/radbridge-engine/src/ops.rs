//! Engine facade
//!
//! Wires the projector, session controller, trust registry, accounting
//! ingestor and sweeper together behind one handle, consumes the tenant
//! change feed, and exposes the operator surface (resync, forced sweep,
//! health counts).

use crate::accounting::{AccountingIngestor, IngestOutcome};
use crate::control::{resolve_control_target, SessionController};
use crate::feed::{ChangeEvent, TenantDirectory};
use crate::projector::{ProjectOutcome, Projector};
use crate::sweeper::{SweepReport, Sweeper};
use crate::EngineError;
use chrono::Utc;
use radbridge_coa::ControlChannel;
use radbridge_common::{EngineConfig, NasDevice, NasKind, ProjectionStatus, Subscriber, TenantId};
use radbridge_store::{AaaStore, AccountingEvent, NasRow};
use radbridge_trust::{IdentityCertificate, TrustRegistry};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const AUTHORITY_NAME: &str = "radbridge";

/// Operator-facing counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub projected_usernames: usize,
    pub queued_projections: usize,
    pub quarantined_events: usize,
    pub orphan_stops: usize,
    pub open_sessions: usize,
    pub connected_devices: usize,
    pub revoked_certificates: usize,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn AaaStore>,
    directory: Arc<dyn TenantDirectory>,
    projector: Arc<Projector>,
    controller: Arc<SessionController>,
    ingestor: Arc<AccountingIngestor>,
    trust: Arc<TrustRegistry>,
    sweeper: Arc<Sweeper>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn AaaStore>,
        directory: Arc<dyn TenantDirectory>,
        channel: Arc<dyn ControlChannel>,
    ) -> Result<Self, EngineError> {
        let projector = Arc::new(Projector::new(store.clone(), config.retry.clone()));
        let controller = Arc::new(SessionController::new(channel, config.control.clone()));
        let ingestor = Arc::new(AccountingIngestor::new(store.clone()));
        let trust = Arc::new(TrustRegistry::new(&config.tunnel_pool_cidr)?);
        trust.ensure_authority(AUTHORITY_NAME);

        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            projector.clone(),
            directory.clone(),
            ingestor.clone(),
            controller.clone(),
            trust.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            store,
            directory,
            projector,
            controller,
            ingestor,
            trust,
            sweeper,
        })
    }

    pub fn projector(&self) -> &Arc<Projector> {
        &self.projector
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn ingestor(&self) -> &Arc<AccountingIngestor> {
        &self.ingestor
    }

    pub fn trust(&self) -> &Arc<TrustRegistry> {
        &self.trust
    }

    /// React to one tenant-side mutation.
    pub async fn handle_event(&self, event: ChangeEvent) -> Result<(), EngineError> {
        match event {
            ChangeEvent::SubscriberUpserted {
                tenant_id,
                username,
            } => {
                // Events carry keys; re-read so a stale event can't regress.
                let Some(subscriber) = self.directory.subscriber(tenant_id, &username).await
                else {
                    return Ok(());
                };
                let outcome = self.project_subscriber(&subscriber).await?;
                // Suspension is store-first: only after the rows reject
                // re-authentication do we kick live sessions.
                if outcome == ProjectOutcome::Applied && subscriber.is_disabled() {
                    self.disconnect_sessions(&subscriber).await;
                }
            }
            ChangeEvent::SubscriberRemoved {
                tenant_id,
                username,
            } => {
                // Only the owner may tear down the projection.
                if self.store.owner_of(&username).await? == Some(tenant_id) {
                    self.projector.withdraw(&username).await?;
                    for session in self.ingestor.open_sessions_for(&username) {
                        if let Some(nas) = self.control_target(session.nas_address).await {
                            self.controller
                                .disconnect(&nas, &username, Some(session.session_id))
                                .await;
                        }
                    }
                }
            }
            ChangeEvent::PolicyChanged { tenant_id, name } => {
                let Some(policy) = self.directory.policy(tenant_id, &name).await else {
                    return Ok(());
                };
                self.projector.materialize_groups(&policy).await?;

                // Members re-resolve (their reply rows embed the rate), and
                // live sessions get the new rate pushed.
                let rate = radbridge_policy::rate_limit_string(&policy);
                for subscriber in self.directory.subscribers_on_policy(tenant_id, &name).await {
                    if let Err(err) = self.projector.reproject(&subscriber, &policy).await {
                        warn!(username = %subscriber.username, %err, "Member reprojection failed");
                        continue;
                    }
                    for session in self.ingestor.open_sessions_for(&subscriber.username) {
                        if let Some(nas) = self.control_target(session.nas_address).await {
                            self.controller
                                .push_plan_change(
                                    &nas,
                                    &subscriber.username,
                                    Some(session.session_id),
                                    rate.clone(),
                                    policy.session_timeout_secs,
                                )
                                .await;
                        }
                    }
                }
            }
            ChangeEvent::NasUpserted { tenant_id, address } => {
                let Some(device) = self.directory.nas_device(address).await else {
                    return Ok(());
                };
                if device.tenant_id != tenant_id {
                    return Ok(());
                }
                self.store.upsert_nas(nas_row(&device)).await?;
            }
            ChangeEvent::NasRemoved { address } => {
                self.store.remove_nas(address).await?;
            }
        }
        Ok(())
    }

    /// Project one subscriber and write its status back to the tenant side.
    pub async fn project_subscriber(
        &self,
        subscriber: &Subscriber,
    ) -> Result<ProjectOutcome, EngineError> {
        let Some(policy) = self
            .directory
            .policy(subscriber.tenant_id, &subscriber.policy)
            .await
        else {
            self.record_status(
                subscriber,
                ProjectionStatus::Failed {
                    reason: format!("unknown policy {}", subscriber.policy),
                },
            )
            .await;
            return Err(EngineError::UnknownPolicy(subscriber.policy.clone()));
        };

        match self.projector.project(subscriber, &policy).await {
            Ok(outcome) => {
                let status = match &outcome {
                    ProjectOutcome::Applied | ProjectOutcome::Stale { .. } => {
                        ProjectionStatus::Synced
                    }
                    ProjectOutcome::Queued => ProjectionStatus::Pending {
                        reason: "store unavailable".to_string(),
                    },
                };
                self.record_status(subscriber, status).await;
                Ok(outcome)
            }
            Err(err) => {
                self.record_status(
                    subscriber,
                    ProjectionStatus::Failed {
                        reason: err.to_string(),
                    },
                )
                .await;
                Err(err)
            }
        }
    }

    /// Operator resync: rewrite the rows even if the version matches.
    pub async fn reproject(
        &self,
        tenant_id: TenantId,
        username: &str,
    ) -> Result<ProjectOutcome, EngineError> {
        let subscriber = self
            .directory
            .subscriber(tenant_id, username)
            .await
            .ok_or_else(|| EngineError::UnknownSubscriber(username.to_string()))?;
        let policy = self
            .directory
            .policy(tenant_id, &subscriber.policy)
            .await
            .ok_or_else(|| EngineError::UnknownPolicy(subscriber.policy.clone()))?;

        let outcome = self.projector.reproject(&subscriber, &policy).await?;
        self.record_status(&subscriber, ProjectionStatus::Synced)
            .await;
        Ok(outcome)
    }

    /// Register a tunnel-managed NAS: issue its identity certificate, pin
    /// its deterministic tunnel address and publish the AAA row at that
    /// address. Re-provisioning rotates the certificate and keeps the
    /// address.
    pub async fn provision_tunnel(
        &self,
        device: &NasDevice,
    ) -> Result<(IdentityCertificate, Ipv4Addr), EngineError> {
        let certificate = self.trust.issue(device.id, &device.name, None)?;
        let address = self.trust.tunnel_address(device.id)?;

        let mut row = nas_row(device);
        row.address = IpAddr::V4(address);
        self.store.upsert_nas(row).await?;

        info!(
            device = %device.name,
            %address,
            serial = %certificate.serial,
            "Tunnel NAS provisioned"
        );
        Ok((certificate, address))
    }

    /// Remove a NAS: revoke its certificate if one is live, drop its row.
    pub async fn decommission_nas(&self, address: IpAddr) -> Result<(), EngineError> {
        if let Some(device) = self.directory.nas_device(address).await {
            if let Some(certificate) = self.trust.active_certificate_for(device.id) {
                self.trust.revoke(&certificate.serial, "decommissioned")?;
            }
        }
        self.store.remove_nas(address).await?;
        Ok(())
    }

    pub async fn ingest_accounting(
        &self,
        event: AccountingEvent,
    ) -> Result<IngestOutcome, EngineError> {
        self.ingestor.ingest(event).await
    }

    /// Run a reconciliation pass immediately.
    pub async fn force_sweep(&self) -> Result<SweepReport, EngineError> {
        self.sweeper.sweep(Utc::now()).await
    }

    pub async fn health(&self) -> Result<HealthSnapshot, EngineError> {
        Ok(HealthSnapshot {
            projected_usernames: self.store.projected_usernames().await?.len(),
            queued_projections: self.projector.queued(),
            quarantined_events: self.ingestor.quarantined(),
            orphan_stops: self.ingestor.orphan_stops(),
            open_sessions: self.ingestor.open_session_count(),
            connected_devices: self.trust.connected().len(),
            revoked_certificates: self.trust.revoked_count(),
        })
    }

    /// Consume the change feed until the sender closes; spawns the sweep
    /// and retry workers alongside.
    pub async fn run(self: Arc<Self>, mut feed: mpsc::Receiver<ChangeEvent>) {
        info!(
            sweep_interval = self.config.sweep_interval_secs,
            pool = %self.config.tunnel_pool_cidr,
            "Engine started"
        );
        tokio::spawn(self.sweeper.clone().run());
        tokio::spawn(self.projector.clone().run_retry_worker());

        while let Some(event) = feed.recv().await {
            if let Err(err) = self.handle_event(event).await {
                warn!(%err, "Change event handling failed");
            }
        }
        info!("Change feed closed, engine stopping");
    }

    async fn record_status(&self, subscriber: &Subscriber, status: ProjectionStatus) {
        self.directory
            .record_status(subscriber.tenant_id, &subscriber.username, status)
            .await;
    }

    async fn disconnect_sessions(&self, subscriber: &Subscriber) {
        for session in self.ingestor.open_sessions_for(&subscriber.username) {
            if let Some(nas) = self.control_target(session.nas_address).await {
                self.controller
                    .disconnect(&nas, &subscriber.username, Some(session.session_id))
                    .await;
            }
        }
    }

    /// Sessions carry the address the NAS accounts from, which for
    /// tunnel-provisioned devices is the pool address only the store row
    /// knows; the directory alone would miss those.
    async fn control_target(&self, address: IpAddr) -> Option<NasDevice> {
        resolve_control_target(self.directory.as_ref(), self.store.as_ref(), address).await
    }
}

fn nas_row(device: &NasDevice) -> NasRow {
    NasRow {
        address: device.address,
        shortname: device.name.clone(),
        kind: kind_str(device.kind).to_string(),
        secret: device.secret.clone(),
        tenant_id: device.tenant_id,
    }
}

fn kind_str(kind: NasKind) -> &'static str {
    match kind {
        NasKind::Mikrotik => "mikrotik",
        NasKind::Cisco => "cisco",
        NasKind::Ubiquiti => "ubiquiti",
        NasKind::Other => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::feed::MemoryDirectory;
    use radbridge_coa::{CoaError, ControlReply, ControlRequest};
    use radbridge_common::{BandwidthPolicy, SubscriberState};
    use radbridge_store::{AccountingEventKind, MemoryStore};
    use uuid::Uuid;

    /// Channel that never reaches the NAS.
    struct DeadChannel;

    #[async_trait]
    impl ControlChannel for DeadChannel {
        async fn send(
            &self,
            _request: &ControlRequest,
            _secret: &str,
            _port: u16,
        ) -> Result<ControlReply, CoaError> {
            Err(CoaError::Timeout)
        }
    }

    fn engine() -> (Engine, Arc<MemoryStore>, Arc<MemoryDirectory>) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let engine = Engine::new(
            EngineConfig::default(),
            store.clone(),
            directory.clone(),
            Arc::new(DeadChannel),
        )
        .unwrap();
        (engine, store, directory)
    }

    fn seed(directory: &MemoryDirectory) -> Subscriber {
        let tenant = Uuid::new_v4();
        let subscriber = Subscriber::new(tenant, "alice", "pw", "basic");
        directory.upsert_subscriber(subscriber.clone());
        directory.upsert_policy(BandwidthPolicy::new(tenant, "basic", 10_000, 5_000));
        subscriber
    }

    #[tokio::test]
    async fn test_upsert_event_projects_and_reports_synced() {
        let (engine, store, directory) = engine();
        let subscriber = seed(&directory);

        engine
            .handle_event(ChangeEvent::SubscriberUpserted {
                tenant_id: subscriber.tenant_id,
                username: "alice".to_string(),
            })
            .await
            .unwrap();

        assert!(store.group_for("alice").await.unwrap().is_some());
        assert_eq!(
            directory.status(subscriber.tenant_id, "alice").await,
            Some(ProjectionStatus::Synced)
        );
    }

    #[tokio::test]
    async fn test_suspend_lands_in_store_despite_dead_control_channel() {
        let (engine, store, directory) = engine();
        let mut subscriber = seed(&directory);

        engine.project_subscriber(&subscriber).await.unwrap();

        subscriber.state = SubscriberState::Suspended;
        subscriber.source_version += 1;
        directory.upsert_subscriber(subscriber.clone());
        engine
            .handle_event(ChangeEvent::SubscriberUpserted {
                tenant_id: subscriber.tenant_id,
                username: "alice".to_string(),
            })
            .await
            .unwrap();

        // The reject marker is in place even though no disconnect got through.
        let checks = store.checks_for("alice").await.unwrap();
        assert!(checks
            .iter()
            .any(|r| r.attribute == "Auth-Type" && r.value == "Reject"));
    }

    #[tokio::test]
    async fn test_removal_event_only_honored_for_owner() {
        let (engine, store, directory) = engine();
        let subscriber = seed(&directory);
        engine.project_subscriber(&subscriber).await.unwrap();

        // A different tenant cannot tear the projection down.
        engine
            .handle_event(ChangeEvent::SubscriberRemoved {
                tenant_id: Uuid::new_v4(),
                username: "alice".to_string(),
            })
            .await
            .unwrap();
        assert!(store.group_for("alice").await.unwrap().is_some());

        engine
            .handle_event(ChangeEvent::SubscriberRemoved {
                tenant_id: subscriber.tenant_id,
                username: "alice".to_string(),
            })
            .await
            .unwrap();
        assert!(store.group_for("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nas_events_sync_registry_rows() {
        let (engine, store, directory) = engine();
        let tenant = Uuid::new_v4();
        let address: IpAddr = "192.0.2.1".parse().unwrap();
        let device = NasDevice::new(tenant, "router-1", address, "s3cret", NasKind::Mikrotik);
        directory.upsert_nas(device);

        engine
            .handle_event(ChangeEvent::NasUpserted {
                tenant_id: tenant,
                address,
            })
            .await
            .unwrap();
        let row = store.nas_by_address(address).await.unwrap().unwrap();
        assert_eq!(row.kind, "mikrotik");
        assert_eq!(row.tenant_id, tenant);

        engine
            .handle_event(ChangeEvent::NasRemoved { address })
            .await
            .unwrap();
        assert!(store.nas_by_address(address).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provision_tunnel_assigns_and_keeps_address() {
        let (engine, store, _directory) = engine();
        let tenant = Uuid::new_v4();
        let device = NasDevice::new(
            tenant,
            "router-1",
            "203.0.113.7".parse().unwrap(),
            "s3cret",
            NasKind::Mikrotik,
        );

        let (first_cert, address) = engine.provision_tunnel(&device).await.unwrap();
        assert!(store
            .nas_by_address(IpAddr::V4(address))
            .await
            .unwrap()
            .is_some());

        // Rotation: new serial, same address, old certificate revoked.
        let (second_cert, rotated) = engine.provision_tunnel(&device).await.unwrap();
        assert_ne!(first_cert.serial, second_cert.serial);
        assert_eq!(address, rotated);
        assert!(engine.trust().is_revoked(&first_cert.serial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_targets_tunnel_provisioned_nas() {
        let (engine, _store, directory) = engine();
        let mut subscriber = seed(&directory);
        engine.project_subscriber(&subscriber).await.unwrap();

        // The directory lists the device at its declared address; the
        // session accounts from the assigned tunnel address.
        let device = NasDevice::new(
            subscriber.tenant_id,
            "router-1",
            "203.0.113.7".parse().unwrap(),
            "s3cret",
            NasKind::Mikrotik,
        );
        directory.upsert_nas(device.clone());
        let (_cert, tunnel_address) = engine.provision_tunnel(&device).await.unwrap();

        engine
            .ingest_accounting(AccountingEvent {
                session_id: "sess-1".to_string(),
                username: "alice".to_string(),
                nas_address: IpAddr::V4(tunnel_address),
                kind: AccountingEventKind::Start,
                timestamp: Utc::now(),
                input_octets: 0,
                output_octets: 0,
                terminate_cause: None,
            })
            .await
            .unwrap();

        subscriber.state = SubscriberState::Suspended;
        subscriber.source_version += 1;
        directory.upsert_subscriber(subscriber.clone());
        engine
            .handle_event(ChangeEvent::SubscriberUpserted {
                tenant_id: subscriber.tenant_id,
                username: "alice".to_string(),
            })
            .await
            .unwrap();

        // The disconnect was dispatched at the tunnel address.
        let reports = engine.controller().reports();
        assert!(reports
            .iter()
            .any(|r| r.nas_address == IpAddr::V4(tunnel_address)));
    }

    #[tokio::test]
    async fn test_health_counts() {
        let (engine, store, directory) = engine();
        let subscriber = seed(&directory);
        engine.project_subscriber(&subscriber).await.unwrap();

        store.set_available(false);
        let mut bumped = subscriber.clone();
        bumped.source_version += 1;
        engine.project_subscriber(&bumped).await.unwrap();
        store.set_available(true);

        let health = engine.health().await.unwrap();
        assert_eq!(health.projected_usernames, 1);
        assert_eq!(health.queued_projections, 1);
        assert_eq!(health.open_sessions, 0);
    }
}
