//! Accounting ingestor
//!
//! The shared store's accounting table has no tenant column; events arrive
//! keyed by NAS address and username only. The ingestor resolves the owning
//! tenant through the NAS registry, tracks per-session usage from the NAS's
//! cumulative counters, and rolls usage up per tenant. Events whose NAS is
//! unknown go to a quarantine the sweeper re-attributes once the NAS row
//! shows up.

use crate::EngineError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use radbridge_common::TenantId;
use radbridge_store::{AaaStore, AccountingEvent, AccountingEventKind};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where an event ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Recorded { tenant_id: TenantId },
    /// NAS unknown; parked for later re-attribution
    Quarantined,
}

/// Live (or recently closed) session usage derived from NAS counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUsage {
    pub session_id: String,
    pub username: String,
    pub tenant_id: TenantId,
    pub nas_address: IpAddr,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Accumulated usage; monotone even across NAS counter resets
    pub input_octets: u64,
    pub output_octets: u64,
    pub closed: bool,
    pub terminate_cause: Option<String>,
    /// Adopted from a stop/interim without a matching start
    pub orphan: bool,
    /// Last raw counter samples, for delta computation
    last_input: u64,
    last_output: u64,
}

impl SessionUsage {
    fn open(event: &AccountingEvent, tenant_id: TenantId) -> Self {
        Self {
            session_id: event.session_id.clone(),
            username: event.username.clone(),
            tenant_id,
            nas_address: event.nas_address,
            started_at: event.timestamp,
            last_seen: event.timestamp,
            input_octets: 0,
            output_octets: 0,
            closed: false,
            terminate_cause: None,
            orphan: false,
            last_input: 0,
            last_output: 0,
        }
    }
}

/// Session identity. The id is opaque and NAS-chosen, so two devices can
/// pick the same one; only the pair is unique.
type SessionKey = (String, String);

fn session_key(event: &AccountingEvent) -> SessionKey {
    (event.username.clone(), event.session_id.clone())
}

#[derive(Debug, Default, Clone, Copy)]
struct TenantUsage {
    input_octets: u64,
    output_octets: u64,
}

pub struct AccountingIngestor {
    store: Arc<dyn AaaStore>,
    sessions: DashMap<SessionKey, SessionUsage>,
    totals: DashMap<TenantId, TenantUsage>,
    quarantine: Mutex<Vec<AccountingEvent>>,
    orphan_stops: AtomicUsize,
    /// High-water mark of processed event timestamps; restart resume point
    checkpoint: RwLock<Option<DateTime<Utc>>>,
}

impl AccountingIngestor {
    pub fn new(store: Arc<dyn AaaStore>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            totals: DashMap::new(),
            quarantine: Mutex::new(Vec::new()),
            orphan_stops: AtomicUsize::new(0),
            checkpoint: RwLock::new(None),
        }
    }

    /// Attribute and record one accounting event.
    pub async fn ingest(&self, event: AccountingEvent) -> Result<IngestOutcome, EngineError> {
        let Some(nas) = self.store.nas_by_address(event.nas_address).await? else {
            warn!(
                nas = %event.nas_address,
                session = %event.session_id,
                "Accounting event from unregistered NAS, quarantined"
            );
            self.quarantine.lock().push(event);
            return Ok(IngestOutcome::Quarantined);
        };
        let tenant_id = nas.tenant_id;

        self.advance_checkpoint(event.timestamp);

        match event.kind {
            AccountingEventKind::Start => {
                debug!(session = %event.session_id, username = %event.username, "Session start");
                // A duplicate start for an open session merges mutable
                // fields; accumulated usage must survive it.
                let key = session_key(&event);
                let merged = if let Some(mut entry) = self.sessions.get_mut(&key) {
                    if !entry.closed {
                        entry.nas_address = event.nas_address;
                        entry.last_seen = event.timestamp;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };
                if !merged {
                    self.sessions.insert(key, SessionUsage::open(&event, tenant_id));
                }
            }
            AccountingEventKind::InterimUpdate | AccountingEventKind::Stop => {
                let mut entry = self
                    .sessions
                    .entry(session_key(&event))
                    // A stop or interim for a session whose start we missed
                    // (engine restart, lost packet) is adopted with the
                    // event's full counters as its usage, flagged for audit.
                    .or_insert_with(|| {
                        let mut usage = SessionUsage::open(&event, tenant_id);
                        usage.orphan = true;
                        usage
                    });
                let was_closed = entry.closed;
                self.apply_counters(&mut entry, &event);
                if event.kind == AccountingEventKind::Stop {
                    entry.closed = true;
                    entry.terminate_cause = event.terminate_cause.clone();
                    if entry.orphan && !was_closed {
                        self.orphan_stops.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            session = %event.session_id,
                            username = %event.username,
                            "Stop without a matching start, adopted as orphan"
                        );
                    }
                    debug!(
                        session = %event.session_id,
                        input = entry.input_octets,
                        output = entry.output_octets,
                        "Session stop"
                    );
                }
            }
        }

        Ok(IngestOutcome::Recorded { tenant_id })
    }

    /// Fold a counter sample into the session and tenant totals. NAS
    /// counters are cumulative; a sample below the previous one means the
    /// device rebooted and restarted counting, so the sample becomes a
    /// fresh baseline. Totals never decrease.
    fn apply_counters(&self, session: &mut SessionUsage, event: &AccountingEvent) {
        let input_delta = if event.input_octets >= session.last_input {
            event.input_octets - session.last_input
        } else {
            event.input_octets
        };
        let output_delta = if event.output_octets >= session.last_output {
            event.output_octets - session.last_output
        } else {
            event.output_octets
        };

        session.input_octets += input_delta;
        session.output_octets += output_delta;
        session.last_input = event.input_octets;
        session.last_output = event.output_octets;
        session.last_seen = event.timestamp;

        let mut totals = self.totals.entry(session.tenant_id).or_default();
        totals.input_octets += input_delta;
        totals.output_octets += output_delta;
    }

    /// Retry every quarantined event; still-unattributable ones go back.
    /// Returns how many got attributed this pass.
    pub async fn requeue_quarantined(&self) -> Result<usize, EngineError> {
        let parked: Vec<AccountingEvent> = std::mem::take(&mut *self.quarantine.lock());
        let mut recorded = 0;
        let mut pending = parked.into_iter();
        while let Some(event) = pending.next() {
            match self.ingest(event.clone()).await {
                Ok(IngestOutcome::Recorded { .. }) => recorded += 1,
                Ok(IngestOutcome::Quarantined) => {}
                Err(err) => {
                    // A store outage mid-pass must not lose events: park
                    // the failed one and the untried tail again.
                    let mut quarantine = self.quarantine.lock();
                    quarantine.push(event);
                    quarantine.extend(pending);
                    return Err(err);
                }
            }
        }
        Ok(recorded)
    }

    pub fn session(&self, username: &str, session_id: &str) -> Option<SessionUsage> {
        self.sessions
            .get(&(username.to_string(), session_id.to_string()))
            .map(|e| e.value().clone())
    }

    /// Open sessions for a username, for control-message targeting.
    pub fn open_sessions_for(&self, username: &str) -> Vec<SessionUsage> {
        self.sessions
            .iter()
            .filter(|e| e.username == username && !e.closed)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.iter().filter(|e| !e.closed).count()
    }

    /// Cumulative (input, output) octets attributed to a tenant.
    pub fn tenant_usage(&self, tenant_id: TenantId) -> (u64, u64) {
        self.totals
            .get(&tenant_id)
            .map(|t| (t.input_octets, t.output_octets))
            .unwrap_or((0, 0))
    }

    pub fn quarantined(&self) -> usize {
        self.quarantine.lock().len()
    }

    /// Stops adopted without a matching start since startup.
    pub fn orphan_stops(&self) -> usize {
        self.orphan_stops.load(Ordering::Relaxed)
    }

    /// Where ingestion should resume after a restart: the newest processed
    /// event timestamp, or nothing if no event was ever processed.
    pub fn resume_from(&self) -> Option<DateTime<Utc>> {
        *self.checkpoint.read()
    }

    fn advance_checkpoint(&self, timestamp: DateTime<Utc>) {
        let mut checkpoint = self.checkpoint.write();
        if checkpoint.map(|c| timestamp > c).unwrap_or(true) {
            *checkpoint = Some(timestamp);
        }
    }
}
