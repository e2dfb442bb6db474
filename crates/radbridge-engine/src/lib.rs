//! Synchronization and session-control engine
//!
//! Ties the pieces together: tenant records come in through the change
//! feed, the projector writes them into the shared AAA store, the session
//! controller pushes live updates to NAS devices, the accounting ingestor
//! re-attributes usage events to tenants, and the sweeper reconciles
//! whatever drifted in between.

pub mod accounting;
pub mod control;
pub mod feed;
pub mod ops;
pub mod projector;
pub mod sweeper;

pub use accounting::{AccountingIngestor, IngestOutcome, SessionUsage};
pub use control::{ActionReport, SessionController};
pub use feed::{ChangeEvent, MemoryDirectory, TenantDirectory};
pub use ops::{Engine, HealthSnapshot};
pub use projector::{FlushStats, ProjectOutcome, Projector};
pub use sweeper::{SweepReport, Sweeper};

use radbridge_coa::CoaError;
use radbridge_policy::PolicyError;
use radbridge_store::StoreError;
use radbridge_trust::TrustError;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Control(#[from] CoaError),

    #[error("subscriber not found: {0}")]
    UnknownSubscriber(String),

    #[error("policy not found: {0}")]
    UnknownPolicy(String),

    #[error("NAS not registered: {0}")]
    UnknownNas(IpAddr),
}
