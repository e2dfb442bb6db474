//! Shared AAA store
//!
//! Row model for the flat credential/reply/group/NAS/accounting tables the
//! AAA server reads, plus the `AaaStore` seam the engine writes through.
//! Every row carries a `tenant_id` tag the AAA server itself ignores; the
//! tag exists purely so accounting and reconciliation can disambiguate
//! owners later.

pub mod memory;
pub mod rows;
pub mod store;

pub use memory::MemoryStore;
pub use rows::{
    AccountingEvent, AccountingEventKind, CheckRow, GroupReplyRow, NasRow, ProjectionMeta,
    ReplyRow, UserGroupRow,
};
pub use store::{AaaStore, StoreError, StoreResult};
