//! Flat table rows mirrored from the AAA server's SQL schema

use chrono::{DateTime, Utc};
use radbridge_common::TenantId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Check (authorization) attribute row.
///
/// The credential (`Cleartext-Password`) row is the anchor of a projection:
/// it is written first and carries the owning tenant tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRow {
    pub username: String,
    pub attribute: String,
    pub op: String,
    pub value: String,
    pub tenant_id: TenantId,
}

/// Reply attribute row returned to the NAS on successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRow {
    pub username: String,
    pub attribute: String,
    pub op: String,
    pub value: String,
    pub tenant_id: TenantId,
}

/// User to policy-group membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupRow {
    pub username: String,
    pub groupname: String,
    pub priority: i32,
    pub tenant_id: TenantId,
}

/// Group-level reply attribute row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReplyRow {
    pub groupname: String,
    pub attribute: String,
    pub op: String,
    pub value: String,
    pub tenant_id: TenantId,
}

/// NAS registry row. `address` is the AAA server's sole authorization key
/// for devices, so it must be unique across all tenants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NasRow {
    pub address: IpAddr,
    pub shortname: String,
    pub kind: String,
    pub secret: String,
    pub tenant_id: TenantId,
}

/// Projection bookkeeping per username: owner and last applied version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionMeta {
    pub tenant_id: TenantId,
    pub source_version: u64,
    pub projected_at: DateTime<Utc>,
}

/// Accounting event as emitted by the flat store's accounting table.
///
/// The AAA server has no tenant concept, so events arrive unattributed;
/// the ingestor resolves the tenant from the NAS address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingEvent {
    /// Opaque, NAS-chosen session id
    pub session_id: String,
    pub username: String,
    pub nas_address: IpAddr,
    pub kind: AccountingEventKind,
    pub timestamp: DateTime<Utc>,
    /// Cumulative octets as reported by the NAS counter
    pub input_octets: u64,
    pub output_octets: u64,
    pub terminate_cause: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountingEventKind {
    Start,
    InterimUpdate,
    Stop,
}
