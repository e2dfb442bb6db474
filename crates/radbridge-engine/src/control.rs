//! Session controller
//!
//! Pushes live session changes to NAS devices over the control channel.
//! Delivery is best-effort with a bounded attempt budget: the store is the
//! source of truth and the next authorization converges regardless, so a
//! dead NAS must never block a state change. Every attempt lands in a
//! bounded action-report history for operators.

use crate::feed::TenantDirectory;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use radbridge_coa::{ControlAction, ControlChannel, ControlReply, ControlRequest};
use radbridge_common::{ControlSettings, NasDevice, NasKind};
use radbridge_store::{AaaStore, NasRow};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const REPORT_HISTORY: usize = 256;

/// Outcome of one control dispatch, kept for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub username: String,
    pub nas_address: IpAddr,
    pub action: ControlAction,
    pub delivered: bool,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct SessionController {
    channel: Arc<dyn ControlChannel>,
    settings: ControlSettings,
    reports: Mutex<VecDeque<ActionReport>>,
}

impl SessionController {
    pub fn new(channel: Arc<dyn ControlChannel>, settings: ControlSettings) -> Self {
        Self {
            channel,
            settings,
            reports: Mutex::new(VecDeque::new()),
        }
    }

    /// Kick a session off the NAS. Returns whether the NAS acknowledged.
    pub async fn disconnect(
        &self,
        nas: &NasDevice,
        username: &str,
        session_id: Option<String>,
    ) -> bool {
        let request = ControlRequest {
            action: ControlAction::Disconnect,
            username: username.to_string(),
            session_id,
            nas_address: nas.address,
            rate_limit: None,
            session_timeout: None,
        };
        self.deliver(nas, request).await
    }

    /// Apply a new rate limit to a live session. Devices that don't honor
    /// attribute updates get a disconnect instead; re-authentication then
    /// picks up the new attributes from the store.
    pub async fn push_plan_change(
        &self,
        nas: &NasDevice,
        username: &str,
        session_id: Option<String>,
        rate_limit: String,
        session_timeout: Option<u32>,
    ) -> bool {
        if !nas.supports_coa {
            debug!(nas = %nas.address, username, "NAS lacks CoA support, disconnecting instead");
            return self.disconnect(nas, username, session_id).await;
        }

        let request = ControlRequest {
            action: ControlAction::ChangeAuthorization,
            username: username.to_string(),
            session_id: session_id.clone(),
            nas_address: nas.address,
            rate_limit: Some(rate_limit),
            session_timeout,
        };
        if self.deliver(nas, request).await {
            return true;
        }

        // A NAK or exhausted attempts falls back to disconnect so the
        // session can't keep running on the old plan.
        self.disconnect(nas, username, session_id).await
    }

    async fn deliver(&self, nas: &NasDevice, request: ControlRequest) -> bool {
        let mut last_error = String::new();
        for attempt in 1..=self.settings.max_attempts {
            let wait = self.settings.delay_for_attempt(attempt);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            match self
                .channel
                .send(&request, &nas.secret, self.settings.port)
                .await
            {
                Ok(ControlReply::Ack) => {
                    self.record(&request, true, None);
                    return true;
                }
                Ok(ControlReply::Nak) => {
                    // Refusal is final; retrying the same request is noise.
                    warn!(nas = %nas.address, username = %request.username, "NAS refused control request");
                    self.record(&request, false, Some("refused by NAS".to_string()));
                    return false;
                }
                Err(err) => {
                    warn!(
                        nas = %nas.address,
                        username = %request.username,
                        attempt,
                        %err,
                        "Control request attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
        }
        self.record(&request, false, Some(last_error));
        false
    }

    fn record(&self, request: &ControlRequest, delivered: bool, detail: Option<String>) {
        let mut reports = self.reports.lock();
        if reports.len() >= REPORT_HISTORY {
            reports.pop_front();
        }
        reports.push_back(ActionReport {
            username: request.username.clone(),
            nas_address: request.nas_address,
            action: request.action,
            delivered,
            detail,
            at: Utc::now(),
        });
    }

    /// Recent dispatch history, oldest first.
    pub fn reports(&self) -> Vec<ActionReport> {
        self.reports.lock().iter().cloned().collect()
    }
}

/// Find the device behind a session's NAS address. Tunnel-provisioned
/// devices account from their pool address, which only the store row is
/// registered under; the directory lists them at their declared address.
pub(crate) async fn resolve_control_target(
    directory: &dyn TenantDirectory,
    store: &dyn AaaStore,
    address: IpAddr,
) -> Option<NasDevice> {
    if let Some(device) = directory.nas_device(address).await {
        return Some(device);
    }
    match store.nas_by_address(address).await {
        Ok(row) => row.as_ref().map(device_from_row),
        Err(err) => {
            warn!(%address, %err, "NAS lookup for control dispatch failed");
            None
        }
    }
}

/// Rebuild a dispatch handle from a store NAS row. The row doesn't carry
/// the CoA capability flag, so the kind default applies.
fn device_from_row(row: &NasRow) -> NasDevice {
    let kind = match row.kind.as_str() {
        "mikrotik" => NasKind::Mikrotik,
        "cisco" => NasKind::Cisco,
        "ubiquiti" => NasKind::Ubiquiti,
        _ => NasKind::Other,
    };
    NasDevice::new(row.tenant_id, &row.shortname, row.address, &row.secret, kind)
}
