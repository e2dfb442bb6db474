//! Certificate authority and device certificate lifecycle
//!
//! State machine per certificate: `Issued -> Active` on the first
//! successful tunnel handshake, then `-> Revoked` (administrative) or
//! `-> Expired` (time-based). Revocation and expiry are terminal; the
//! device must re-register.

use crate::pool::AddressPool;
use crate::TrustError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// Root of trust for the tunnel concentrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub name: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Signing seed; opaque to everything but certificate issuance
    key_seed: String,
}

/// A signed per-device identity credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityCertificate {
    pub serial: String,
    pub common_name: String,
    pub device_id: Uuid,
    pub state: CertificateState,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
    /// Opaque signed body handed to the device
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateState {
    Issued,
    Active,
    Revoked,
    Expired,
}

/// Revocation list entry. The concentrator consults this list before every
/// handshake, so appending here is what makes a revocation effective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlEntry {
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
}

/// Trust registry: authority, issued certificates, revocation list and the
/// shared tunnel address pool.
pub struct TrustRegistry {
    authority: RwLock<Option<CertificateAuthority>>,
    /// Certificates by serial
    certificates: DashMap<String, IdentityCertificate>,
    /// Current (non-terminal) serial per device
    active_serial: DashMap<Uuid, String>,
    /// Append-only revocation list
    crl: RwLock<Vec<CrlEntry>>,
    /// Devices with a live tunnel, per the concentrator
    connected: DashMap<Uuid, Ipv4Addr>,
    pool: Arc<AddressPool>,
}

impl TrustRegistry {
    pub fn new(pool_cidr: &str) -> Result<Self, TrustError> {
        Ok(Self {
            authority: RwLock::new(None),
            certificates: DashMap::new(),
            active_serial: DashMap::new(),
            crl: RwLock::new(Vec::new()),
            connected: DashMap::new(),
            pool: Arc::new(AddressPool::new(pool_cidr)?),
        })
    }

    /// Get the existing authority or bootstrap a new one.
    pub fn ensure_authority(&self, name: &str) -> CertificateAuthority {
        let mut guard = self.authority.write();
        if let Some(authority) = guard.as_ref() {
            return authority.clone();
        }

        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let key_seed = hex::encode(seed);
        let fingerprint = hex::encode(Sha256::digest(key_seed.as_bytes()));

        let authority = CertificateAuthority {
            name: name.to_string(),
            fingerprint,
            created_at: Utc::now(),
            valid_until: Utc::now() + Duration::days(3650),
            key_seed,
        };
        tracing::info!(name, "Created certificate authority");
        *guard = Some(authority.clone());
        authority
    }

    /// Issue a certificate for a device. Re-issuing (rotation) revokes the
    /// previous certificate and preserves the device's tunnel address.
    pub fn issue(
        &self,
        device_id: Uuid,
        common_name: &str,
        validity_days: Option<i64>,
    ) -> Result<IdentityCertificate, TrustError> {
        let authority = self
            .authority
            .read()
            .clone()
            .ok_or(TrustError::NoAuthority)?;

        if let Some(previous) = self.active_serial.get(&device_id).map(|s| s.clone()) {
            self.revoke(&previous, "replaced by rotation")?;
        }

        // Address assignment happens at issue time and is stable thereafter.
        self.pool.assign(device_id)?;

        let issued_at = Utc::now();
        let mut entropy = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut entropy);

        let mut hasher = Sha256::new();
        hasher.update(authority.key_seed.as_bytes());
        hasher.update(common_name.as_bytes());
        hasher.update(device_id.as_bytes());
        hasher.update(entropy);
        let serial = hex::encode(&hasher.finalize()[..16]).to_uppercase();

        let mut body_hasher = Sha256::new();
        body_hasher.update(authority.key_seed.as_bytes());
        body_hasher.update(serial.as_bytes());
        let signature = hex::encode(body_hasher.finalize());

        let certificate = IdentityCertificate {
            serial: serial.clone(),
            common_name: common_name.to_string(),
            device_id,
            state: CertificateState::Issued,
            issued_at,
            expires_at: issued_at + Duration::days(validity_days.unwrap_or(DEFAULT_VALIDITY_DAYS)),
            activated_at: None,
            revoked_at: None,
            revoke_reason: None,
            body: format!(
                "-----BEGIN DEVICE CERTIFICATE-----\n{common_name}\n{serial}\n{signature}\n-----END DEVICE CERTIFICATE-----"
            ),
        };

        self.certificates.insert(serial.clone(), certificate.clone());
        self.active_serial.insert(device_id, serial.clone());
        tracing::info!(%device_id, serial, "Issued device certificate");
        Ok(certificate)
    }

    /// Record a successful tunnel handshake: validates against the CRL and
    /// expiry, activates a freshly issued certificate, and marks the device
    /// connected at its assigned address.
    pub fn handshake(&self, serial: &str) -> Result<Ipv4Addr, TrustError> {
        let mut certificate = self
            .certificates
            .get_mut(serial)
            .ok_or_else(|| TrustError::CertificateNotFound(serial.to_string()))?;

        if self.is_revoked(serial) || certificate.state == CertificateState::Revoked {
            return Err(TrustError::Revoked(serial.to_string()));
        }
        if certificate.state == CertificateState::Expired || certificate.expires_at <= Utc::now() {
            certificate.state = CertificateState::Expired;
            return Err(TrustError::Expired(serial.to_string()));
        }

        if certificate.state == CertificateState::Issued {
            certificate.state = CertificateState::Active;
            certificate.activated_at = Some(Utc::now());
        }

        let device_id = certificate.device_id;
        let address = self
            .pool
            .address_of(device_id)
            .ok_or_else(|| TrustError::CertificateNotFound(serial.to_string()))?;
        self.connected.insert(device_id, address);
        Ok(address)
    }

    /// Revoke a certificate. The CRL append happens before the state flips,
    /// so the concentrator can never accept a handshake in between.
    pub fn revoke(&self, serial: &str, reason: &str) -> Result<(), TrustError> {
        let mut certificate = self
            .certificates
            .get_mut(serial)
            .ok_or_else(|| TrustError::CertificateNotFound(serial.to_string()))?;

        if certificate.state == CertificateState::Revoked {
            return Ok(());
        }

        self.crl.write().push(CrlEntry {
            serial: serial.to_string(),
            revoked_at: Utc::now(),
            reason: reason.to_string(),
        });

        certificate.state = CertificateState::Revoked;
        certificate.revoked_at = Some(Utc::now());
        certificate.revoke_reason = Some(reason.to_string());

        let device_id = certificate.device_id;
        self.connected.remove(&device_id);
        if self
            .active_serial
            .get(&device_id)
            .map(|s| s.as_str() == serial)
            .unwrap_or(false)
        {
            self.active_serial.remove(&device_id);
        }

        tracing::warn!(serial, reason, "Revoked device certificate");
        Ok(())
    }

    /// Time-based expiry pass; returns how many certificates flipped.
    pub fn expire_due(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for mut entry in self.certificates.iter_mut() {
            if matches!(
                entry.state,
                CertificateState::Issued | CertificateState::Active
            ) && entry.expires_at <= now
            {
                entry.state = CertificateState::Expired;
                self.connected.remove(&entry.device_id);
                expired += 1;
            }
        }
        expired
    }

    /// Delete a terminal certificate record. Refused while a device still
    /// references it, to avoid a dangling trust reference.
    pub fn delete(&self, serial: &str, device_still_registered: bool) -> Result<(), TrustError> {
        if device_still_registered {
            return Err(TrustError::CertificateInUse(serial.to_string()));
        }
        self.certificates
            .remove(serial)
            .map(|_| ())
            .ok_or_else(|| TrustError::CertificateNotFound(serial.to_string()))
    }

    pub fn is_revoked(&self, serial: &str) -> bool {
        self.crl.read().iter().any(|entry| entry.serial == serial)
    }

    /// Snapshot of the revocation list for the concentrator.
    pub fn crl(&self) -> Vec<CrlEntry> {
        self.crl.read().clone()
    }

    pub fn certificate(&self, serial: &str) -> Option<IdentityCertificate> {
        self.certificates.get(serial).map(|c| c.clone())
    }

    pub fn active_certificate_for(&self, device_id: Uuid) -> Option<IdentityCertificate> {
        self.active_serial
            .get(&device_id)
            .and_then(|serial| self.certificates.get(serial.as_str()).map(|c| c.clone()))
    }

    /// The stable tunnel address for a device, assigned or recalled.
    pub fn tunnel_address(&self, device_id: Uuid) -> Result<Ipv4Addr, TrustError> {
        self.pool.assign(device_id)
    }

    /// Currently-connected devices, mirroring the concentrator query.
    pub fn connected(&self) -> Vec<(Uuid, Ipv4Addr)> {
        self.connected
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn revoked_count(&self) -> usize {
        self.crl.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TrustRegistry {
        let registry = TrustRegistry::new("10.8.0.0/24").unwrap();
        registry.ensure_authority("test-ca");
        registry
    }

    #[test]
    fn test_issue_then_handshake_activates() {
        let registry = registry();
        let device = Uuid::new_v4();

        let cert = registry.issue(device, "router-1", None).unwrap();
        assert_eq!(cert.state, CertificateState::Issued);

        let address = registry.handshake(&cert.serial).unwrap();
        assert_eq!(address, registry.tunnel_address(device).unwrap());

        let stored = registry.certificate(&cert.serial).unwrap();
        assert_eq!(stored.state, CertificateState::Active);
        assert_eq!(registry.connected().len(), 1);
    }

    #[test]
    fn test_revocation_hits_crl_before_handshake() {
        let registry = registry();
        let device = Uuid::new_v4();

        let cert = registry.issue(device, "router-1", None).unwrap();
        registry.revoke(&cert.serial, "compromised").unwrap();

        assert!(registry.is_revoked(&cert.serial));
        assert_eq!(
            registry.handshake(&cert.serial).unwrap_err(),
            TrustError::Revoked(cert.serial.clone())
        );
    }

    #[test]
    fn test_rotation_preserves_address() {
        let registry = registry();
        let device = Uuid::new_v4();

        let first = registry.issue(device, "router-1", None).unwrap();
        let address = registry.tunnel_address(device).unwrap();

        let second = registry.issue(device, "router-1", None).unwrap();
        assert_ne!(first.serial, second.serial);
        assert!(registry.is_revoked(&first.serial));
        assert_eq!(registry.tunnel_address(device).unwrap(), address);
    }

    #[test]
    fn test_expiry_is_terminal() {
        let registry = registry();
        let device = Uuid::new_v4();

        let cert = registry.issue(device, "router-1", Some(0)).unwrap();
        assert_eq!(registry.expire_due(Utc::now() + Duration::seconds(1)), 1);

        assert_eq!(
            registry.handshake(&cert.serial).unwrap_err(),
            TrustError::Expired(cert.serial.clone())
        );
    }

    #[test]
    fn test_delete_refused_while_device_registered() {
        let registry = registry();
        let device = Uuid::new_v4();

        let cert = registry.issue(device, "router-1", None).unwrap();
        registry.revoke(&cert.serial, "offboarding").unwrap();

        assert_eq!(
            registry.delete(&cert.serial, true).unwrap_err(),
            TrustError::CertificateInUse(cert.serial.clone())
        );
        assert!(registry.delete(&cert.serial, false).is_ok());
    }

    #[test]
    fn test_issue_without_authority() {
        let registry = TrustRegistry::new("10.8.0.0/24").unwrap();
        assert_eq!(
            registry.issue(Uuid::new_v4(), "router-1", None).unwrap_err(),
            TrustError::NoAuthority
        );
    }
}
