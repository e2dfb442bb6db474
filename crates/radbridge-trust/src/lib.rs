//! Identity/Trust Registry
//!
//! Owns the certificate authority that lets a shared tunnel concentrator
//! authenticate many independent remote devices, and the deterministic
//! address pool that maps each device to a stable tunnel address. The
//! concentrator consults the revocation list before every handshake, so a
//! revocation is complete only once it is on the list.

pub mod authority;
pub mod pool;

pub use authority::{
    CertificateAuthority, CertificateState, CrlEntry, IdentityCertificate, TrustRegistry,
};
pub use pool::AddressPool;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrustError {
    #[error("no certificate authority configured")]
    NoAuthority,

    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("certificate is revoked: {0}")]
    Revoked(String),

    #[error("certificate is expired: {0}")]
    Expired(String),

    /// A certificate must never be deleted while its NAS row still exists.
    #[error("certificate still referenced by device: {0}")]
    CertificateInUse(String),

    #[error("invalid pool CIDR: {0}")]
    InvalidCidr(String),

    #[error("tunnel address pool exhausted ({assigned} addresses assigned)")]
    PoolExhausted { assigned: usize },
}
