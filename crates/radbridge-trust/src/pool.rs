//! Deterministic tunnel address pool
//!
//! Addresses are assigned from a single pool shared across all tenants,
//! driven by a monotonic sequence counter, so two tenant-owned devices can
//! never collide. An assignment is stable for the life of the device:
//! re-issuing a certificate reuses the recorded slot.

use crate::TrustError;
use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Shared tunnel address pool
pub struct AddressPool {
    network: Ipv4Network,
    /// Next unassigned slot; slot 0 is the network address, slot 1 the
    /// concentrator itself, the last slot the broadcast address.
    next_slot: AtomicU32,
    assignments: DashMap<Uuid, Ipv4Addr>,
    by_address: DashMap<Ipv4Addr, Uuid>,
}

impl AddressPool {
    pub fn new(cidr: &str) -> Result<Self, TrustError> {
        let network: Ipv4Network = cidr
            .parse()
            .map_err(|_| TrustError::InvalidCidr(cidr.to_string()))?;
        Ok(Self {
            network,
            next_slot: AtomicU32::new(2),
            assignments: DashMap::new(),
            by_address: DashMap::new(),
        })
    }

    /// Assign (or return the existing) address for a device.
    pub fn assign(&self, device_id: Uuid) -> Result<Ipv4Addr, TrustError> {
        if let Some(existing) = self.assignments.get(&device_id) {
            return Ok(*existing);
        }

        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        // Last usable slot is size - 2; size - 1 is broadcast.
        if u64::from(slot) >= u64::from(self.network.size()) - 1 {
            return Err(TrustError::PoolExhausted {
                assigned: self.assignments.len(),
            });
        }

        let address = self
            .network
            .nth(slot)
            .ok_or(TrustError::PoolExhausted {
                assigned: self.assignments.len(),
            })?;

        self.assignments.insert(device_id, address);
        self.by_address.insert(address, device_id);
        Ok(address)
    }

    /// Look up a device's assigned address without assigning one.
    pub fn address_of(&self, device_id: Uuid) -> Option<Ipv4Addr> {
        self.assignments.get(&device_id).map(|addr| *addr)
    }

    /// Release a device's slot. The slot number is not recycled, so the
    /// sequence counter stays monotonic.
    pub fn release(&self, device_id: Uuid) -> bool {
        if let Some((_, address)) = self.assignments.remove(&device_id) {
            self.by_address.remove(&address);
            true
        } else {
            false
        }
    }

    pub fn assigned_count(&self) -> usize {
        self.assignments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_slots() {
        let pool = AddressPool::new("10.8.0.0/24").unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        // Slot 0 is the network, slot 1 the concentrator.
        assert_eq!(pool.assign(a).unwrap(), "10.8.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(pool.assign(b).unwrap(), "10.8.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_assignment_is_stable() {
        let pool = AddressPool::new("10.8.0.0/24").unwrap();
        let device = Uuid::new_v4();

        let first = pool.assign(device).unwrap();
        let again = pool.assign(device).unwrap();
        assert_eq!(first, again);
        assert_eq!(pool.assigned_count(), 1);
    }

    #[test]
    fn test_exhaustion() {
        // /30 holds exactly one usable slot after network + gateway + broadcast.
        let pool = AddressPool::new("10.8.0.0/30").unwrap();

        pool.assign(Uuid::new_v4()).unwrap();
        let err = pool.assign(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, TrustError::PoolExhausted { .. }));
    }

    #[test]
    fn test_release_does_not_recycle_slots() {
        let pool = AddressPool::new("10.8.0.0/24").unwrap();
        let a = Uuid::new_v4();

        let addr = pool.assign(a).unwrap();
        assert!(pool.release(a));

        // A new device gets the next slot, not the released one.
        let b = Uuid::new_v4();
        assert_ne!(pool.assign(b).unwrap(), addr);
    }

    #[test]
    fn test_invalid_cidr() {
        assert!(matches!(
            AddressPool::new("not-a-cidr"),
            Err(TrustError::InvalidCidr(_))
        ));
    }
}
