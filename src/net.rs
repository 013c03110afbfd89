//! Network lease pool.
//!
//! Each VM that wants networking borrows a lease: a tap device name, a
//! deterministic MAC, and a /30-style host/guest address pair derived from
//! the lease slot. The tap devices themselves are provisioned by host setup;
//! this pool only hands out and reclaims the slots. Leases are RAII guards
//! so every exit path, including boot failure, releases the slot.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// A single network assignment, derived entirely from its slot number.
#[derive(Debug, Clone)]
pub struct NetworkLease {
    pub slot: u32,
    pub tap_device: String,
    pub guest_mac: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
}

impl NetworkLease {
    fn from_slot(slot: u32) -> Self {
        let octet = (slot & 0xff) as u8;
        Self {
            slot,
            tap_device: format!("tap-burrow{}", slot),
            guest_mac: format!("06:00:ac:10:{:02x}:02", octet),
            host_ip: Ipv4Addr::new(172, 16, octet, 1),
            guest_ip: Ipv4Addr::new(172, 16, octet, 2),
        }
    }
}

/// Fixed-size pool of lease slots. Slots are reused in LIFO order.
pub struct NetworkLeasePool {
    free: Mutex<Vec<u32>>,
    capacity: usize,
}

impl NetworkLeasePool {
    /// Create a pool with `capacity` slots. Capacity is clamped to 250 so
    /// the derived addresses stay inside 172.16.0.0/16.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.min(250);
        let free = (0..capacity as u32).rev().collect();
        Arc::new(Self {
            free: Mutex::new(free),
            capacity,
        })
    }

    /// Borrow a lease. `None` means the pool is exhausted.
    pub fn acquire(self: &Arc<Self>) -> Option<LeaseGuard> {
        let slot = self.free.lock().unwrap().pop()?;
        Some(LeaseGuard {
            pool: Arc::clone(self),
            lease: NetworkLease::from_slot(slot),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    fn release(&self, slot: u32) {
        self.free.lock().unwrap().push(slot);
    }
}

/// Exclusive ownership of one lease; the slot returns to the pool on drop.
pub struct LeaseGuard {
    pool: Arc<NetworkLeasePool>,
    lease: NetworkLease,
}

impl LeaseGuard {
    pub fn lease(&self) -> &NetworkLease {
        &self.lease
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.pool.release(self.lease.slot);
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("slot", &self.lease.slot)
            .field("tap_device", &self.lease.tap_device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_release() {
        let pool = NetworkLeasePool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_ne!(a.lease().slot, b.lease().slot);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn lease_fields_derive_from_slot() {
        let pool = NetworkLeasePool::new(1);
        let guard = pool.acquire().unwrap();
        let lease = guard.lease();
        assert_eq!(lease.slot, 0);
        assert_eq!(lease.tap_device, "tap-burrow0");
        assert_eq!(lease.host_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(lease.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
    }

    #[test]
    fn capacity_is_clamped() {
        let pool = NetworkLeasePool::new(10_000);
        assert_eq!(pool.capacity(), 250);
    }
}
