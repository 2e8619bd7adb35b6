//! DHCPv6 address pool.
//!
//! Hands out addresses from `[start, start+size)` in the low-64-bit
//! host space, one per (client-id, interface-id) pair. Reservations
//! are idempotent until released or expired; a FIFO of expirations is
//! drained by a periodic sweeper.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hasher;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// An address bound to one network interface of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAssociation {
    pub address: Ipv6Addr,
    pub client_id: Vec<u8>,
    pub interface_id: Vec<u8>,
    pub created_at: SystemTime,
}

/// Pool exhaustion. Reservations made for earlier interface-ids in
/// the same call are kept and returned so the reply can still carry
/// them.
#[derive(Error, Debug)]
#[error("no more free ip addresses are currently available in the pool")]
pub struct PoolExhausted {
    pub allocated: Vec<IdentityAssociation>,
}

struct PoolState {
    /// (client-id, interface-id) hash → association.
    associations: HashMap<u64, IdentityAssociation>,
    /// Low 64 bits of every address currently handed out. Every
    /// entry belongs to exactly one association and vice versa.
    used_ips: HashSet<u64>,
    expirations: VecDeque<(SystemTime, u64, u64)>, // (deadline, assoc hash, ip key)
}

pub struct RandomAddressPool {
    start: u128,
    size: u64,
    valid_lifetime: u32,
    state: Mutex<PoolState>,
}

impl RandomAddressPool {
    pub fn new(start: Ipv6Addr, size: u64, valid_lifetime: u32) -> Self {
        Self {
            start: u128::from(start),
            size,
            valid_lifetime,
            state: Mutex::new(PoolState {
                associations: HashMap::new(),
                used_ips: HashSet::new(),
                expirations: VecDeque::new(),
            }),
        }
    }

    pub fn valid_lifetime(&self) -> u32 {
        self.valid_lifetime
    }

    /// Reserve one address per interface-id. Repeated calls for the
    /// same (client, interface) return the existing association.
    pub fn reserve_addresses(
        &self,
        client_id: &[u8],
        interface_ids: &[Vec<u8>],
    ) -> Result<Vec<IdentityAssociation>, PoolExhausted> {
        self.reserve_at(SystemTime::now(), client_id, interface_ids)
    }

    fn reserve_at(
        &self,
        now: SystemTime,
        client_id: &[u8],
        interface_ids: &[Vec<u8>],
    ) -> Result<Vec<IdentityAssociation>, PoolExhausted> {
        let mut state = self.state.lock().expect("address pool poisoned");
        let mut ret = Vec::with_capacity(interface_ids.len());
        let mut rng = rand::thread_rng();

        for interface_id in interface_ids {
            let key = association_key(client_id, interface_id);
            if let Some(existing) = state.associations.get(&key) {
                ret.push(existing.clone());
                continue;
            }
            if state.used_ips.len() as u64 == self.size {
                return Err(PoolExhausted { allocated: ret });
            }

            // Addresses keep the net/subnet bits of the start address
            // and draw the host offset from the low 64 bits.
            let (address, ip_key) = loop {
                let offset = rng.gen_range(0..self.size);
                let candidate = self.start + u128::from(offset);
                let ip_key = candidate as u64;
                if !state.used_ips.contains(&ip_key) {
                    break (Ipv6Addr::from(candidate), ip_key);
                }
            };

            let association = IdentityAssociation {
                address,
                client_id: client_id.to_vec(),
                interface_id: interface_id.clone(),
                created_at: now,
            };
            state.associations.insert(key, association.clone());
            state.used_ips.insert(ip_key);
            state
                .expirations
                .push_back((now + Duration::from_secs(self.valid_lifetime as u64), key, ip_key));
            ret.push(association);
        }

        Ok(ret)
    }

    pub fn release_addresses(&self, client_id: &[u8], interface_ids: &[Vec<u8>]) {
        let mut state = self.state.lock().expect("address pool poisoned");
        for interface_id in interface_ids {
            let key = association_key(client_id, interface_id);
            if let Some(association) = state.associations.remove(&key) {
                state.used_ips.remove(&(u128::from(association.address) as u64));
            }
        }
    }

    /// Drop expired associations: the expiration queue is FIFO, so
    /// scanning stops at the first entry still in the future.
    pub fn expire_associations(&self, now: SystemTime) {
        let mut state = self.state.lock().expect("address pool poisoned");
        while let Some(&(deadline, key, ip_key)) = state.expirations.front() {
            if now < deadline {
                break;
            }
            state.expirations.pop_front();
            // Release + reallocation may have repopulated the slot;
            // only reap when the association is the expired one.
            let stale = state
                .associations
                .get(&key)
                .map(|a| u128::from(a.address) as u64 == ip_key)
                .unwrap_or(false);
            if stale {
                state.associations.remove(&key);
                state.used_ips.remove(&ip_key);
                debug!("expired identity association {key:x}");
            }
        }
    }

    /// Run the expiration sweeper every 10 seconds until `running`
    /// clears.
    pub fn start_sweeper(self: &Arc<Self>, running: Arc<AtomicBool>) {
        let pool = self.clone();
        std::thread::Builder::new()
            .name("pool-sweeper".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_secs(10));
                    pool.expire_associations(SystemTime::now());
                }
            })
            .expect("spawning pool sweeper");
    }

    #[cfg(test)]
    fn state_invariants_hold(&self) -> bool {
        let state = self.state.lock().unwrap();
        let from_assocs: HashSet<u64> = state
            .associations
            .values()
            .map(|a| u128::from(a.address) as u64)
            .collect();
        from_assocs == state.used_ips && from_assocs.len() == state.associations.len()
    }
}

fn association_key(client_id: &[u8], interface_id: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write(client_id);
    h.write(interface_id);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: u64) -> RandomAddressPool {
        RandomAddressPool::new("2001:db8::1".parse().unwrap(), size, 60)
    }

    fn ids(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![0, 0, 0, i]).collect()
    }

    #[test]
    fn reservation_is_idempotent() {
        let p = pool(16);
        let first = p.reserve_addresses(b"client", &ids(1)).unwrap();
        let second = p.reserve_addresses(b"client", &ids(1)).unwrap();
        assert_eq!(first, second);
        assert!(p.state_invariants_hold());
    }

    #[test]
    fn different_interfaces_get_different_addresses() {
        let p = pool(16);
        let got = p.reserve_addresses(b"client", &ids(2)).unwrap();
        assert_eq!(got.len(), 2);
        assert_ne!(got[0].address, got[1].address);
        assert!(p.state_invariants_hold());
    }

    #[test]
    fn addresses_stay_in_range() {
        let p = RandomAddressPool::new("2001:db8::10".parse().unwrap(), 4, 60);
        let got = p.reserve_addresses(b"c", &ids(4)).unwrap();
        let lo = u128::from("2001:db8::10".parse::<Ipv6Addr>().unwrap());
        for ia in got {
            let v = u128::from(ia.address);
            assert!(v >= lo && v < lo + 4, "{} out of range", ia.address);
        }
    }

    #[test]
    fn exhaustion_returns_partial_allocations() {
        let p = pool(1);
        let err = p.reserve_addresses(b"client", &ids(2)).unwrap_err();
        assert_eq!(err.allocated.len(), 1);
        assert!(p.state_invariants_hold());
    }

    #[test]
    fn exhaustion_across_clients() {
        let p = pool(1);
        p.reserve_addresses(b"one", &ids(1)).unwrap();
        let err = p.reserve_addresses(b"two", &ids(1)).unwrap_err();
        assert!(err.allocated.is_empty());
    }

    #[test]
    fn release_frees_the_address() {
        let p = pool(1);
        p.reserve_addresses(b"one", &ids(1)).unwrap();
        p.release_addresses(b"one", &ids(1));
        assert!(p.state_invariants_hold());
        // The slot is free again for someone else.
        assert!(p.reserve_addresses(b"two", &ids(1)).is_ok());
    }

    #[test]
    fn release_unknown_is_a_noop() {
        let p = pool(4);
        p.release_addresses(b"ghost", &ids(1));
        assert!(p.state_invariants_hold());
    }

    #[test]
    fn expiration_reaps_old_associations() {
        let p = pool(1);
        p.reserve_addresses(b"one", &ids(1)).unwrap();

        p.expire_associations(SystemTime::now() + Duration::from_secs(61));
        assert!(p.state_invariants_hold());
        assert!(p.reserve_addresses(b"two", &ids(1)).is_ok());
    }

    #[test]
    fn expiration_leaves_fresh_associations() {
        let p = pool(2);
        let got = p.reserve_addresses(b"one", &ids(1)).unwrap();

        p.expire_associations(SystemTime::now());
        let again = p.reserve_addresses(b"one", &ids(1)).unwrap();
        assert_eq!(got, again);
    }

    #[test]
    fn expiration_ignores_reallocated_slots() {
        let p = pool(1);
        let t0 = SystemTime::now();
        p.reserve_at(t0, b"one", &ids(1)).unwrap();
        p.release_addresses(b"one", &ids(1));
        // Client two picks up the same slot well after client one's
        // deadline would have fired.
        let t1 = t0 + Duration::from_secs(120);
        let kept = p.reserve_at(t1, b"two", &ids(1)).unwrap();

        // Sweeping past client one's deadline but before client
        // two's must leave the reallocated address alone.
        p.expire_associations(t0 + Duration::from_secs(61));
        let still = p.reserve_at(t1, b"two", &ids(1)).unwrap();
        assert_eq!(kept, still);
        assert!(p.state_invariants_hold());
    }
}
