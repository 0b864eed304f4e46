// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Private IP allocation inside the enclave subnet.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::domain::config::Ipv4Subnet;

/// Hands out the lowest free host address of a subnet. The network address,
/// the gateway (first host) and the broadcast address are never issued.
#[derive(Debug)]
pub struct FreeIpAddrTracker {
    subnet: Ipv4Subnet,
    taken: BTreeSet<Ipv4Addr>,
}

impl FreeIpAddrTracker {
    pub fn new(subnet: Ipv4Subnet) -> Self {
        Self {
            subnet,
            taken: BTreeSet::new(),
        }
    }

    pub fn subnet(&self) -> Ipv4Subnet {
        self.subnet
    }

    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        let first = u32::from(self.subnet.network).checked_add(2)?;
        let last = u32::from(self.subnet.broadcast()).checked_sub(1)?;
        let address = (first..=last)
            .map(Ipv4Addr::from)
            .find(|candidate| !self.taken.contains(candidate))?;
        self.taken.insert(address);
        Some(address)
    }

    /// Returns an address to the pool; releasing a free address is a no-op.
    pub fn release(&mut self, address: Ipv4Addr) -> bool {
        self.taken.remove(&address)
    }

    pub fn in_use(&self) -> usize {
        self.taken.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_reserved_addresses() {
        let mut tracker = FreeIpAddrTracker::new(Ipv4Subnet::parse("10.1.0.0/30").unwrap());
        // 10.1.0.0 network, .1 gateway, .3 broadcast
        assert_eq!(tracker.allocate(), Some(Ipv4Addr::new(10, 1, 0, 2)));
        assert_eq!(tracker.allocate(), None);
    }

    #[test]
    fn test_released_address_is_reused() {
        let mut tracker = FreeIpAddrTracker::new(Ipv4Subnet::parse("172.23.0.0/16").unwrap());
        let a = tracker.allocate().unwrap();
        let b = tracker.allocate().unwrap();
        assert_eq!(b, Ipv4Addr::new(172, 23, 0, 3));

        assert!(tracker.release(a));
        assert!(!tracker.release(a));
        assert_eq!(tracker.allocate(), Some(a));
        assert_eq!(tracker.in_use(), 2);
    }
}
