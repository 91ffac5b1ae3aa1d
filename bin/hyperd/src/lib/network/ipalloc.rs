// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequential IPv4 allocation within one subnet.
//!
//! Addresses are handed out round-robin starting after the most recently
//! allocated one, so a released address is not reused until the rest of
//! the range has been tried. The network and broadcast addresses are never
//! allocated, and the first host address belongs to the bridge.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use super::NetworkError;

#[derive(Debug)]
pub struct IpAllocator {
    begin: u32,
    end: u32,
    prefix_len: u8,
    last: u32,
    allocated: BTreeSet<u32>,
}

impl IpAllocator {
    /// Creates an allocator for `cidr` (`a.b.c.d/n`).
    pub fn new(cidr: &str) -> Result<Self, NetworkError> {
        let bad = || NetworkError::BadSubnet(cidr.to_string());
        let (addr, prefix) = cidr.split_once('/').ok_or_else(bad)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| bad())?;
        if !(1..=30).contains(&prefix_len) {
            return Err(bad());
        }
        let mask = u32::MAX << (32 - prefix_len);
        let network = u32::from(addr) & mask;
        let broadcast = network | !mask;

        let gateway = network + 1;
        let mut allocated = BTreeSet::new();
        allocated.insert(gateway);
        Ok(Self {
            begin: gateway + 1,
            end: broadcast - 1,
            prefix_len,
            last: gateway,
            allocated,
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.begin - 1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::MAX << (32 - self.prefix_len))
    }

    /// Allocates `requested`, or the next free address when `None`.
    pub fn request(
        &mut self,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, NetworkError> {
        match requested {
            Some(ip) => {
                self.check(ip)?;
                if !self.allocated.insert(u32::from(ip)) {
                    return Err(NetworkError::AlreadyAllocated(ip));
                }
                Ok(ip)
            }
            None => self.next(),
        }
    }

    fn check(&self, ip: Ipv4Addr) -> Result<(), NetworkError> {
        let pos = u32::from(ip);
        if pos < self.begin || pos > self.end {
            return Err(NetworkError::OutOfRange(ip));
        }
        Ok(())
    }

    fn next(&mut self) -> Result<Ipv4Addr, NetworkError> {
        let size = self.end - self.begin + 1;
        let mut pos = self.last;
        for _ in 0..size {
            pos = if pos >= self.end { self.begin } else { pos + 1 };
            if self.allocated.insert(pos) {
                self.last = pos;
                return Ok(Ipv4Addr::from(pos));
            }
        }
        Err(NetworkError::Exhausted)
    }

    /// Marks an address as in use without failing if it already is; used
    /// when reattaching to VMs that hold addresses from a previous run.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> Result<(), NetworkError> {
        self.check(ip)?;
        self.allocated.insert(u32::from(ip));
        Ok(())
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        if ip != self.gateway() {
            self.allocated.remove(&u32::from(ip));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocates_after_gateway() {
        let mut ips = IpAllocator::new("192.168.123.0/24").unwrap();
        assert_eq!(ips.gateway(), Ipv4Addr::new(192, 168, 123, 1));
        assert_eq!(ips.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(ips.request(None).unwrap(), Ipv4Addr::new(192, 168, 123, 2));
        assert_eq!(ips.request(None).unwrap(), Ipv4Addr::new(192, 168, 123, 3));
    }

    #[test]
    fn requested_addresses() {
        let mut ips = IpAllocator::new("10.0.0.0/29").unwrap();
        let five = Ipv4Addr::new(10, 0, 0, 5);
        assert_eq!(ips.request(Some(five)).unwrap(), five);
        assert!(matches!(
            ips.request(Some(five)),
            Err(NetworkError::AlreadyAllocated(_))
        ));
        assert!(matches!(
            ips.request(Some(Ipv4Addr::new(10, 0, 0, 7))),
            Err(NetworkError::OutOfRange(_))
        ));
        assert!(matches!(
            ips.request(Some(Ipv4Addr::new(10, 0, 0, 1))),
            Err(NetworkError::OutOfRange(_))
        ));
    }

    #[test]
    fn exhaustion_and_reuse() {
        // .2 through .6 are allocatable.
        let mut ips = IpAllocator::new("10.0.0.0/29").unwrap();
        let got: Vec<Ipv4Addr> =
            (0..5).map(|_| ips.request(None).unwrap()).collect();
        assert_eq!(got.last(), Some(&Ipv4Addr::new(10, 0, 0, 6)));
        assert!(matches!(ips.request(None), Err(NetworkError::Exhausted)));

        ips.release(Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(ips.request(None).unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn bad_subnets() {
        for cidr in ["10.0.0.0", "10.0.0.0/31", "10.0.0/24", "10.0.0.0/x"] {
            assert!(IpAllocator::new(cidr).is_err(), "{}", cidr);
        }
    }

    proptest! {
        #[test]
        fn allocations_stay_distinct_and_in_range(
            ops in proptest::collection::vec(any::<Option<u8>>(), 1..200)
        ) {
            let mut ips = IpAllocator::new("172.16.4.0/26").unwrap();
            let mut held: Vec<Ipv4Addr> = Vec::new();
            for op in ops {
                match op {
                    // Release one of the held addresses.
                    Some(i) if !held.is_empty() => {
                        let ip = held.remove(i as usize % held.len());
                        ips.release(ip);
                    }
                    _ => match ips.request(None) {
                        Ok(ip) => {
                            prop_assert!(!held.contains(&ip));
                            let last = ip.octets()[3];
                            prop_assert!((2..=62).contains(&last));
                            held.push(ip);
                        }
                        Err(NetworkError::Exhausted) => {
                            prop_assert_eq!(held.len(), 61)
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    },
                }
            }
        }
    }
}
