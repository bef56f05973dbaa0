//! Address range planning
//!
//! Given the prefix this host governs and its own address, work out which
//! addresses may be leased to clients.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Error type for range planning
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    /// Too small to exclude network, broadcast and host and keep a client address
    #[error("prefix {0} is too small to lease addresses from")]
    InvalidPrefix(Ipv4Network),

    #[error("host address {host} is outside {prefix}")]
    HostOutsidePrefix { host: Ipv4Addr, prefix: Ipv4Network },

    /// Network and broadcast addresses cannot be taken by a host
    #[error("host address {host} is the network or broadcast address of {prefix}")]
    HostNotAssignable { host: Ipv4Addr, prefix: Ipv4Network },
}

/// Inclusive range of client-assignable addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
    /// Host address inside `first..=last`, never handed out
    pub reserved: Option<Ipv4Addr>,
}

impl AddressRange {
    /// Whether `ip` may be leased
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.first <= ip && ip <= self.last && self.reserved != Some(ip)
    }

    /// Number of leasable addresses
    pub fn len(&self) -> u32 {
        let span = u32::from(self.last) - u32::from(self.first) + 1;
        span - u32::from(self.reserved.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plan the client range of `prefix` for a host at `host`
pub fn plan_range(prefix: Ipv4Network, host: Ipv4Addr) -> Result<AddressRange, RangeError> {
    let size = 1u64 << (32 - u32::from(prefix.prefix()));
    if size < 4 {
        return Err(RangeError::InvalidPrefix(prefix));
    }
    if !prefix.contains(host) {
        return Err(RangeError::HostOutsidePrefix { host, prefix });
    }
    if host == prefix.network() || host == prefix.broadcast() {
        return Err(RangeError::HostNotAssignable { host, prefix });
    }

    let network = u32::from(prefix.network());
    let broadcast = u32::from(prefix.broadcast());
    let host_bits = u32::from(host);

    let mut first = network + 1;
    if first == host_bits {
        first += 1;
    }
    let mut last = broadcast - 1;
    if last == host_bits {
        last -= 1;
    }
    if first > last {
        return Err(RangeError::InvalidPrefix(prefix));
    }

    let reserved = (first < host_bits && host_bits < last).then_some(host);
    Ok(AddressRange {
        first: Ipv4Addr::from(first),
        last: Ipv4Addr::from(last),
        reserved,
    })
}
