//! Network addresses recorded on machines.
//!
//! A machine carries two address lists: the one reported by the cloud
//! provider and the one discovered by the machine agent. Readers see a
//! single merged list built by [`merge_addresses`].

use std::{fmt, net::IpAddr};

use serde::{Deserialize, Serialize};

/// Address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    /// Dotted-quad IPv4 address.
    Ipv4,
    /// IPv6 address.
    Ipv6,
    /// DNS host name.
    Hostname,
}

/// Reachability scope of an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Not determined.
    #[default]
    Unknown,
    /// Reachable from the public internet.
    Public,
    /// Reachable only inside the cloud.
    CloudLocal,
    /// Loopback.
    MachineLocal,
    /// Link-local.
    LinkLocal,
}

/// One network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Textual address or host name.
    pub value: String,
    /// Family, derived from `value`.
    pub kind: AddressType,
    /// Name of the network the address belongs to, if known.
    pub network_name: String,
    /// Reachability scope.
    pub scope: Scope,
}

impl Address {
    /// Builds an address, deriving family and scope from the value.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let (kind, scope) = classify(&value);
        Self { value, kind, network_name: String::new(), scope }
    }

    /// Builds an address with an explicit scope.
    pub fn with_scope(value: impl Into<String>, scope: Scope) -> Self {
        Self { scope, ..Self::new(value) }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

fn classify(value: &str) -> (AddressType, Scope) {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            let scope = if ip.is_loopback() {
                Scope::MachineLocal
            } else if ip.is_link_local() {
                Scope::LinkLocal
            } else if ip.is_private() {
                Scope::CloudLocal
            } else {
                Scope::Public
            };
            (AddressType::Ipv4, scope)
        },
        Ok(IpAddr::V6(ip)) => {
            let scope = if ip.is_loopback() {
                Scope::MachineLocal
            } else if (ip.segments()[0] & 0xffc0) == 0xfe80 {
                Scope::LinkLocal
            } else if (ip.segments()[0] & 0xfe00) == 0xfc00 {
                Scope::CloudLocal
            } else {
                Scope::Public
            };
            (AddressType::Ipv6, scope)
        },
        Err(_) if value.eq_ignore_ascii_case("localhost") => (AddressType::Hostname, Scope::MachineLocal),
        Err(_) => (AddressType::Hostname, Scope::Unknown),
    }
}

/// Position of an address within its own list once sorted for merging.
///
/// Without `prefer_ipv6`, host names and IPv4 addresses lead, ordered by
/// scope with host names ahead of IPv4 in the same scope; IPv6 addresses
/// trail in their original order. With `prefer_ipv6`, IPv6 addresses lead
/// (public, then loopback, then cloud-local, then link-local), followed by
/// host names and then IPv4, each by scope.
fn sort_rank(address: &Address, prefer_ipv6: bool) -> (u8, u8, u8) {
    let scope = match address.scope {
        Scope::Unknown | Scope::Public => 0,
        Scope::CloudLocal => 1,
        Scope::MachineLocal => 2,
        Scope::LinkLocal => 3,
    };
    match (address.kind, prefer_ipv6) {
        (AddressType::Ipv6, false) => (1, 0, 0),
        (AddressType::Hostname, false) => (0, scope, 0),
        (AddressType::Ipv4, false) => (0, scope, 1),
        (AddressType::Ipv6, true) => {
            let scope = match address.scope {
                Scope::Unknown | Scope::Public => 0,
                Scope::MachineLocal => 1,
                Scope::CloudLocal => 2,
                Scope::LinkLocal => 3,
            };
            (0, scope, 0)
        },
        (AddressType::Hostname, true) => (1, scope, 0),
        (AddressType::Ipv4, true) => (2, scope, 0),
    }
}

/// Merges provider and machine addresses into one list.
///
/// Each list is sorted on its own (stable, see [`sort_rank`]), then the
/// sorted provider list is followed by the sorted machine list. Empty values
/// are skipped and only the first occurrence of a value is kept.
pub fn merge_addresses<'a>(provider: &'a [Address], machine: &'a [Address], prefer_ipv6: bool) -> Vec<Address> {
    let sorted = |list: &'a [Address]| -> Vec<&'a Address> {
        let mut list: Vec<&Address> = list.iter().collect();
        list.sort_by_key(|a| sort_rank(a, prefer_ipv6));
        list
    };
    let mut merged: Vec<Address> = Vec::with_capacity(provider.len() + machine.len());
    for address in sorted(provider).into_iter().chain(sorted(machine)) {
        if address.value.is_empty() || merged.iter().any(|a| a.value == address.value) {
            continue;
        }
        merged.push(address.clone());
    }
    merged
}
