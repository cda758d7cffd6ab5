//! Local network detection for discovery.
//!
//! Picks the first private IPv4 address on a non-loopback interface and
//! derives the set of broadcast addresses the responder announces to.

use std::io;
use std::net::Ipv4Addr;

use super::DiscoveryError;

/// Broadcast targets used when the local network cannot be determined.
pub const FALLBACK_BROADCASTS: [Ipv4Addr; 5] = [
    Ipv4Addr::BROADCAST,
    Ipv4Addr::new(192, 168, 1, 255),
    Ipv4Addr::new(192, 168, 0, 255),
    Ipv4Addr::new(10, 255, 255, 255),
    Ipv4Addr::new(172, 31, 255, 255),
];

/// Private network class of the selected address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    /// `10.0.0.0/8`
    A,
    /// `172.16.0.0/12`
    B,
    /// `192.168.0.0/16`
    C,
}

impl NetworkClass {
    /// Class of a private address.
    pub fn of(ip: Ipv4Addr) -> Self {
        match ip.octets()[0] {
            10 => NetworkClass::A,
            172 => NetworkClass::B,
            _ => NetworkClass::C,
        }
    }

    /// Well-known broadcast addresses for neighbouring subnets of this class.
    pub fn well_known_broadcasts(&self) -> [Ipv4Addr; 3] {
        match self {
            NetworkClass::A => [
                Ipv4Addr::new(10, 255, 255, 255),
                Ipv4Addr::new(10, 0, 255, 255),
                Ipv4Addr::new(10, 10, 255, 255),
            ],
            NetworkClass::B => [
                Ipv4Addr::new(172, 31, 255, 255),
                Ipv4Addr::new(172, 16, 255, 255),
                Ipv4Addr::new(172, 20, 255, 255),
            ],
            NetworkClass::C => [
                Ipv4Addr::new(192, 168, 1, 255),
                Ipv4Addr::new(192, 168, 0, 255),
                Ipv4Addr::new(192, 168, 255, 255),
            ],
        }
    }
}

/// The address the coordinator advertises and its subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub class: NetworkClass,
}

impl NetworkInfo {
    /// Describe the network of `ip` with mask `netmask`.
    pub fn new(ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            ip,
            netmask,
            broadcast: broadcast_address(ip, netmask),
            class: NetworkClass::of(ip),
        }
    }

    /// Broadcast addresses to announce to, deduplicated, in send order.
    pub fn broadcast_targets(&self) -> Vec<Ipv4Addr> {
        let mut targets = Vec::with_capacity(5);
        let candidates = [Ipv4Addr::BROADCAST, self.broadcast]
            .into_iter()
            .chain(self.class.well_known_broadcasts());
        for addr in candidates {
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }
        targets
    }
}

/// `ip` with every host bit set.
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// One IPv4 address of a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub loopback: bool,
}

/// Source of the host's IPv4 interface addresses.
pub trait InterfaceSource: Send + Sync {
    fn ipv4_interfaces(&self) -> io::Result<Vec<InterfaceAddr>>;
}

/// Reads the host's interfaces through `if-addrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn ipv4_interfaces(&self) -> io::Result<Vec<InterfaceAddr>> {
        let interfaces = if_addrs::get_if_addrs()?;
        Ok(interfaces
            .into_iter()
            .filter_map(|iface| {
                let loopback = iface.is_loopback();
                match iface.addr {
                    if_addrs::IfAddr::V4(v4) => Some(InterfaceAddr {
                        name: iface.name,
                        ip: v4.ip,
                        netmask: v4.netmask,
                        loopback,
                    }),
                    if_addrs::IfAddr::V6(_) => None,
                }
            })
            .collect())
    }
}

/// A fixed interface list, for tests and pinned deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    interfaces: Vec<InterfaceAddr>,
}

impl StaticInterfaces {
    pub fn new(interfaces: Vec<InterfaceAddr>) -> Self {
        Self { interfaces }
    }

    /// A single non-loopback interface `eth0` with `ip/prefix`.
    pub fn single(ip: Ipv4Addr, prefix: u8) -> Self {
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix.min(32)))
        };
        Self::new(vec![InterfaceAddr {
            name: "eth0".to_string(),
            ip,
            netmask: Ipv4Addr::from(mask),
            loopback: false,
        }])
    }
}

impl InterfaceSource for StaticInterfaces {
    fn ipv4_interfaces(&self) -> io::Result<Vec<InterfaceAddr>> {
        Ok(self.interfaces.clone())
    }
}

/// Pick the first private, non-loopback address from `interfaces`.
pub fn select_network(interfaces: &[InterfaceAddr]) -> Option<NetworkInfo> {
    interfaces
        .iter()
        .find(|iface| !iface.loopback && iface.ip.is_private())
        .map(|iface| NetworkInfo::new(iface.ip, iface.netmask))
}

/// Enumerate interfaces and select the advertised network.
pub fn detect_network(source: &dyn InterfaceSource) -> Result<NetworkInfo, DiscoveryError> {
    let interfaces = source.ipv4_interfaces().map_err(DiscoveryError::Interfaces)?;
    select_network(&interfaces).ok_or(DiscoveryError::NoPrivateAddress)
}
