use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Interface name that selects every local interface.
pub const ALL_INTERFACES: &str = "all";

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("failed to enumerate network interfaces: {0}")]
    Enumerate(#[from] local_ip_address::Error),
    #[error("no usable interfaces to multicast on (tried: {})", tried.join(", "))]
    NoInterfaces { tried: Vec<String> },
}

/// An interface selected for sending, with the IPv4 address to send from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub addr: Option<Ipv4Addr>,
}

/// Expand the requested names against `available` (name, address) pairs.
///
/// An empty request or one containing `all` selects every available
/// interface. Each candidate gets the first IPv4 address of its interface,
/// or none when it has no IPv4 address or does not exist.
pub fn plan(requested: &[String], available: &[(String, IpAddr)]) -> Vec<Candidate> {
    let names: BTreeSet<&str> =
        if requested.is_empty() || requested.iter().any(|n| n == ALL_INTERFACES) {
            available.iter().map(|(name, _)| name.as_str()).collect()
        } else {
            requested.iter().map(String::as_str).collect()
        };

    names
        .into_iter()
        .map(|name| Candidate {
            name: name.to_string(),
            addr: available.iter().find_map(|(n, ip)| match ip {
                IpAddr::V4(v4) if n == name => Some(*v4),
                _ => None,
            }),
        })
        .collect()
}

/// One UDP socket per interface, each connected to the same group address.
#[derive(Debug)]
pub struct Multicasters {
    group: SocketAddrV4,
    members: Vec<Multicaster>,
}

#[derive(Debug, Clone)]
pub struct Multicaster {
    pub name: String,
    pub socket: Arc<UdpSocket>,
}

impl Multicasters {
    /// Open a sending socket for every candidate, skipping the ones that fail.
    pub async fn connect(
        group: SocketAddrV4,
        candidates: Vec<Candidate>,
    ) -> Result<Self, InterfaceError> {
        let mut members = Vec::with_capacity(candidates.len());
        let tried: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();

        for candidate in candidates {
            let Some(addr) = candidate.addr else {
                warn!(interface = %candidate.name, "no IPv4 address on interface, skipping");
                continue;
            };
            match open_socket(addr, group).await {
                Ok(socket) => {
                    debug!(interface = %candidate.name, %addr, "opened multicast socket");
                    members.push(Multicaster {
                        name: candidate.name,
                        socket: Arc::new(socket),
                    });
                }
                Err(e) => {
                    warn!(interface = %candidate.name, %addr, error = %e, "cannot send on interface, skipping");
                }
            }
        }

        if members.is_empty() {
            return Err(InterfaceError::NoInterfaces { tried });
        }
        Ok(Self { group, members })
    }

    #[cfg(test)]
    pub(crate) fn from_members(group: SocketAddrV4, members: Vec<Multicaster>) -> Self {
        Self { group, members }
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Multicaster> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

async fn open_socket(local: Ipv4Addr, group: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(local, 0)).await?;
    if group.ip().is_multicast() {
        socket.set_multicast_loop_v4(true)?;
    }
    socket.connect(group).await?;
    Ok(socket)
}

/// Every (interface, address) pair reported by the OS.
///
/// Interfaces without any IPv4 or IPv6 address are not listed, so `all` never
/// selects them. Naming one explicitly still gets it skipped with a warning.
pub fn local_interfaces() -> Result<Vec<(String, IpAddr)>, InterfaceError> {
    Ok(local_ip_address::list_afinet_netifas()?)
}

/// Resolve the requested interface names to ready-to-send sockets.
pub async fn resolve(
    requested: &[String],
    group: SocketAddrV4,
) -> Result<Multicasters, InterfaceError> {
    let available = local_interfaces()?;
    let candidates = plan(requested, &available);

    match Multicasters::connect(group, candidates).await {
        Ok(multicasters) => {
            info!(interfaces = ?multicasters.names(), %group, "multicasting on interfaces");
            Ok(multicasters)
        }
        Err(e) => {
            let names: BTreeSet<&str> = available.iter().map(|(n, _)| n.as_str()).collect();
            warn!(available = ?names, "no requested interface is usable");
            Err(e)
        }
    }
}
