use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::clipboard::{ClipboardAccess, ClipboardError};
use crate::fallback::{self, FallbackError};
use crate::protocol::{
    Envelope, ProtocolError, DEFAULT_MULTICAST_ADDR, FALLBACK_PORT, MAX_DATAGRAM_SIZE,
};

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        source: std::io::Error,
    },
    #[error("failed to read announcement: {0}")]
    Io(#[from] std::io::Error),
    #[error("ignoring announcement from {from}: {source}")]
    Malformed {
        from: SocketAddr,
        source: ProtocolError,
    },
    #[error("fallback fetch from {from} failed: {source}")]
    Fallback {
        from: SocketAddr,
        source: FallbackError,
    },
    #[error("failed to update clipboard: {0}")]
    Clipboard(#[from] ClipboardError),
}

impl ReceiveError {
    /// Errors that make further receive attempts pointless.
    pub fn is_setup_fatal(&self) -> bool {
        matches!(self, ReceiveError::Bind { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    pub group: SocketAddrV4,
    pub fallback_port: u16,
    pub max_datagram_size: usize,
    pub max_fetch_size: usize,
    pub fetch_timeout: Duration,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            group: DEFAULT_MULTICAST_ADDR,
            fallback_port: FALLBACK_PORT,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            max_fetch_size: 64 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// An announcement that made it into the clipboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub from: SocketAddr,
    pub envelope: Envelope,
    pub via_fallback: bool,
}

pub struct Receiver {
    socket: UdpSocket,
    settings: ReceiveSettings,
}

impl Receiver {
    /// Join the multicast group. A unicast `group` address is bound directly.
    ///
    /// The group port is bound with address reuse, so several receivers on
    /// one host can listen to the same group.
    pub async fn bind(settings: ReceiveSettings) -> Result<Self, ReceiveError> {
        let group = settings.group;
        let bind_err = |source| ReceiveError::Bind {
            addr: group,
            source,
        };

        let socket = if group.ip().is_multicast() {
            let socket = shared_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()))
                .map_err(bind_err)?;
            socket
                .join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)
                .map_err(bind_err)?;
            socket
        } else {
            UdpSocket::bind(group).await.map_err(bind_err)?
        };

        info!(%group, "listening for clipboard announcements");
        Ok(Self { socket, settings })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for one announcement and adopt it into `clipboard`.
    pub async fn receive_once<C: ClipboardAccess>(
        &self,
        clipboard: &mut C,
    ) -> Result<Received, ReceiveError> {
        let mut buf = vec![0u8; self.settings.max_datagram_size];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        debug!(bytes = n, %from, "read announcement");

        let received = self.resolve(&buf[..n], from).await?;
        let envelope = &received.envelope;
        if envelope.is_empty() {
            info!(%from, "peer clipboard is empty, leaving local clipboard untouched");
        } else {
            clipboard.write(&envelope.content, envelope.kind)?;
            info!(
                %from,
                len = envelope.length,
                kind = %envelope.kind,
                via_fallback = received.via_fallback,
                "clipboard updated"
            );
        }
        Ok(received)
    }

    /// Decode `datagram` sent by `from`, fetching the full content over the
    /// fallback channel when it is a pointer envelope.
    pub async fn resolve(&self, datagram: &[u8], from: SocketAddr) -> Result<Received, ReceiveError> {
        let announced = Envelope::decode(datagram)
            .map_err(|source| ReceiveError::Malformed { from, source })?;

        if !announced.is_pointer(self.settings.max_datagram_size) {
            return Ok(Received {
                from,
                envelope: announced,
                via_fallback: false,
            });
        }

        let peer = SocketAddr::new(from.ip(), self.settings.fallback_port);
        debug!(%peer, len = announced.length, "announcement is a pointer, fetching");
        let fetched = fallback::fetch(
            peer,
            self.settings.max_fetch_size,
            self.settings.fetch_timeout,
        )
        .await
        .map_err(|source| ReceiveError::Fallback { from: peer, source })?;

        Ok(Received {
            from,
            envelope: Envelope {
                pointer: false,
                ..fetched
            },
            via_fallback: true,
        })
    }
}

/// UDP socket on `addr` that other reusing sockets may bind as well.
fn shared_udp(addr: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // BSD kernels only share multicast ports between SO_REUSEPORT sockets.
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    UdpSocket::from_std(socket.into())
}
