use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clipboard::{ClipboardAccess, ClipboardError};
use crate::fallback::{FallbackError, FallbackHandle, FallbackServer};
use crate::interfaces::Multicasters;
use crate::protocol::{Envelope, FALLBACK_PORT, MAX_DATAGRAM_SIZE};

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error(transparent)]
    Fallback(#[from] FallbackError),
}

#[derive(Debug, Clone)]
pub struct AnnounceSettings {
    /// Largest datagram the announcer will put on the wire.
    pub max_datagram_size: usize,
    pub interval: Duration,
    pub fallback_addr: SocketAddr,
    /// Serve the latest oversized clipboard instead of the one captured when
    /// the fallback server started.
    pub refresh_fallback: bool,
}

impl Default for AnnounceSettings {
    fn default() -> Self {
        Self {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            interval: Duration::from_secs(1),
            fallback_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, FALLBACK_PORT)),
            refresh_fallback: true,
        }
    }
}

/// Result of one announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// True content length, also for pointer envelopes.
    pub length: usize,
    pub pointer: bool,
    pub datagram_len: usize,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Periodically multicasts the local clipboard on every resolved interface.
pub struct Announcer<C> {
    clipboard: Mutex<C>,
    multicasters: Multicasters,
    settings: AnnounceSettings,
    fallback: OnceCell<FallbackHandle>,
}

impl<C: ClipboardAccess> Announcer<C> {
    pub fn new(clipboard: C, multicasters: Multicasters, settings: AnnounceSettings) -> Self {
        Self {
            clipboard: Mutex::new(clipboard),
            multicasters,
            settings,
            fallback: OnceCell::new(),
        }
    }

    /// Address of the fallback server, once one has been started.
    pub fn fallback_addr(&self) -> Option<SocketAddr> {
        self.fallback.get().map(FallbackHandle::local_addr)
    }

    /// Announce forever, one tick per interval. Returns only when the fallback
    /// server cannot be started.
    pub async fn run(&self) -> Result<(), AnnounceError> {
        info!(
            interfaces = ?self.multicasters.names(),
            group = %self.multicasters.group(),
            interval = ?self.settings.interval,
            "announcing clipboard"
        );
        loop {
            if let Some(report) = self.tick().await? {
                debug!(
                    len = report.length,
                    pointer = report.pointer,
                    delivered = ?report.delivered,
                    failed = ?report.failed,
                    "announced clipboard"
                );
            }
            tokio::time::sleep(self.settings.interval).await;
        }
    }

    /// Capture the clipboard once and send it to every interface.
    ///
    /// `Ok(None)` means the clipboard could not be read and nothing was sent.
    pub async fn tick(&self) -> Result<Option<TickReport>, AnnounceError> {
        let snapshot = match self.clipboard.lock().await.read() {
            Ok(snapshot) => snapshot,
            Err(ClipboardError::Empty) => {
                debug!("clipboard empty, skipping announcement");
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "failed to read clipboard, skipping announcement");
                return Ok(None);
            }
        };

        let envelope = Envelope::new(snapshot.content, snapshot.kind);
        let mut datagram = envelope.encode();
        let pointer = datagram.len() > self.settings.max_datagram_size;
        if pointer {
            self.offer_fallback(&envelope).await?;
            datagram = envelope.to_pointer().encode();
        }

        let datagram_len = datagram.len();
        let (delivered, failed) = self.fan_out(Arc::new(datagram)).await;
        Ok(Some(TickReport {
            length: envelope.length,
            pointer,
            datagram_len,
            delivered,
            failed,
        }))
    }

    /// Start the fallback server on the first oversized tick. Ticks that
    /// overlap the start wait until it is listening before they announce.
    async fn offer_fallback(&self, envelope: &Envelope) -> Result<(), AnnounceError> {
        let settings = &self.settings;
        let handle = self
            .fallback
            .get_or_try_init(move || async move {
                info!(
                    len = envelope.length,
                    max = settings.max_datagram_size,
                    addr = %settings.fallback_addr,
                    "clipboard exceeds datagram size, starting fallback server"
                );
                let server =
                    FallbackServer::bind(settings.fallback_addr, envelope.clone()).await?;
                let handle = server.handle();
                // The accept loop lives for the rest of the process.
                drop(server.spawn());
                Ok::<_, AnnounceError>(handle)
            })
            .await?;

        if settings.refresh_fallback {
            handle.publish(envelope.clone()).await;
        }
        Ok(())
    }

    async fn fan_out(&self, datagram: Arc<Vec<u8>>) -> (Vec<String>, Vec<String>) {
        let mut sends = JoinSet::new();
        for member in self.multicasters.iter() {
            let name = member.name.clone();
            let socket = member.socket.clone();
            let datagram = datagram.clone();
            sends.spawn(async move {
                let result = socket.send(&datagram).await;
                (name, result)
            });
        }

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        let deadline = tokio::time::sleep(self.settings.interval);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = sends.join_next() => match joined {
                    Some(Ok((name, Ok(_)))) => delivered.push(name),
                    Some(Ok((name, Err(e)))) => {
                        warn!(interface = %name, error = %e, "multicast send failed");
                        failed.push(name);
                    }
                    Some(Err(e)) => warn!(error = %e, "multicast send task failed"),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(pending = sends.len(), "multicast sends still pending, abandoning them");
                    break;
                }
            }
        }

        delivered.sort();
        failed.sort();
        (delivered, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{MemoryClipboard, Snapshot};
    use crate::interfaces::{Candidate, Multicaster};
    use crate::protocol::Kind;
    use std::net::SocketAddrV4;
    use tokio::net::UdpSocket;

    async fn sink() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };
        (socket, addr)
    }

    async fn loopback(target: SocketAddrV4) -> Multicasters {
        let candidates = vec![Candidate {
            name: "lo".to_string(),
            addr: Some(Ipv4Addr::LOCALHOST),
        }];
        Multicasters::connect(target, candidates).await.unwrap()
    }

    fn settings() -> AnnounceSettings {
        AnnounceSettings {
            fallback_addr: "127.0.0.1:0".parse().unwrap(),
            ..AnnounceSettings::default()
        }
    }

    async fn recv(socket: &UdpSocket) -> Envelope {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        Envelope::decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_small_clip_is_sent_inline() {
        let (socket, target) = sink().await;
        let clipboard = MemoryClipboard::with(Snapshot::text("hello"));
        let announcer = Announcer::new(clipboard, loopback(target).await, settings());

        let report = announcer.tick().await.unwrap().unwrap();
        assert!(!report.pointer);
        assert_eq!(report.delivered, ["lo"]);
        assert!(report.failed.is_empty());
        assert_eq!(announcer.fallback_addr(), None);

        let envelope = recv(&socket).await;
        assert_eq!(envelope, Envelope::text("hello"));
    }

    #[tokio::test]
    async fn test_oversized_clip_sends_pointer() {
        let (socket, target) = sink().await;
        let clipboard = MemoryClipboard::with(Snapshot::text("a".repeat(20_000)));
        let announcer = Announcer::new(clipboard, loopback(target).await, settings());

        let report = announcer.tick().await.unwrap().unwrap();
        assert!(report.pointer);
        assert_eq!(report.length, 20_000);
        assert!(report.datagram_len <= MAX_DATAGRAM_SIZE);
        assert!(announcer.fallback_addr().is_some());

        let envelope = recv(&socket).await;
        assert!(envelope.content.is_empty());
        assert!(envelope.pointer);
        assert_eq!(envelope.length, 20_000);
        assert_eq!(envelope.kind, Kind::Text);
    }

    /// Connected socket whose next send fails with "connection refused".
    async fn refused_socket() -> UdpSocket {
        let closed = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = closed.local_addr().unwrap();
        drop(closed);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(target).await.unwrap();
        socket.send(b"ping").await.unwrap();
        // Let the ICMP port-unreachable land on the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket
    }

    #[tokio::test]
    async fn test_failed_interface_does_not_block_others() {
        let (healthy, target) = sink().await;
        let good = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        good.connect(target).await.unwrap();

        let multicasters = Multicasters::from_members(
            target,
            vec![
                Multicaster {
                    name: "bad0".to_string(),
                    socket: Arc::new(refused_socket().await),
                },
                Multicaster {
                    name: "good0".to_string(),
                    socket: Arc::new(good),
                },
            ],
        );
        let clipboard = MemoryClipboard::with(Snapshot::text("hello"));
        let announcer = Announcer::new(clipboard, multicasters, settings());

        let report = announcer.tick().await.unwrap().unwrap();
        assert_eq!(report.delivered, ["good0"]);
        assert_eq!(report.failed, ["bad0"]);
        assert_eq!(recv(&healthy).await, Envelope::text("hello"));
    }

    #[tokio::test]
    async fn test_unreadable_clipboard_skips_tick() {
        let (_socket, target) = sink().await;
        let announcer = Announcer::new(MemoryClipboard::new(), loopback(target).await, settings());
        assert_eq!(announcer.tick().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_only_one_fallback_server() {
        let (_socket, target) = sink().await;
        let clipboard = MemoryClipboard::with(Snapshot::text("b".repeat(10_000)));
        let announcer = Arc::new(Announcer::new(clipboard, loopback(target).await, settings()));

        // Each tick must see a listening server by the time it has announced.
        let announcer = &announcer;
        let tick = || async move {
            let report = announcer.tick().await.unwrap().unwrap();
            (report.pointer, announcer.fallback_addr())
        };
        let (first, second) = tokio::join!(tick(), tick());
        assert!(first.0 && second.0);
        assert!(first.1.is_some());
        assert_eq!(first.1, second.1);

        let addr = announcer.fallback_addr().unwrap();
        announcer.tick().await.unwrap();
        assert_eq!(announcer.fallback_addr(), Some(addr));
    }

    #[tokio::test]
    async fn test_fallback_follows_clipboard() {
        let (_socket, target) = sink().await;
        let clipboard = MemoryClipboard::with(Snapshot::text("c".repeat(10_000)));
        let announcer = Announcer::new(clipboard.clone(), loopback(target).await, settings());
        announcer.tick().await.unwrap();

        clipboard.set(Snapshot::text("d".repeat(12_000)));
        announcer.tick().await.unwrap();

        let addr = announcer.fallback_addr().unwrap();
        let fetched = crate::fallback::fetch(addr, 1 << 20, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fetched.content, "d".repeat(12_000));
    }

    #[tokio::test]
    async fn test_pinned_fallback_keeps_first_clip() {
        let (_socket, target) = sink().await;
        let clipboard = MemoryClipboard::with(Snapshot::text("e".repeat(10_000)));
        let settings = AnnounceSettings {
            refresh_fallback: false,
            ..settings()
        };
        let announcer = Announcer::new(clipboard.clone(), loopback(target).await, settings);
        announcer.tick().await.unwrap();

        clipboard.set(Snapshot::text("f".repeat(12_000)));
        announcer.tick().await.unwrap();

        let addr = announcer.fallback_addr().unwrap();
        let fetched = crate::fallback::fetch(addr, 1 << 20, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fetched.content, "e".repeat(10_000));
    }

    #[tokio::test]
    async fn test_fallback_bind_failure_is_fatal() {
        let (_socket, target) = sink().await;
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let clipboard = MemoryClipboard::with(Snapshot::text("g".repeat(10_000)));
        let settings = AnnounceSettings {
            fallback_addr: taken.local_addr().unwrap(),
            ..settings()
        };
        let announcer = Announcer::new(clipboard, loopback(target).await, settings);

        assert!(matches!(
            announcer.tick().await,
            Err(AnnounceError::Fallback(FallbackError::Bind { .. }))
        ));
        assert_eq!(announcer.fallback_addr(), None);
    }
}
