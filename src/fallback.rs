//! Point-to-point channel for clipboard contents that do not fit in one
//! datagram. The server writes one delimited envelope per connection and
//! hangs up; `fetch` is the matching client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, ProtocolError, RECORD_DELIMITER};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("failed to bind fallback listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("fallback connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("fallback response ended before the record delimiter")]
    Truncated,
    #[error("fallback response exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("fallback fetch timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct FallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
    payload: Arc<RwLock<Envelope>>,
}

/// Shared view of a running fallback server.
#[derive(Clone)]
pub struct FallbackHandle {
    addr: SocketAddr,
    payload: Arc<RwLock<Envelope>>,
}

impl FallbackServer {
    pub async fn bind(addr: SocketAddr, envelope: Envelope) -> Result<Self, FallbackError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FallbackError::Bind { addr, source })?;
        let addr = listener.local_addr()?;
        info!(%addr, len = envelope.length, "fallback server listening");

        Ok(Self {
            listener,
            addr,
            payload: Arc::new(RwLock::new(envelope)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> FallbackHandle {
        FallbackHandle {
            addr: self.addr,
            payload: self.payload.clone(),
        }
    }

    /// Run the accept loop on its own task. It only ends when aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = &self.listener;
            loop {
                let (stream, peer) = accept_next(move || listener.accept()).await;
                let payload = self.payload.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, peer, payload).await {
                        warn!(%peer, error = %e, "fallback transfer failed");
                    }
                });
            }
        })
    }
}

impl FallbackHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replace the envelope served to subsequent connections.
    pub async fn publish(&self, envelope: Envelope) {
        let mut current = self.payload.write().await;
        if *current != envelope {
            debug!(len = envelope.length, "fallback payload updated");
            *current = envelope;
        }
    }
}

/// Call `accept` until it yields a connection, pausing after each failure.
async fn accept_next<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                // Errors like EMFILE persist until a descriptor frees up.
                warn!(error = %e, "fallback accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    payload: Arc<RwLock<Envelope>>,
) -> Result<(), FallbackError> {
    let (length, frame) = {
        let envelope = payload.read().await;
        (envelope.length, envelope.frame())
    };
    info!(%peer, len = length, "sending clipboard over fallback");
    stream.write_all(&frame).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Fetch one envelope from the fallback server at `addr`.
///
/// `max_size` bounds the record so a misbehaving peer cannot make us buffer
/// without limit.
pub async fn fetch(
    addr: SocketAddr,
    max_size: usize,
    timeout: Duration,
) -> Result<Envelope, FallbackError> {
    tokio::time::timeout(timeout, fetch_record(addr, max_size))
        .await
        .map_err(|_| FallbackError::TimedOut(timeout))?
}

async fn fetch_record(addr: SocketAddr, max_size: usize) -> Result<Envelope, FallbackError> {
    let stream = TcpStream::connect(addr).await?;
    let limit = u64::try_from(max_size).unwrap_or(u64::MAX).saturating_add(1);
    let mut reader = BufReader::new(stream.take(limit));

    let mut record = Vec::new();
    reader.read_until(RECORD_DELIMITER, &mut record).await?;
    match record.pop() {
        Some(RECORD_DELIMITER) => {}
        _ if record.len() >= max_size => return Err(FallbackError::TooLarge { limit: max_size }),
        _ => return Err(FallbackError::Truncated),
    }

    let envelope = Envelope::decode(&record)?;
    info!(%addr, len = envelope.length, "fetched clipboard over fallback");
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(envelope: Envelope) -> (FallbackHandle, JoinHandle<()>) {
        let server = FallbackServer::bind("127.0.0.1:0".parse().unwrap(), envelope)
            .await
            .unwrap();
        let handle = server.handle();
        (handle, server.spawn())
    }

    #[tokio::test]
    async fn test_serves_full_envelope() {
        let envelope = Envelope::text("y".repeat(20_000));
        let (handle, task) = start(envelope.clone()).await;

        let fetched = fetch(handle.local_addr(), 1 << 20, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fetched, envelope);
        task.abort();
    }

    #[tokio::test]
    async fn test_serves_many_connections() {
        let (handle, task) = start(Envelope::text("again")).await;
        for _ in 0..3 {
            let fetched = fetch(handle.local_addr(), 1024, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(fetched.content, "again");
        }
        task.abort();
    }

    #[tokio::test]
    async fn test_publish_refreshes_payload() {
        let (handle, task) = start(Envelope::text("first")).await;
        handle.publish(Envelope::text("second")).await;

        let fetched = fetch(handle.local_addr(), 1024, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fetched.content, "second");
        task.abort();
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_record() {
        let (handle, task) = start(Envelope::text("z".repeat(4096))).await;
        let result = fetch(handle.local_addr(), 128, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(FallbackError::TooLarge { limit: 128 })));
        task.abort();
    }

    #[tokio::test]
    async fn test_fetch_detects_missing_delimiter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(br#"{"content":"cut"#).await.unwrap();
        });

        let result = fetch(addr, 1024, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(FallbackError::Truncated)));
    }

    #[tokio::test]
    async fn test_fetch_malformed_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"garbage\n").await.unwrap();
        });

        let result = fetch(addr, 1024, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(FallbackError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_accept_errors_back_off() {
        let mut failures = 2;
        let started = tokio::time::Instant::now();
        let accepted = accept_next(|| {
            let result = if failures > 0 {
                failures -= 1;
                Err(std::io::Error::other("too many open files"))
            } else {
                Ok("connection")
            };
            async move { result }
        })
        .await;

        assert_eq!(accepted, "connection");
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 2);
    }

    #[tokio::test]
    async fn test_second_bind_on_same_port_fails() {
        let (handle, task) = start(Envelope::text("only")).await;
        let result = FallbackServer::bind(handle.local_addr(), Envelope::default()).await;
        assert!(matches!(result, Err(FallbackError::Bind { .. })));
        task.abort();
    }
}
