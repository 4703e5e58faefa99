use std::future::Future;
use std::time::Duration;

/// How a time-boxed operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    TimedOut,
}

impl<T> Outcome<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::TimedOut => None,
        }
    }
}

/// Race `operation` against a timer of `limit`.
///
/// When the timer wins the operation future is dropped, which releases any
/// socket it was waiting on.
pub async fn run_with_deadline<F>(limit: Duration, operation: F) -> Outcome<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(value) => Outcome::Completed(value),
        Err(_) => Outcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_completes_before_deadline() {
        let outcome = run_with_deadline(Duration::from_secs(5), async { 7 }).await;
        assert_eq!(outcome, Outcome::Completed(7));
    }

    #[tokio::test]
    async fn test_times_out() {
        let outcome =
            run_with_deadline(Duration::from_millis(20), std::future::pending::<()>()).await;
        assert!(outcome.is_timed_out());
        assert_eq!(outcome.completed(), None);
    }

    #[tokio::test]
    async fn test_timeout_releases_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let outcome = run_with_deadline(Duration::from_millis(50), async move {
            let mut buf = [0u8; 16];
            socket.recv_from(&mut buf).await
        })
        .await;
        assert!(outcome.is_timed_out());

        // The abandoned receive dropped its socket, so the port is free again.
        UdpSocket::bind(addr).await.unwrap();
    }
}
