//! TCP readiness probing for the backend port.
//!
//! The backend is considered ready once something accepts a connection on
//! its port. A connection attempt is bounded so a firewalled or
//! half-configured host cannot hang a status request.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::defaults::READY_ATTEMPT_TIMEOUT;

/// Try one TCP connection to the port on loopback.
pub async fn check_port(port: u16) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    matches!(
        tokio::time::timeout(READY_ATTEMPT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Poll the port until it accepts a connection or the deadline passes.
///
/// Returns the elapsed time on success.
pub async fn wait_until_ready(port: u16, max_wait: Duration, interval: Duration) -> Option<Duration> {
    let start = Instant::now();
    loop {
        if check_port(port).await {
            return Some(start.elapsed());
        }
        if start.elapsed() >= max_wait {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn check_port_sees_a_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_port(port).await);
    }

    #[tokio::test]
    async fn check_port_reports_closed_port() {
        // Bind then drop to get a port that is known to be free.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!check_port(port).await);
    }

    #[tokio::test]
    async fn wait_until_ready_succeeds_once_the_listener_appears() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let elapsed = wait_until_ready(port, Duration::from_secs(5), Duration::from_millis(50)).await;
        assert!(elapsed.is_some());
    }

    #[tokio::test]
    async fn wait_until_ready_outlasts_a_slow_starting_listener() {
        // Reserve a port, then bring the listener up only after a couple
        // of poll intervals have already failed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let interval = Duration::from_millis(50);
        let delay = interval * 2 + Duration::from_millis(20);
        let late_listener = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            TcpListener::bind(("127.0.0.1", port)).await.unwrap()
        });

        let elapsed = wait_until_ready(port, Duration::from_secs(5), interval)
            .await
            .expect("port never became ready");
        assert!(elapsed >= interval * 2);

        drop(late_listener.await.unwrap());
    }

    #[tokio::test]
    async fn wait_until_ready_gives_up_at_the_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let start = Instant::now();
        let result = wait_until_ready(port, Duration::from_millis(50), Duration::from_millis(10)).await;
        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
