//! TCP keep-alive configuration for accepted and dialed sockets.
//!
//! Keep-alive probing is the only liveness mechanism of the transport: no
//! read or write timeouts exist, so a silent peer is detected only when the
//! OS gives up on its probes and the next read or write fails.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Idle time before the first probe.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Interval between unanswered probes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Unanswered probes before the connection is declared dead.
pub const KEEPALIVE_RETRIES: u32 = 5;

/// Keep-alive timings applied to a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlivePolicy {
    pub idle: Duration,
    pub interval: Duration,
    pub retries: u32,
}

impl Default for KeepAlivePolicy {
    fn default() -> Self {
        Self {
            idle: KEEPALIVE_IDLE,
            interval: KEEPALIVE_INTERVAL,
            retries: KEEPALIVE_RETRIES,
        }
    }
}

impl KeepAlivePolicy {
    /// Build the socket2 parameter set for the current platform.
    ///
    /// On Windows socket2 encodes this as the `(onoff, keepalivetime,
    /// keepaliveinterval)` control structure in milliseconds; the retry count
    /// is fixed by the OS there.
    fn to_socket2(self) -> TcpKeepalive {
        let params = TcpKeepalive::new().with_time(self.idle);

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "windows",
        ))]
        let params = params.with_interval(self.interval);

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
        ))]
        let params = params.with_retries(self.retries);

        params
    }
}

/// Enable keep-alive on `stream` with the given timings.
///
/// Never fails the caller: a rejected option is logged and the socket is
/// used as-is.
pub fn enable_keepalive(stream: &TcpStream, policy: &KeepAlivePolicy) {
    let sock = SockRef::from(stream);

    if let Err(e) = sock.set_keepalive(true) {
        tracing::warn!("SO_KEEPALIVE rejected: {e}");
        return;
    }

    if let Err(e) = sock.set_tcp_keepalive(&policy.to_socket2()) {
        tracing::warn!(
            idle = ?policy.idle,
            interval = ?policy.interval,
            retries = policy.retries,
            "keep-alive timings rejected: {e}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn default_policy_numbers() {
        let policy = KeepAlivePolicy::default();
        assert_eq!(policy.idle, Duration::from_secs(30));
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.retries, 5);
    }

    #[tokio::test]
    async fn applies_policy_to_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        enable_keepalive(&stream, &KeepAlivePolicy::default());

        let sock = SockRef::from(&stream);
        assert!(sock.keepalive().unwrap());

        #[cfg(target_os = "linux")]
        {
            assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(30));
            assert_eq!(sock.keepalive_interval().unwrap(), Duration::from_secs(5));
            assert_eq!(sock.keepalive_retries().unwrap(), 5);
        }
    }
}
