use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tcpchat_transport::parse_endpoint;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Setup Ctrl+C handler, returns a flag that goes false on signal.
pub fn setup_ctrlc() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("\nCtrl+C received, shutting down...");
        r.store(false, Ordering::Relaxed);
    });
    running
}

/// Forward stdin lines to a channel. The channel closes at end of input.
pub fn spawn_stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Parse a peer endpoint from `IP:PORT`.
pub fn parse_target(s: &str) -> anyhow::Result<SocketAddr> {
    let (ip, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid endpoint '{s}': expected IP:PORT"))?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    parse_endpoint(ip, port).map_err(|e| anyhow::anyhow!("invalid endpoint '{s}': {e}"))
}

/// Elapsed seconds since `start`.
pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_ipv4() {
        let addr = parse_target("192.168.0.21:11000").unwrap();
        assert_eq!(addr, "192.168.0.21:11000".parse().unwrap());
    }

    #[test]
    fn target_ipv6_brackets() {
        let addr = parse_target("[::1]:11001").unwrap();
        assert_eq!(addr, "[::1]:11001".parse().unwrap());
    }

    #[test]
    fn target_rejects_garbage() {
        assert!(parse_target("localhost").is_err());
        assert!(parse_target("10.0.0.1:0").is_err());
        assert!(parse_target("10.0.0.1:70000").is_err());
    }
}
