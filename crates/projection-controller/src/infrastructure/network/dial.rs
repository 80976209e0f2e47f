//! Bounded TCP dialing.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::debug;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("timed out after {timeout:?} dialing {addr}")]
    Timeout { addr: String, timeout: Duration },

    #[error("failed to dial {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Connects to `host:port`, giving up after `timeout`.
///
/// # Errors
///
/// Returns [`DialError::Timeout`] when the connection is not established in
/// time and [`DialError::Connect`] when it is refused or fails.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, DialError> {
    let addr = format!("{host}:{port}");
    match time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, "could not set TCP_NODELAY: {e}");
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(DialError::Connect { addr, source }),
        Err(_) => Err(DialError::Timeout { addr, timeout }),
    }
}

/// Dials `host:port` every `interval` until a connection is accepted or
/// `timeout` elapses.  Probe connections are closed immediately.
///
/// Returns whether the endpoint accepted a connection.
pub async fn wait_until_accepting(
    host: &str,
    port: u16,
    interval: Duration,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        if dial(host, port, remaining.min(interval.max(Duration::from_millis(10))))
            .await
            .is_ok()
        {
            return true;
        }
        time::sleep(interval.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}
