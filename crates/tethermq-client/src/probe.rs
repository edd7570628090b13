//! Transport probe
//!
//! Checks that the broker looks reachable before paying for a handshake:
//! resolve the host, ask the OS for a route, then open and drop a TCP
//! connection. The whole probe is bounded by the caller's timeout.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tracing::{debug, trace};

use tethermq_core::{ConnectionError, Probe};

/// Reachability check over plain TCP
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tethermq_client::TcpProbe;
/// use tethermq_core::Probe;
///
/// # tokio_test::block_on(async {
/// let reachable = TcpProbe::new()
///     .probe("broker.local", 1883, Duration::from_secs(2))
///     .await
///     .is_ok();
/// println!("broker reachable: {reachable}");
/// # });
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl TcpProbe {
    /// Create a probe
    pub const fn new() -> Self {
        Self
    }

    async fn run(host: &str, port: u16) -> Result<(), ConnectionError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| probe_failed(format!("cannot resolve {host}: {e}")))?
            .collect();

        let Some(first) = addrs.first().copied() else {
            return Err(probe_failed(format!("{host} resolved to no addresses")));
        };

        if let Err(e) = route_check(first).await {
            if is_no_route(&e) {
                debug!(host, port, error = %e, "No route to broker, skipping dial");
                return Err(probe_failed(format!("No route to {first}: {e}")));
            }
            trace!(error = %e, "Route check inconclusive, dialing anyway");
        }

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    drop(stream);
                    trace!(%addr, "Probe connected");
                    return Ok(());
                }
                Err(e) => last_error = Some((addr, e)),
            }
        }

        Err(match last_error {
            Some((addr, e)) => probe_failed(format!("{addr}: {e}")),
            None => probe_failed(format!("{host}:{port} not reachable")),
        })
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<(), ConnectionError> {
        match tokio::time::timeout(timeout, Self::run(host, port)).await {
            Ok(result) => result,
            Err(_) => Err(probe_failed(format!(
                "{host}:{port} did not answer within {timeout:?}"
            ))),
        }
    }
}

/// Connect an unbound UDP socket to `addr`. No packet is sent; the OS only
/// picks a route, failing fast when there is none.
async fn route_check(addr: SocketAddr) -> io::Result<()> {
    let local: SocketAddr = if addr.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await
}

fn is_no_route(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable
    )
}

fn probe_failed(reason: String) -> ConnectionError {
    ConnectionError::ProbeUnreachable(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = TcpProbe::new()
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_probe_refused_port_is_unreachable() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = TcpProbe::new()
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(ConnectionError::ProbeUnreachable(_))));
    }

    #[test]
    fn test_no_route_kinds() {
        assert!(is_no_route(&io::Error::from(io::ErrorKind::NetworkUnreachable)));
        assert!(is_no_route(&io::Error::from(io::ErrorKind::HostUnreachable)));
        assert!(!is_no_route(&io::Error::from(io::ErrorKind::ConnectionRefused)));
    }
}
