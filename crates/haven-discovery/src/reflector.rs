//! Public-endpoint reflection.
//!
//! A host behind NAT cannot see its own public address. The reflector
//! collaborator asks an external service what address our packets appear to
//! come from. The production implementation walks a fixed ordered server
//! list; the first answer wins.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Probe body sent to a reflection server
const REFLECT_PROBE: &[u8] = b"HAVEN_REFLECT";

/// Discovers this host's public endpoint.
///
/// Implementations return `None` when no reflection service is reachable -
/// traversal then records the miss and moves on rather than failing hard.
pub trait EndpointReflector: Send + Sync {
    /// Ask an external service for our public `ip:port`, or `None`
    fn get_public_endpoint(&self) -> impl Future<Output = Option<SocketAddr>> + Send;
}

/// Reflection over a plain UDP echo exchange.
///
/// Each configured server is sent a short probe; the expected response body
/// is the observed source endpoint as text (`"203.0.113.9:41641"`). Servers
/// are tried strictly in order with an individual timeout each.
#[derive(Debug, Clone)]
pub struct UdpEchoReflector {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl UdpEchoReflector {
    /// Build a reflector over an ordered server list
    #[must_use]
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    async fn query(&self, server: SocketAddr) -> Option<SocketAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.send_to(REFLECT_PROBE, server).await.ok()?;

        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;

        let text = std::str::from_utf8(&buf[..len]).ok()?;
        text.trim().parse().ok()
    }
}

impl EndpointReflector for UdpEchoReflector {
    async fn get_public_endpoint(&self) -> Option<SocketAddr> {
        for &server in &self.servers {
            match self.query(server).await {
                Some(endpoint) => {
                    tracing::debug!(%server, %endpoint, "public endpoint reflected");
                    return Some(endpoint);
                }
                None => {
                    tracing::debug!(%server, "reflection server did not answer");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal local reflection server: answers every probe with the
    /// observed source address as text.
    async fn spawn_reflector_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(from.to_string().as_bytes(), from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn reflects_observed_endpoint() {
        let server = spawn_reflector_server().await;
        let reflector = UdpEchoReflector::new(vec![server], Duration::from_millis(500));

        let endpoint = reflector.get_public_endpoint().await.unwrap();
        assert!(endpoint.ip().is_loopback());
        assert_ne!(endpoint.port(), 0);
    }

    #[tokio::test]
    async fn dead_server_falls_through_to_next() {
        let dead = "127.0.0.1:9".parse().unwrap();
        let live = spawn_reflector_server().await;
        let reflector =
            UdpEchoReflector::new(vec![dead, live], Duration::from_millis(200));

        assert!(reflector.get_public_endpoint().await.is_some());
    }

    #[tokio::test]
    async fn all_dead_servers_yield_none() {
        let reflector = UdpEchoReflector::new(
            vec!["127.0.0.1:9".parse().unwrap()],
            Duration::from_millis(100),
        );
        assert!(reflector.get_public_endpoint().await.is_none());
    }
}
