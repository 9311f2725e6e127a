//! NAT traversal fallback ladder.
//!
//! Methods are tried in fixed order and the first success short-circuits the
//! rest: (1) direct TCP connect; (2) reflect our public endpoint, punch a
//! UDP hole toward the peer's claimed address, then retry the TCP connect.
//! When everything fails the caller gets a single aggregated error carrying
//! one diagnostic per method.

use crate::error::{DiscoveryError, MethodAttempt};
use crate::reflector::EndpointReflector;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};

/// Probe body sent while punching
const PUNCH_PROBE: &[u8] = b"HAVEN_PUNCH";

/// Traversal tuning
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// Per-attempt TCP connect timeout
    pub connect_timeout: Duration,

    /// Number of UDP probes sent to open the NAT binding
    pub probe_count: u32,

    /// Delay between successive probes
    pub probe_interval: Duration,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            probe_count: 5,
            probe_interval: Duration::from_millis(200),
        }
    }
}

/// Connectivity establishment when direct reachability is uncertain
pub struct NatTraversal<R> {
    config: TraversalConfig,
    reflector: R,
}

impl<R: EndpointReflector> NatTraversal<R> {
    /// Build a traversal helper over a reflector collaborator
    pub fn new(config: TraversalConfig, reflector: R) -> Self {
        Self { config, reflector }
    }

    /// Establish a TCP stream to `peer`, falling back through the method
    /// ladder.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::TraversalFailed`] with per-method
    /// diagnostics when every method fails.
    pub async fn establish(&self, peer: SocketAddr) -> Result<TcpStream, DiscoveryError> {
        let mut attempts = Vec::new();

        match self.direct(peer).await {
            Ok(stream) => return Ok(stream),
            Err(cause) => {
                tracing::debug!(%peer, %cause, "direct connect failed, punching");
                attempts.push(MethodAttempt {
                    method: "direct",
                    cause,
                });
            }
        }

        match self.hole_punch(peer).await {
            Ok(stream) => return Ok(stream),
            Err(cause) => {
                attempts.push(MethodAttempt {
                    method: "hole-punch",
                    cause,
                });
            }
        }

        Err(DiscoveryError::TraversalFailed { attempts })
    }

    async fn direct(&self, peer: SocketAddr) -> Result<TcpStream, String> {
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            )),
        }
    }

    /// Open a NAT binding toward the peer with outbound probes, then retry
    /// the TCP connect through the freshly punched path.
    async fn hole_punch(&self, peer: SocketAddr) -> Result<TcpStream, String> {
        let public = self.reflector.get_public_endpoint().await;
        match public {
            Some(endpoint) => tracing::debug!(%endpoint, "punching from reflected endpoint"),
            None => tracing::debug!("no reflection service reachable, punching blind"),
        }

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| format!("probe socket: {e}"))?;
        for _ in 0..self.config.probe_count {
            if let Err(e) = socket.send_to(PUNCH_PROBE, peer).await {
                tracing::debug!("punch probe failed: {e}");
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }

        self.direct(peer).await.map_err(|cause| {
            let reflected = match public {
                Some(endpoint) => format!("reflected endpoint {endpoint}"),
                None => "no reflected endpoint".to_string(),
            };
            format!("tcp retry after {} probes ({reflected}): {cause}", self.config.probe_count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflector::UdpEchoReflector;
    use tokio::net::TcpListener;

    fn fast_config() -> TraversalConfig {
        TraversalConfig {
            connect_timeout: Duration::from_millis(300),
            probe_count: 3,
            probe_interval: Duration::from_millis(20),
        }
    }

    fn dead_reflector() -> UdpEchoReflector {
        UdpEchoReflector::new(
            vec!["127.0.0.1:9".parse().unwrap()],
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn direct_connect_short_circuits() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let traversal = NatTraversal::new(fast_config(), dead_reflector());
        let stream = traversal.establish(addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn unreachable_peer_reports_every_method() {
        // A bound-then-dropped port is very likely to refuse connections.
        let unreachable = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let traversal = NatTraversal::new(fast_config(), dead_reflector());
        let err = traversal.establish(unreachable).await.unwrap_err();

        match err {
            DiscoveryError::TraversalFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].method, "direct");
                assert_eq!(attempts[1].method, "hole-punch");
                assert!(!attempts[1].cause.is_empty());
            }
            other => panic!("expected TraversalFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn probes_reach_the_peer_address() {
        // Stand in for the peer with a bare UDP socket; TCP to the same
        // port refuses, forcing the punch path.
        let peer_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_udp.local_addr().unwrap();

        let traversal = NatTraversal::new(fast_config(), dead_reflector());
        let establish = tokio::spawn(async move { traversal.establish(peer_addr).await });

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer_udp.recv_from(&mut buf))
            .await
            .expect("no punch probe arrived")
            .unwrap();
        assert_eq!(&buf[..len], PUNCH_PROBE);

        // The overall attempt still fails: nothing listens on TCP.
        assert!(establish.await.unwrap().is_err());
    }
}
