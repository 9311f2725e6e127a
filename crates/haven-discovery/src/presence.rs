//! Presence wire format and peer records.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

/// Presence datagram, JSON on the wire.
///
/// `port` is the announcing host's tunnel listen port, so a discovered peer
/// is directly connectable without a side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMessage {
    /// Announcing host's name
    pub name: String,
    /// Announcing host's LAN address
    pub ip: IpAddr,
    /// Announcing host's tunnel listen port
    pub port: u16,
    /// Message discriminator, always "presence"
    #[serde(rename = "type")]
    pub kind: String,
}

impl PresenceMessage {
    /// Discriminator value for presence datagrams
    pub const KIND: &'static str = "presence";

    /// Build a presence announcement
    #[must_use]
    pub fn new(name: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            ip,
            port,
            kind: Self::KIND.to_string(),
        }
    }

    /// Whether the discriminator marks this as a presence datagram
    #[must_use]
    pub fn is_presence(&self) -> bool {
        self.kind == Self::KIND
    }
}

/// A known peer, created on first presence receipt and dropped after the
/// silence timeout
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer's announced name
    pub name: String,
    /// Peer's LAN address
    pub ip: IpAddr,
    /// Peer's tunnel listen port
    pub port: u16,
    /// Last time a presence datagram from this peer arrived
    pub last_seen: Instant,
}

impl PeerRecord {
    /// Build a record from a presence message received just now
    #[must_use]
    pub fn from_presence(msg: &PresenceMessage) -> Self {
        Self {
            name: msg.name.clone(),
            ip: msg.ip,
            port: msg.port,
            last_seen: Instant::now(),
        }
    }

    /// The peer's tunnel endpoint
    #[must_use]
    pub fn endpoint(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_matches_protocol() {
        let msg = PresenceMessage::new("gamer-box", "192.168.1.7".parse().unwrap(), 12345);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["name"], "gamer-box");
        assert_eq!(json["ip"], "192.168.1.7");
        assert_eq!(json["port"], 12345);
        assert_eq!(json["type"], "presence");
    }

    #[test]
    fn foreign_kind_is_not_presence() {
        let json = r#"{"name":"x","ip":"10.1.1.1","port":1,"type":"farewell"}"#;
        let msg: PresenceMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_presence());
    }

    #[test]
    fn record_endpoint_combines_ip_and_port() {
        let msg = PresenceMessage::new("host", "10.1.2.3".parse().unwrap(), 9000);
        let record = PeerRecord::from_presence(&msg);
        assert_eq!(record.endpoint().to_string(), "10.1.2.3:9000");
    }
}
