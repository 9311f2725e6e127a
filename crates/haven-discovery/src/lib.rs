//! # HAVEN Discovery
//!
//! Peer discovery layer for the HAVEN virtual LAN.
//!
//! This crate provides:
//! - Presence broadcast and listen on a well-known UDP port
//! - A peer registry with silence-based reaping
//! - Public-endpoint reflection (collaborator trait)
//! - NAT traversal: direct connect, then UDP hole punch and retry
//!
//! Discovery and traversal are independent: discovery tells you *who* is on
//! the subnet, traversal gets you a TCP stream to a peer whose reachability
//! is uncertain.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod nat;
pub mod presence;
pub mod reflector;
pub mod service;

pub use error::{DiscoveryError, MethodAttempt};
pub use nat::{NatTraversal, TraversalConfig};
pub use presence::{PeerRecord, PresenceMessage};
pub use reflector::{EndpointReflector, UdpEchoReflector};
pub use service::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};

/// Well-known presence broadcast port
pub const DISCOVERY_PORT: u16 = 5000;
