//! Virtual interface collaborator.
//!
//! The OS-level adapter (TUN/TAP, Hyper-V switch, ...) is an external
//! collaborator: this engine only needs create/configure/cleanup plus a
//! packet path. `ChannelInterface` is the in-memory implementation used by
//! tests and the CLI diagnostics mode; a production adapter implements the
//! same trait against the real OS mechanism.

use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

/// Adapter failures. These typically require remediation outside the engine
/// and are fatal to the operation that needed the interface.
#[derive(Debug, Error)]
pub enum InterfaceError {
    /// Adapter could not be created
    #[error("adapter creation failed: {0}")]
    Create(String),

    /// Adapter exists but could not be configured
    #[error("adapter configuration failed: {0}")]
    Configure(String),

    /// The adapter's packet path is gone
    #[error("interface channel closed")]
    Closed,
}

/// Capacity of the in-memory packet channels
const PACKET_CHANNEL_CAPACITY: usize = 1024;

/// A created adapter's packet path.
///
/// `inject` pushes a tunneled packet toward the local network stack;
/// `outbound` yields packets the stack wants delivered to peers.
pub struct InterfaceHandle {
    name: String,
    to_stack: mpsc::Sender<Vec<u8>>,
    from_stack: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl InterfaceHandle {
    /// Adapter name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver a decrypted tunnel packet to the local stack.
    ///
    /// # Errors
    ///
    /// [`InterfaceError::Closed`] when the adapter is gone.
    pub async fn inject(&self, packet: Vec<u8>) -> Result<(), InterfaceError> {
        self.to_stack
            .send(packet)
            .await
            .map_err(|_| InterfaceError::Closed)
    }

    /// Next packet the local stack wants tunneled, or `None` when the
    /// adapter is gone
    pub async fn outbound(&self) -> Option<Vec<u8>> {
        self.from_stack.lock().await.recv().await
    }
}

/// OS adapter collaborator contract
pub trait VirtualInterface: Send + Sync {
    /// Create the adapter and return its packet path.
    ///
    /// # Errors
    ///
    /// [`InterfaceError::Create`] when the adapter cannot be brought up.
    fn create(&self) -> Result<Arc<InterfaceHandle>, InterfaceError>;

    /// Assign the virtual address to the adapter.
    ///
    /// # Errors
    ///
    /// [`InterfaceError::Configure`] when the address cannot be applied.
    fn configure(&self, handle: &InterfaceHandle, ip: Ipv4Addr) -> Result<(), InterfaceError>;

    /// Tear the adapter down. Best effort - failures are logged by the
    /// implementation, not surfaced.
    fn cleanup(&self, handle: &InterfaceHandle);
}

/// The stack-side endpoints of a [`ChannelInterface`] adapter.
///
/// `delivered` receives what the engine injects; `outbound` feeds packets
/// into the engine as if the local stack had emitted them.
pub struct StackTap {
    /// Packets the engine delivered to the "stack"
    pub delivered: mpsc::Receiver<Vec<u8>>,
    /// Sender for packets the "stack" wants tunneled
    pub outbound: mpsc::Sender<Vec<u8>>,
}

/// In-memory adapter: both packet directions are plain channels.
pub struct ChannelInterface {
    taps: std::sync::Mutex<Vec<StackTap>>,
    configured: std::sync::Mutex<Vec<Ipv4Addr>>,
}

impl ChannelInterface {
    /// New in-memory adapter factory
    #[must_use]
    pub fn new() -> Self {
        Self {
            taps: std::sync::Mutex::new(Vec::new()),
            configured: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Take the stack tap of the most recently created adapter
    #[must_use]
    pub fn take_tap(&self) -> Option<StackTap> {
        self.taps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop()
    }

    /// Addresses that have been configured on created adapters
    #[must_use]
    pub fn configured_ips(&self) -> Vec<Ipv4Addr> {
        self.configured
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for ChannelInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualInterface for ChannelInterface {
    fn create(&self) -> Result<Arc<InterfaceHandle>, InterfaceError> {
        let (to_stack_tx, to_stack_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (from_stack_tx, from_stack_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);

        self.taps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(StackTap {
                delivered: to_stack_rx,
                outbound: from_stack_tx,
            });

        Ok(Arc::new(InterfaceHandle {
            name: "haven0".to_string(),
            to_stack: to_stack_tx,
            from_stack: Mutex::new(from_stack_rx),
        }))
    }

    fn configure(&self, handle: &InterfaceHandle, ip: Ipv4Addr) -> Result<(), InterfaceError> {
        tracing::debug!(adapter = handle.name(), %ip, "configuring virtual interface");
        self.configured
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(ip);
        Ok(())
    }

    fn cleanup(&self, handle: &InterfaceHandle) {
        tracing::debug!(adapter = handle.name(), "cleaning up virtual interface");
    }
}

/// Destination address of an IPv4 packet, if the header is intact.
///
/// Used to route outbound packets from the adapter to the owning peer.
#[must_use]
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ))
}
