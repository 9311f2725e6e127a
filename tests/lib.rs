//! Shared helpers for HAVEN integration tests.

use haven_core::{ChannelInterface, ConnectionManager, ManagerConfig, VirtualInterface};
use haven_discovery::TraversalConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Manager configuration tightened for fast, loopback-only tests
#[must_use]
pub fn fast_manager_config() -> ManagerConfig {
    ManagerConfig {
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        handshake_timeout: Duration::from_secs(5),
        shaping_tick: Duration::from_millis(10),
        sampling_interval: Duration::from_millis(50),
        traversal: TraversalConfig {
            connect_timeout: Duration::from_millis(300),
            probe_count: 2,
            probe_interval: Duration::from_millis(10),
        },
        ..ManagerConfig::default()
    }
}

/// A manager over a fresh in-memory interface, plus the interface factory
/// for packet taps
#[must_use]
pub fn manager_with_interface() -> (ConnectionManager, Arc<ChannelInterface>) {
    let interface = Arc::new(ChannelInterface::new());
    let dyn_interface: Arc<dyn VirtualInterface> = interface.clone();
    let manager = ConnectionManager::new(fast_manager_config(), dyn_interface);
    (manager, interface)
}
