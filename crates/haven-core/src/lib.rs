//! # HAVEN Core
//!
//! Peer lifecycle engine for the HAVEN virtual LAN: per-peer connection
//! state machines, packet forwarding through admission-controlled queues,
//! bandwidth fairness, quality monitoring, and closed-loop recovery and
//! optimization.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                        │
//! │   (state machines, accept loop, per-peer workers)          │
//! ├───────────────┬──────────────┬──────────────┬──────────────┤
//! │ TrafficShaper │ Bandwidth    │ Quality      │ Recovery /   │
//! │ (QoS queues)  │ Allocator    │ Monitor      │ Optimizer    │
//! ├───────────────┴──────────────┴──────────────┴──────────────┤
//! │     Registries (peers, connections, virtual IP pool)       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Discovery feeds candidate peers in; the manager drives the secure
//! channel (directly or through NAT traversal) and, on success, registers
//! the peer with every QoS component. The optimizer and recovery loops
//! observe the monitor and mutate policy or reconnect as needed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod advisor;
pub mod allocator;
pub mod directory;
pub mod error;
pub mod interface;
pub mod manager;
pub mod monitor;
pub mod optimizer;
pub mod peer;
pub mod recovery;
pub mod registry;
pub mod shaper;

pub use advisor::{
    HeuristicAdvisor, NetworkConditions, OptimizationSuggestion, StrategyAdvisor, TunableParameter,
};
pub use allocator::{AllocatorConfig, BandwidthAllocation, BandwidthAllocator};
pub use directory::{HostDirectory, SavedHost};
pub use error::CoreError;
pub use interface::{ChannelInterface, InterfaceError, InterfaceHandle, StackTap, VirtualInterface};
pub use manager::{ConnectionEvent, ConnectionManager, ManagerConfig};
pub use monitor::{MonitorConfig, QualityMetrics, QualityMonitor, stability_score};
pub use optimizer::{AutoOptimizer, OptimizationOutcome, OptimizerConfig, performance_score};
pub use peer::{ConnectionState, ConnectionStatus, PeerId};
pub use recovery::{RecoveryConfig, RecoverySupervisor};
pub use registry::{IpPool, Registries};
pub use shaper::{
    MAX_PRIORITY, PacketDirection, QoSPolicy, ShaperConfig, ShapingStats, TrafficShaper,
};
