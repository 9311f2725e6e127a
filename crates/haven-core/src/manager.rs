//! Connection manager: per-peer state machines and packet forwarding.
//!
//! Owns the registries, drives secure channel establishment (direct or
//! NAT-assisted), and runs the per-connection workers: a reader decrypting
//! tunnel frames into the shaper, a shaping cycle delivering admitted
//! packets to the virtual interface or the tunnel, and a sampler feeding
//! the quality monitor with echo round trips. Every worker checks its stop
//! signal at each blocking boundary; teardown force-closes the socket to
//! unblock pending reads.
//!
//! Frame layout inside the encrypted stream: one kind byte, then payload.
//! Kind 0 is data; kinds 1/2 are echo request/reply carrying an 8-byte
//! timestamp used for RTT measurement.

use crate::advisor::{HeuristicAdvisor, StrategyAdvisor};
use crate::allocator::{AllocatorConfig, BandwidthAllocator};
use crate::error::CoreError;
use crate::interface::{InterfaceHandle, VirtualInterface, ipv4_destination};
use crate::monitor::{MonitorConfig, QualityMonitor};
use crate::optimizer::{AutoOptimizer, OptimizerConfig};
use crate::peer::{ConnectionState, ConnectionStatus, PeerId};
use crate::recovery::{RecoveryConfig, RecoverySupervisor};
use crate::registry::Registries;
use crate::shaper::{PacketDirection, QoSPolicy, ShaperConfig, TrafficShaper};
use dashmap::DashMap;
use haven_discovery::{DiscoveryEvent, NatTraversal, PeerRecord, TraversalConfig, UdpEchoReflector};
use haven_tunnel::{Role, SecureReader, SecureWriter, TunnelError, split_secure};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Data frame kind byte
const FRAME_DATA: u8 = 0;
/// Echo request kind byte (RTT probe)
const FRAME_ECHO_REQUEST: u8 = 1;
/// Echo reply kind byte
const FRAME_ECHO_REPLY: u8 = 2;

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Virtual network the address pool allocates from
    pub virtual_network: Ipv4Addr,
    /// Bind address for the hosting listener
    pub listen_addr: IpAddr,
    /// Connect + authentication deadline
    pub handshake_timeout: Duration,
    /// Shaping cycle cadence per peer
    pub shaping_tick: Duration,
    /// Quality sampling cadence per peer
    pub sampling_interval: Duration,
    /// NAT traversal tuning
    pub traversal: TraversalConfig,
    /// Ordered public-endpoint reflection servers
    pub reflectors: Vec<SocketAddr>,
    /// Per-server reflection timeout
    pub reflect_timeout: Duration,
    /// Shaper tuning
    pub shaper: ShaperConfig,
    /// Allocator tuning
    pub allocator: AllocatorConfig,
    /// Monitor tuning
    pub monitor: MonitorConfig,
    /// Optimizer tuning
    pub optimizer: OptimizerConfig,
    /// Recovery tuning
    pub recovery: RecoveryConfig,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            virtual_network: Ipv4Addr::new(10, 0, 0, 0),
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            handshake_timeout: haven_tunnel::HANDSHAKE_TIMEOUT,
            shaping_tick: Duration::from_millis(25),
            sampling_interval: Duration::from_secs(1),
            traversal: TraversalConfig::default(),
            reflectors: Vec::new(),
            reflect_timeout: Duration::from_secs(2),
            shaper: ShaperConfig::default(),
            allocator: AllocatorConfig::default(),
            monitor: MonitorConfig::default(),
            optimizer: OptimizerConfig::default(),
            recovery: RecoveryConfig::default(),
            event_capacity: 128,
        }
    }
}

/// Lifecycle notifications fanned out to subscribers
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Tunnel established; carries the allocated virtual address
    Established {
        /// Peer the tunnel reaches
        peer: PeerId,
        /// Virtual address allocated for the tunnel
        virtual_ip: Ipv4Addr,
    },
    /// Connect or host-side admission attempt failed; exactly one per
    /// attempt
    Failed {
        /// Peer the attempt targeted
        peer: PeerId,
        /// Human-readable cause
        reason: String,
    },
    /// Tunnel torn down; exactly one per live connection
    Closed {
        /// Peer whose tunnel closed
        peer: PeerId,
    },
    /// Connection flagged by a socket error or failed health check
    Degraded {
        /// Affected peer
        peer: PeerId,
    },
    /// Recovery rebuilt the tunnel
    Recovered {
        /// Repaired peer
        peer: PeerId,
    },
    /// Recovery exhausted its retry bound; terminal
    RecoveryFailed {
        /// Peer whose connection is now closed for good
        peer: PeerId,
    },
}

/// Per-link RTT bookkeeping
struct EchoTracker {
    epoch: Instant,
    pending: StdMutex<Option<u64>>,
    last_rtt_ms: StdMutex<Option<f64>>,
}

impl EchoTracker {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            pending: StdMutex::new(None),
            last_rtt_ms: StdMutex::new(None),
        }
    }

    fn micros_now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn note_sent(&self, seq: u64) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(seq);
    }

    /// Returns 1.0 (lost) when the previous probe went unanswered
    fn take_loss(&self) -> f64 {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.take().is_some() { 1.0 } else { 0.0 }
    }

    fn on_reply(&self, payload: &[u8]) {
        let Ok(bytes) = <[u8; 8]>::try_from(payload) else {
            return;
        };
        let seq = u64::from_be_bytes(bytes);
        let rtt_ms = (self.micros_now().saturating_sub(seq)) as f64 / 1000.0;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if *pending == Some(seq) {
            *pending = None;
        }
        *self
            .last_rtt_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(rtt_ms);
    }

    fn last_rtt_ms(&self) -> Option<f64> {
        *self
            .last_rtt_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One live tunnel's workers and bookkeeping
struct Link {
    virtual_ip: Ipv4Addr,
    route_ip: Ipv4Addr,
    allocated_by_us: bool,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Stored connect parameters for recovery reconnects
#[derive(Clone)]
struct Credentials {
    endpoint: SocketAddr,
    passphrase: String,
}

struct Hosting {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: ManagerConfig,
    registries: Registries,
    shaper: Arc<TrafficShaper>,
    allocator: Arc<BandwidthAllocator>,
    monitor: Arc<QualityMonitor>,
    optimizer: AutoOptimizer,
    interface: Arc<dyn VirtualInterface>,
    interface_handle: StdMutex<Option<Arc<InterfaceHandle>>>,
    events: broadcast::Sender<ConnectionEvent>,
    links: DashMap<PeerId, Link>,
    route: Arc<DashMap<Ipv4Addr, PeerId>>,
    credentials: DashMap<PeerId, Credentials>,
    hosting: Mutex<Option<Hosting>>,
    stop: watch::Sender<bool>,
}

/// Owns per-peer connection state machines and the packet path
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Build a manager with the default heuristic advisor
    #[must_use]
    pub fn new(config: ManagerConfig, interface: Arc<dyn VirtualInterface>) -> Self {
        Self::with_advisor(config, interface, Arc::new(HeuristicAdvisor::new()))
    }

    /// Build a manager with a custom strategy advisor and spawn the
    /// background loops (allocator passes, stale-metric sweeps, recovery
    /// checks)
    #[must_use]
    pub fn with_advisor(
        config: ManagerConfig,
        interface: Arc<dyn VirtualInterface>,
        advisor: Arc<dyn StrategyAdvisor>,
    ) -> Self {
        let shaper = Arc::new(TrafficShaper::new(config.shaper.clone()));
        let allocator = Arc::new(BandwidthAllocator::new(config.allocator.clone()));
        let monitor = Arc::new(QualityMonitor::new(config.monitor.clone()));
        let optimizer = AutoOptimizer::new(
            config.optimizer.clone(),
            Arc::clone(&shaper),
            Arc::clone(&monitor),
            advisor,
        );
        let (events, _) = broadcast::channel(config.event_capacity);
        let (stop, stop_rx) = watch::channel(false);

        let manager = Self {
            inner: Arc::new(ManagerInner {
                registries: Registries::new(config.virtual_network),
                shaper,
                allocator,
                monitor,
                optimizer,
                interface,
                interface_handle: StdMutex::new(None),
                events,
                links: DashMap::new(),
                route: Arc::new(DashMap::new()),
                credentials: DashMap::new(),
                hosting: Mutex::new(None),
                stop,
                config,
            }),
        };

        manager.spawn_background(stop_rx);
        manager
    }

    fn spawn_background(&self, stop: watch::Receiver<bool>) {
        // Allocator pass: nudge weights, then push fair-share ceilings into
        // the shaper.
        {
            let manager = self.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(manager.inner.allocator.recompute_interval());
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = ticker.tick() => {
                            manager.inner.allocator.recompute();
                            for (peer, alloc) in manager.inner.allocator.allocations() {
                                manager
                                    .inner
                                    .shaper
                                    .set_rate_ceiling(&peer, alloc.guaranteed + alloc.burst);
                            }
                        }
                    }
                }
            });
        }

        // Stale-metric sweep.
        {
            let monitor = Arc::clone(&self.inner.monitor);
            let stop = stop.clone();
            tokio::spawn(async move {
                monitor.run_sweeper(stop).await;
            });
        }

        // Recovery supervision.
        {
            let supervisor = RecoverySupervisor::new(self.inner.config.recovery.clone());
            let manager = self.clone();
            tokio::spawn(async move {
                supervisor.run(manager, stop).await;
            });
        }
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine; events are best-effort fan-out.
        let _ = self.inner.events.send(event);
    }

    /// The quality monitor feeding recovery and optimization
    #[must_use]
    pub fn monitor(&self) -> &Arc<QualityMonitor> {
        &self.inner.monitor
    }

    /// The per-peer traffic shaper
    #[must_use]
    pub fn shaper(&self) -> &Arc<TrafficShaper> {
        &self.inner.shaper
    }

    /// The bandwidth allocator
    #[must_use]
    pub fn allocator(&self) -> &Arc<BandwidthAllocator> {
        &self.inner.allocator
    }

    /// The adaptive QoS optimizer
    #[must_use]
    pub fn optimizer(&self) -> &AutoOptimizer {
        &self.inner.optimizer
    }

    /// The shared registries
    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    /// The host's own virtual address (`.1`, never reassigned)
    #[must_use]
    pub fn host_ip(&self) -> Ipv4Addr {
        self.inner.registries.host_ip()
    }

    /// Peers currently forwarding
    #[must_use]
    pub fn active_peers(&self) -> Vec<PeerId> {
        self.inner.registries.peers_in_status(ConnectionStatus::Active)
    }

    /// Peers flagged degraded and awaiting recovery
    #[must_use]
    pub fn degraded_peers(&self) -> Vec<PeerId> {
        self.inner
            .registries
            .peers_in_status(ConnectionStatus::Degraded)
    }

    /// A peer's current lifecycle status
    #[must_use]
    pub fn status(&self, peer: &str) -> Option<ConnectionStatus> {
        self.inner.registries.connection(peer).map(|s| s.status)
    }

    /// Replace a peer's QoS policy (operator path; the optimizer uses the
    /// same mechanism)
    pub fn update_qos_policy(&self, peer: &str, policy: QoSPolicy) -> bool {
        self.inner.shaper.update_policy(peer, policy)
    }

    /// Whether the accept loop is running
    pub async fn is_hosting(&self) -> bool {
        self.inner.hosting.lock().await.is_some()
    }

    /// Fold discovery events into the peer registry until the channel
    /// closes or the manager shuts down
    pub fn attach_discovery(&self, mut events: mpsc::Receiver<DiscoveryEvent>) {
        let manager = self.clone();
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    event = events.recv() => {
                        match event {
                            Some(DiscoveryEvent::Discovered(record)) => {
                                manager.inner.registries.upsert_peer(record);
                            }
                            Some(DiscoveryEvent::Lost(name)) => {
                                manager.inner.registries.remove_peer(&name);
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    /// Create the adapter on first use, configure the given address on it,
    /// and start the outbound pump
    fn ensure_interface(&self, ip: Ipv4Addr) -> Result<Arc<InterfaceHandle>, CoreError> {
        let handle = {
            let mut guard = self
                .inner
                .interface_handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(handle) => Arc::clone(handle),
                None => {
                    let handle = self.inner.interface.create()?;
                    *guard = Some(Arc::clone(&handle));

                    let pump_handle = Arc::clone(&handle);
                    let route = Arc::clone(&self.inner.route);
                    let shaper = Arc::clone(&self.inner.shaper);
                    let mut stop = self.inner.stop.subscribe();
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = stop.changed() => break,
                                packet = pump_handle.outbound() => {
                                    let Some(packet) = packet else { break };
                                    route_outbound(&route, &shaper, packet);
                                }
                            }
                        }
                    });
                    handle
                }
            }
        };
        self.inner.interface.configure(&handle, ip)?;
        Ok(handle)
    }

    fn interface_handle(&self) -> Option<Arc<InterfaceHandle>> {
        self.inner
            .interface_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ---------------------------------------------------------------- host

    /// Open the listener and spawn the accept loop. Each accepted socket is
    /// authenticated on its own task before promotion to Active.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyHosting`] on a second call, interface or bind
    /// failures otherwise.
    pub async fn start_hosting(&self, port: u16, passphrase: &str) -> Result<SocketAddr, CoreError> {
        let mut hosting = self.inner.hosting.lock().await;
        if hosting.is_some() {
            return Err(CoreError::AlreadyHosting);
        }

        let host_ip = self.inner.registries.host_ip();
        self.ensure_interface(host_ip)?;

        let listener = TcpListener::bind((self.inner.config.listen_addr, port)).await?;
        let local_addr = listener.local_addr()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let manager = self.clone();
        let pass = passphrase.to_string();
        let task = tokio::spawn(accept_loop(manager, listener, pass, stop_rx));

        *hosting = Some(Hosting {
            local_addr,
            stop: stop_tx,
            task,
        });

        tracing::info!(%local_addr, "hosting started");
        Ok(local_addr)
    }

    /// Stop the accept loop, disconnect every peer, close the listener.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotHosting`] when no accept loop is running.
    pub async fn stop_hosting(&self) -> Result<(), CoreError> {
        let hosting = {
            let mut guard = self.inner.hosting.lock().await;
            guard.take().ok_or(CoreError::NotHosting)?
        };

        let _ = hosting.stop.send(true);
        let _ = hosting.task.await;

        for peer in self.connected_peers() {
            let _ = self.disconnect(&peer).await;
        }

        tracing::info!(local_addr = %hosting.local_addr, "hosting stopped");
        Ok(())
    }

    // ------------------------------------------------------------- connect

    /// Connect to a discovered peer
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect_to_host`].
    pub async fn connect_to_peer(
        &self,
        record: &PeerRecord,
        passphrase: &str,
    ) -> Result<Ipv4Addr, CoreError> {
        self.inner.registries.upsert_peer(record.clone());
        self.connect_internal(record.name.clone(), record.endpoint(), passphrase)
            .await
    }

    /// Connect to a host by address: NAT traversal when the direct path
    /// fails, then the authenticated handshake. On success the peer is
    /// registered with the shaper, allocator, monitor, and recovery, and
    /// `Established` is emitted; on failure exactly one `Failed` event
    /// carries the cause.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyConnected`] for a duplicate connect (logged
    /// no-op, no event), [`CoreError::Tunnel`] for authentication failures
    /// (terminal), [`CoreError::Discovery`] when every traversal method
    /// fails.
    pub async fn connect_to_host(
        &self,
        ip: IpAddr,
        port: u16,
        passphrase: &str,
    ) -> Result<Ipv4Addr, CoreError> {
        let peer_id = format!("host-{ip}:{port}");
        self.connect_internal(peer_id, SocketAddr::new(ip, port), passphrase)
            .await
    }

    async fn connect_internal(
        &self,
        peer_id: PeerId,
        endpoint: SocketAddr,
        passphrase: &str,
    ) -> Result<Ipv4Addr, CoreError> {
        if self.inner.links.contains_key(&peer_id) {
            tracing::warn!(peer = %peer_id, "duplicate connect request ignored");
            return Err(CoreError::AlreadyConnected(peer_id));
        }

        self.inner
            .registries
            .insert_connection(ConnectionState::new(peer_id.clone(), endpoint))?;

        match self.dial_and_join(&peer_id, endpoint, passphrase).await {
            Ok(ip) => Ok(ip),
            Err(e) => {
                self.abandon_connection(&peer_id);
                self.emit(ConnectionEvent::Failed {
                    peer: peer_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Dial (direct, then NAT-assisted), authenticate, and bring the link up
    async fn dial_and_join(
        &self,
        peer_id: &str,
        endpoint: SocketAddr,
        passphrase: &str,
    ) -> Result<Ipv4Addr, CoreError> {
        let reflector = UdpEchoReflector::new(
            self.inner.config.reflectors.clone(),
            self.inner.config.reflect_timeout,
        );
        let traversal = NatTraversal::new(self.inner.config.traversal.clone(), reflector);
        let mut stream = traversal.establish(endpoint).await?;

        self.inner
            .registries
            .transition(peer_id, ConnectionStatus::Authenticating)?;

        let handshake = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            haven_tunnel::initiate(&mut stream, passphrase),
        )
        .await
        .map_err(|_| {
            CoreError::ConnectionFailed(format!(
                "authentication with {endpoint} timed out"
            ))
        })??;
        let (key, virtual_ip) = handshake;

        self.ensure_interface(virtual_ip)?;
        let (reader, writer) = split_secure(stream, &key, Role::Initiator);

        // Everything addressed to the host side of the network leaves
        // through this link.
        let route_ip = self.inner.registries.host_ip();
        self.finalize_link(
            peer_id,
            endpoint,
            passphrase,
            virtual_ip,
            route_ip,
            false,
            reader,
            writer,
        );
        Ok(virtual_ip)
    }

    // ---------------------------------------------------------- disconnect

    /// Tear down a peer's tunnel: close the socket, release the virtual
    /// address, emit `Closed`. Idempotent - disconnecting an unknown or
    /// already-closed peer is a no-op with no duplicate event.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for surfacing
    /// teardown failures.
    pub async fn disconnect(&self, peer: &str) -> Result<(), CoreError> {
        let Some((_, link)) = self.inner.links.remove(peer) else {
            tracing::debug!(peer, "disconnect for unknown or closed peer is a no-op");
            return Ok(());
        };

        self.teardown_link(peer, link, true).await;
        self.inner.credentials.remove(peer);

        if let Some(state) = self.inner.registries.connection(peer) {
            if !state.status.is_closed() {
                let _ = self
                    .inner
                    .registries
                    .transition(peer, ConnectionStatus::Closed);
            }
        }
        self.inner.registries.remove_connection(peer);

        self.emit(ConnectionEvent::Closed {
            peer: peer.to_string(),
        });
        tracing::info!(peer, "disconnected");
        Ok(())
    }

    /// Peers with a live link (any non-closed phase)
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.links.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop workers, drop routes, deregister from the QoS components
    async fn teardown_link(&self, peer: &str, mut link: Link, release_ip: bool) {
        let _ = link.stop.send(true);
        for task in link.tasks.drain(..) {
            // Workers select on the stop signal; abort also unblocks any
            // read still parked on the socket.
            task.abort();
        }

        let _ = self.inner.optimizer.stop(peer).await;
        self.inner.route.remove(&link.route_ip);
        self.inner.shaper.deregister(peer);
        self.inner.allocator.deregister(peer);
        self.inner.monitor.deregister(peer);

        if release_ip && link.allocated_by_us {
            self.inner.registries.release_ip(link.virtual_ip);
        }
    }

    fn abandon_connection(&self, peer: &str) {
        if let Some(state) = self.inner.registries.connection(peer) {
            if !state.status.is_closed() {
                let _ = self
                    .inner
                    .registries
                    .transition(peer, ConnectionStatus::Closed);
            }
        }
        self.inner.registries.remove_connection(peer);
    }

    // ------------------------------------------------------------ recovery

    /// Demote a peer into recovery: mark it Recovering and tear down the
    /// broken link while keeping the connection entry and credentials.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownPeer`] / [`CoreError::InvalidTransition`] when
    /// the peer is not in a recoverable phase.
    pub(crate) async fn begin_recovery(&self, peer: &str) -> Result<(), CoreError> {
        // Health checks demote Active peers; socket errors already left
        // the connection Degraded.
        if self.status(peer) == Some(ConnectionStatus::Active) {
            self.mark_degraded(peer);
        }
        self.inner
            .registries
            .transition(peer, ConnectionStatus::Recovering)?;

        if let Some((_, link)) = self.inner.links.remove(peer) {
            self.teardown_link(peer, link, true).await;
        }
        Ok(())
    }

    /// One reconnect attempt for a peer in the Recovering phase.
    ///
    /// # Errors
    ///
    /// Propagates dial/authentication failures; the caller owns the retry
    /// bound.
    pub(crate) async fn attempt_reconnect(&self, peer: &str) -> Result<(), CoreError> {
        let credentials = self
            .inner
            .credentials
            .get(peer)
            .map(|c| c.value().clone())
            .ok_or_else(|| CoreError::UnknownPeer(peer.to_string()))?;

        self.inner.registries.with_connection(peer, |state| {
            state.retry_count += 1;
        });

        let reflector = UdpEchoReflector::new(
            self.inner.config.reflectors.clone(),
            self.inner.config.reflect_timeout,
        );
        let traversal = NatTraversal::new(self.inner.config.traversal.clone(), reflector);
        let mut stream = traversal.establish(credentials.endpoint).await?;

        let (key, virtual_ip) = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            haven_tunnel::initiate(&mut stream, &credentials.passphrase),
        )
        .await
        .map_err(|_| {
            CoreError::ConnectionFailed(format!(
                "re-authentication with {} timed out",
                credentials.endpoint
            ))
        })??;

        self.ensure_interface(virtual_ip)?;
        let (reader, writer) = split_secure(stream, &key, Role::Initiator);
        let route_ip = self.inner.registries.host_ip();
        self.finalize_link(
            peer,
            credentials.endpoint,
            &credentials.passphrase,
            virtual_ip,
            route_ip,
            false,
            reader,
            writer,
        );

        self.emit(ConnectionEvent::Recovered {
            peer: peer.to_string(),
        });
        Ok(())
    }

    /// Terminal recovery failure: the connection ends Closed and is never
    /// retried automatically again
    pub(crate) async fn fail_recovery(&self, peer: &str, attempts: u32) {
        if let Some((_, link)) = self.inner.links.remove(peer) {
            self.teardown_link(peer, link, true).await;
        }
        self.inner.credentials.remove(peer);

        let _ = self
            .inner
            .registries
            .transition(peer, ConnectionStatus::Closed);
        self.inner.registries.remove_connection(peer);

        let error = CoreError::RecoveryExhausted {
            peer: peer.to_string(),
            attempts,
        };
        tracing::error!(peer, "{error}");
        self.emit(ConnectionEvent::RecoveryFailed {
            peer: peer.to_string(),
        });
    }

    /// Flag a connection Degraded (socket error or failed health check)
    fn mark_degraded(&self, peer: &str) {
        if self
            .inner
            .registries
            .transition(peer, ConnectionStatus::Degraded)
            .is_ok()
        {
            self.emit(ConnectionEvent::Degraded {
                peer: peer.to_string(),
            });
        }
    }

    // ------------------------------------------------------------ shutdown

    /// Orderly full stop: hosting, links, optimizer loops, background
    /// tasks, adapter
    pub async fn shutdown(&self) {
        let _ = self.inner.stop.send(true);
        let _ = self.stop_hosting().await;
        for peer in self.connected_peers() {
            let _ = self.disconnect(&peer).await;
        }
        self.inner.optimizer.stop_all().await;

        let handle = self
            .inner
            .interface_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            self.inner.interface.cleanup(&handle);
        }
        tracing::info!("connection manager shut down");
    }

    // ---------------------------------------------------------------- link

    /// Register a freshly authenticated tunnel and start its workers
    #[allow(clippy::too_many_arguments)]
    fn finalize_link(
        &self,
        peer: &str,
        endpoint: SocketAddr,
        passphrase: &str,
        virtual_ip: Ipv4Addr,
        route_ip: Ipv4Addr,
        allocated_by_us: bool,
        reader: SecureReader,
        writer: SecureWriter,
    ) {
        let peer_id = peer.to_string();
        let writer = Arc::new(Mutex::new(writer));
        let echo = Arc::new(EchoTracker::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        self.inner.shaper.register(peer, QoSPolicy::default());
        self.inner.allocator.register(peer);
        self.inner.monitor.register(peer);
        self.inner.optimizer.start(peer);
        self.inner.route.insert(route_ip, peer_id.clone());
        self.inner.credentials.insert(
            peer_id.clone(),
            Credentials {
                endpoint,
                passphrase: passphrase.to_string(),
            },
        );

        self.inner.registries.with_connection(peer, |state| {
            state.virtual_ip = Some(virtual_ip);
        });
        if self
            .inner
            .registries
            .transition(peer, ConnectionStatus::Active)
            .is_err()
        {
            // Recovery path arrives via Recovering -> Active; both edges
            // exist, so a failure here means teardown raced us.
            tracing::debug!(peer, "activation raced teardown");
        }

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(reader_loop(
            self.clone(),
            peer_id.clone(),
            reader,
            Arc::clone(&writer),
            Arc::clone(&echo),
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(shaping_loop(
            self.clone(),
            peer_id.clone(),
            Arc::clone(&writer),
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(sampler_loop(
            self.clone(),
            peer_id.clone(),
            Arc::clone(&writer),
            Arc::clone(&echo),
            stop_rx,
        )));

        self.inner.links.insert(
            peer_id.clone(),
            Link {
                virtual_ip,
                route_ip,
                allocated_by_us,
                stop: stop_tx,
                tasks,
            },
        );

        self.emit(ConnectionEvent::Established {
            peer: peer_id,
            virtual_ip,
        });
        tracing::info!(peer, %virtual_ip, "tunnel active");
    }

    /// Socket error on a live link: demote to Degraded and let recovery
    /// take over
    fn handle_link_failure(&self, peer: &str, error: &TunnelError) {
        if error.is_disconnect() {
            tracing::warn!(peer, "tunnel lost mid-session: {error}");
        } else {
            tracing::warn!(peer, "tunnel error mid-session: {error}");
        }
        if self.status(peer) == Some(ConnectionStatus::Active) {
            self.mark_degraded(peer);
        }
    }
}

/// Route an outbound stack packet to the owning peer's queue
fn route_outbound(
    route: &DashMap<Ipv4Addr, PeerId>,
    shaper: &TrafficShaper,
    packet: Vec<u8>,
) {
    let Some(destination) = ipv4_destination(&packet) else {
        tracing::debug!("outbound packet without parsable IPv4 header dropped");
        return;
    };
    match route.get(&destination) {
        Some(peer) => {
            shaper.enqueue(peer.value(), PacketDirection::Outbound, packet);
        }
        None => {
            tracing::debug!(%destination, "no route for outbound packet, dropped");
        }
    }
}

async fn accept_loop(
    manager: ConnectionManager,
    listener: TcpListener,
    passphrase: String,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        tokio::spawn(handle_inbound(
                            manager.clone(),
                            socket,
                            addr,
                            passphrase.clone(),
                        ));
                    }
                    Err(e) => {
                        // Transient accept errors must never kill the loop.
                        tracing::warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Authenticate one inbound socket and promote it to a live link
async fn handle_inbound(
    manager: ConnectionManager,
    mut socket: TcpStream,
    addr: SocketAddr,
    passphrase: String,
) {
    let peer_id = format!("peer-{addr}");

    if let Err(e) = manager
        .inner
        .registries
        .insert_connection(ConnectionState::new(peer_id.clone(), addr))
    {
        tracing::warn!(peer = %peer_id, "inbound connection rejected: {e}");
        return;
    }

    let admitted: Result<(), CoreError> = async {
        manager
            .inner
            .registries
            .transition(&peer_id, ConnectionStatus::Authenticating)?;

        let pending = tokio::time::timeout(
            manager.inner.config.handshake_timeout,
            haven_tunnel::respond(&mut socket, &passphrase),
        )
        .await
        .map_err(|_| CoreError::ConnectionFailed(format!("authentication with {addr} timed out")))??;

        let virtual_ip = match manager.inner.registries.allocate_ip() {
            Ok(ip) => ip,
            Err(e) => {
                let _ = pending.reject(&mut socket).await;
                return Err(e);
            }
        };

        let key = match pending.accept(&mut socket, virtual_ip).await {
            Ok(key) => key,
            Err(e) => {
                manager.inner.registries.release_ip(virtual_ip);
                return Err(e.into());
            }
        };

        let (reader, writer) = split_secure(socket, &key, Role::Responder);
        manager.finalize_link(
            &peer_id,
            addr,
            &passphrase,
            virtual_ip,
            virtual_ip,
            true,
            reader,
            writer,
        );
        Ok(())
    }
    .await;

    if let Err(e) = admitted {
        tracing::warn!(peer = %peer_id, "inbound admission failed: {e}");
        manager.abandon_connection(&peer_id);
        manager.emit(ConnectionEvent::Failed {
            peer: peer_id,
            reason: e.to_string(),
        });
    }
}

/// Decrypt tunnel frames into the shaper; answer echo probes
async fn reader_loop(
    manager: ConnectionManager,
    peer: PeerId,
    mut reader: SecureReader,
    writer: Arc<Mutex<SecureWriter>>,
    echo: Arc<EchoTracker>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.changed() => break,
            frame = reader.recv() => frame,
        };

        match frame {
            Ok(frame) => {
                let Some((&kind, payload)) = frame.split_first() else {
                    continue;
                };
                match kind {
                    FRAME_DATA => {
                        manager.inner.shaper.enqueue(
                            &peer,
                            PacketDirection::Inbound,
                            payload.to_vec(),
                        );
                    }
                    FRAME_ECHO_REQUEST => {
                        let mut reply = Vec::with_capacity(1 + payload.len());
                        reply.push(FRAME_ECHO_REPLY);
                        reply.extend_from_slice(payload);
                        if writer.lock().await.send(&reply).await.is_err() {
                            tracing::debug!(peer = %peer, "echo reply failed");
                        }
                    }
                    FRAME_ECHO_REPLY => echo.on_reply(payload),
                    other => {
                        tracing::debug!(peer = %peer, kind = other, "unknown frame kind dropped");
                    }
                }
            }
            Err(e) => {
                if !*stop.borrow() {
                    manager.handle_link_failure(&peer, &e);
                }
                break;
            }
        }
    }
}

/// Dequeue admitted packets toward the interface or the tunnel
async fn shaping_loop(
    manager: ConnectionManager,
    peer: PeerId,
    writer: Arc<Mutex<SecureWriter>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(manager.inner.config.shaping_tick);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                for packet in manager.inner.shaper.drain_ready(&peer) {
                    match packet.direction {
                        PacketDirection::Inbound => {
                            let Some(handle) = manager.interface_handle() else {
                                continue;
                            };
                            if handle.inject(packet.data).await.is_err() {
                                tracing::warn!(peer = %peer, "interface rejected packet");
                            }
                        }
                        PacketDirection::Outbound => {
                            let mut frame = Vec::with_capacity(1 + packet.data.len());
                            frame.push(FRAME_DATA);
                            frame.extend_from_slice(&packet.data);
                            if writer.lock().await.send(&frame).await.is_err() {
                                // The reader sees the same failure and
                                // demotes the link.
                                tracing::debug!(peer = %peer, "tunnel write failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Probe RTT and feed the monitor and allocator with observations
async fn sampler_loop(
    manager: ConnectionManager,
    peer: PeerId,
    writer: Arc<Mutex<SecureWriter>>,
    echo: Arc<EchoTracker>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(manager.inner.config.sampling_interval);
    // The first tick fires immediately; skip it so the first probe has a
    // full interval to come back.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let loss = echo.take_loss();
                let latency = echo.last_rtt_ms().unwrap_or(0.0);
                let utilization = manager
                    .inner
                    .shaper
                    .stats(&peer)
                    .map_or(0.0, |stats| stats.current_rate);

                manager
                    .inner
                    .monitor
                    .record_sample(&peer, latency, loss, utilization);
                manager.inner.allocator.record_usage(&peer, utilization);

                let seq = echo.micros_now();
                let mut probe = Vec::with_capacity(9);
                probe.push(FRAME_ECHO_REQUEST);
                probe.extend_from_slice(&seq.to_be_bytes());
                if writer.lock().await.send(&probe).await.is_ok() {
                    echo.note_sent(seq);
                }
            }
        }
    }
}
