//! Presence broadcast, listen, and reap loops.
//!
//! Three independent tasks share one UDP socket and one peer table: a
//! broadcaster announcing this host, a listener folding incoming presence
//! datagrams into the table, and a reaper dropping peers that fall silent.
//! All three check a stop signal every cycle and a failure in any single
//! cycle is logged and survived, never fatal to the loop.

use crate::DISCOVERY_PORT;
use crate::error::DiscoveryError;
use crate::presence::{PeerRecord, PresenceMessage};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Discovery service configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local bind address
    pub bind_addr: IpAddr,

    /// Well-known listen port; a bind conflict falls back to an OS-chosen
    /// port
    pub port: u16,

    /// Where presence datagrams are sent (subnet broadcast by default)
    pub broadcast_target: SocketAddr,

    /// How often presence is announced
    pub broadcast_interval: Duration,

    /// A peer silent for longer than this is dropped
    pub peer_timeout: Duration,

    /// How often the peer table is swept for silent peers
    pub reap_interval: Duration,

    /// Event channel capacity
    pub event_buffer: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DISCOVERY_PORT,
            broadcast_target: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DISCOVERY_PORT,
            ),
            broadcast_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(1),
            event_buffer: 64,
        }
    }
}

/// Peer table change notifications
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A previously unknown peer announced itself
    Discovered(PeerRecord),
    /// A known peer fell silent past the timeout; carries the peer name
    Lost(String),
}

/// Broadcasts presence and maintains the peer registry
pub struct DiscoveryService {
    peers: Arc<DashMap<String, PeerRecord>>,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Bind the discovery socket and spawn the broadcast, listen, and reap
    /// loops.
    ///
    /// Returns the service handle and the event receiver.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Socket`] if no socket can be bound at all;
    /// a conflict on the well-known port alone is survived by falling back
    /// to an OS-chosen port.
    pub async fn start(
        config: DiscoveryConfig,
        announcement: PresenceMessage,
    ) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>), DiscoveryError> {
        let socket = match UdpSocket::bind((config.bind_addr, config.port)).await {
            Ok(socket) => socket,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(
                    port = config.port,
                    "discovery port in use, falling back to an OS-chosen port: {e}"
                );
                UdpSocket::bind((config.bind_addr, 0)).await?
            }
            Err(e) => return Err(e.into()),
        };
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let peers: Arc<DashMap<String, PeerRecord>> = Arc::new(DashMap::new());
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (stop_tx, stop_rx) = watch::channel(false);

        tracing::info!(%local_addr, name = %announcement.name, "discovery started");

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(broadcast_loop(
            Arc::clone(&socket),
            announcement.clone(),
            config.broadcast_target,
            config.broadcast_interval,
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(listen_loop(
            Arc::clone(&socket),
            announcement.name.clone(),
            Arc::clone(&peers),
            event_tx.clone(),
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(reap_loop(
            Arc::clone(&peers),
            config.peer_timeout,
            config.reap_interval,
            event_tx,
            stop_rx,
        )));

        Ok((
            Self {
                peers,
                local_addr,
                stop: stop_tx,
                tasks,
            },
            event_rx,
        ))
    }

    /// The address the discovery socket actually bound (reflects any
    /// fallback port)
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the currently known peers
    #[must_use]
    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Signal all loops to exit and wait for them
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("discovery stopped");
    }
}

async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    announcement: PresenceMessage,
    target: SocketAddr,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    // The announcement never changes; serialize once.
    let body = match serde_json::to_vec(&announcement) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("presence announcement does not serialize: {e}");
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&body, target).await {
                    tracing::warn!("presence broadcast failed: {e}");
                }
            }
        }
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    own_name: String,
    peers: Arc<DashMap<String, PeerRecord>>,
    events: mpsc::Sender<DiscoveryEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        handle_datagram(&buf[..len], from, &own_name, &peers, &events);
                    }
                    Err(e) => {
                        tracing::warn!("discovery receive error: {e}");
                    }
                }
            }
        }
    }
}

fn handle_datagram(
    data: &[u8],
    from: SocketAddr,
    own_name: &str,
    peers: &DashMap<String, PeerRecord>,
    events: &mpsc::Sender<DiscoveryEvent>,
) {
    let msg: PresenceMessage = match serde_json::from_slice(data) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(%from, "dropping malformed discovery datagram: {e}");
            return;
        }
    };

    if !msg.is_presence() {
        tracing::debug!(%from, kind = %msg.kind, "ignoring non-presence datagram");
        return;
    }
    if msg.name == own_name {
        // Our own broadcast reflected back.
        return;
    }

    let record = PeerRecord::from_presence(&msg);
    let is_new = peers.insert(msg.name.clone(), record.clone()).is_none();
    if is_new {
        tracing::info!(peer = %msg.name, ip = %msg.ip, "discovered peer");
        if events
            .try_send(DiscoveryEvent::Discovered(record))
            .is_err()
        {
            tracing::warn!(peer = %msg.name, "discovery event channel full, dropping event");
        }
    }
}

async fn reap_loop(
    peers: Arc<DashMap<String, PeerRecord>>,
    timeout: Duration,
    interval: Duration,
    events: mpsc::Sender<DiscoveryEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let expired: Vec<String> = peers
                    .iter()
                    .filter(|entry| entry.value().last_seen.elapsed() > timeout)
                    .map(|entry| entry.key().clone())
                    .collect();

                for name in expired {
                    if peers.remove(&name).is_some() {
                        tracing::info!(peer = %name, "peer fell silent, removing");
                        if events.try_send(DiscoveryEvent::Lost(name.clone())).is_err() {
                            tracing::warn!(peer = %name, "discovery event channel full, dropping event");
                        }
                    }
                }
            }
        }
    }
}
