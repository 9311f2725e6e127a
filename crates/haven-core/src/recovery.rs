//! Degraded-connection detection and bounded repair.
//!
//! A periodic health check flags peers whose loss or latency crossed the
//! recovery thresholds. Repair is disconnect, short delay, reconnect -
//! bounded by `max_retries`. Exhausting the bound is terminal: the
//! connection ends Closed and is never retried automatically again.

use crate::manager::ConnectionManager;
use crate::monitor::QualityMetrics;
use crate::peer::PeerId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Recovery tuning
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Health check cadence
    pub check_interval: Duration,
    /// Delay between reconnect attempts
    pub retry_delay: Duration,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
    /// Loss ratio beyond which a peer is unhealthy
    pub loss_threshold: f64,
    /// Latency beyond which a peer is unhealthy, ms
    pub latency_threshold_ms: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
            max_retries: 3,
            loss_threshold: 0.5,
            latency_threshold_ms: 1000.0,
        }
    }
}

/// Whether metrics cross either recovery trigger
#[must_use]
pub fn is_unhealthy(metrics: &QualityMetrics, config: &RecoveryConfig) -> bool {
    metrics.packet_loss > config.loss_threshold
        || metrics.avg_latency_ms > config.latency_threshold_ms
}

/// Watches peer health and drives bounded repairs
pub struct RecoverySupervisor {
    config: RecoveryConfig,
    in_flight: Arc<DashMap<PeerId, ()>>,
}

impl RecoverySupervisor {
    /// New supervisor with the given tuning
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Periodic health check loop, until `stop` flips.
    ///
    /// Unhealthy active peers and peers already marked degraded (by
    /// mid-session socket errors) both enter recovery; a peer with a
    /// repair already in flight is skipped.
    pub async fn run(self, manager: ConnectionManager, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => self.check_once(&manager),
            }
        }
    }

    /// One health pass over all peers
    pub fn check_once(&self, manager: &ConnectionManager) {
        for peer in manager.active_peers() {
            let Some(metrics) = manager.monitor().metrics(&peer) else {
                continue;
            };
            if is_unhealthy(&metrics, &self.config) {
                tracing::warn!(
                    peer = %peer,
                    loss = metrics.packet_loss,
                    latency = metrics.avg_latency_ms,
                    "health check failed, starting recovery"
                );
                self.launch(manager.clone(), peer);
            }
        }

        // Socket errors already demoted these; pick them up too.
        for peer in manager.degraded_peers() {
            self.launch(manager.clone(), peer);
        }
    }

    fn launch(&self, manager: ConnectionManager, peer: PeerId) {
        if self.in_flight.insert(peer.clone(), ()).is_some() {
            return;
        }

        let config = self.config.clone();
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            recover(&config, &manager, &peer).await;
            in_flight.remove(&peer);
        });
    }
}

/// One full repair attempt ladder for a single peer
async fn recover(config: &RecoveryConfig, manager: &ConnectionManager, peer: &str) {
    if let Err(e) = manager.begin_recovery(peer).await {
        tracing::debug!(peer, "recovery not started: {e}");
        return;
    }

    for attempt in 1..=config.max_retries {
        tokio::time::sleep(config.retry_delay).await;

        match manager.attempt_reconnect(peer).await {
            Ok(()) => {
                tracing::info!(peer, attempt, "recovery succeeded");
                return;
            }
            Err(e) => {
                tracing::warn!(peer, attempt, "reconnect attempt failed: {e}");
                if e.is_terminal() {
                    break;
                }
            }
        }
    }

    manager.fail_recovery(peer, config.max_retries).await;
}
