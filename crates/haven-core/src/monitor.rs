//! Rolling quality metrics and the stability score.
//!
//! Each monitored peer keeps a bounded window of latency, loss, and
//! utilization samples. Jitter is the mean absolute delta between
//! successive latency samples. The stability score is a fixed weighted
//! combination that is monotonic by construction: more latency, jitter, or
//! loss never raises it; more throughput never lowers it (up to the
//! saturation cap).

use crate::peer::PeerId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Latency at or beyond which the latency component bottoms out
const LATENCY_FLOOR_MS: f64 = 200.0;
/// Jitter at or beyond which the jitter component bottoms out
const JITTER_FLOOR_MS: f64 = 50.0;
/// Loss ratio scale; 5% loss zeroes the loss component
const LOSS_SCALE: f64 = 20.0;
/// Utilization at which the throughput component saturates, bytes/s
const THROUGHPUT_CAP: f64 = 1024.0 * 1024.0;

/// Score weights: latency, loss, jitter, throughput
const WEIGHTS: [f64; 4] = [0.35, 0.30, 0.20, 0.15];

/// Composite quality score in `[0, 1]`.
///
/// Monotonic: non-increasing in `avg_latency_ms`, `jitter_ms`, and
/// `packet_loss`; non-decreasing in `bandwidth_utilization` up to the
/// saturation cap.
#[must_use]
pub fn stability_score(
    avg_latency_ms: f64,
    jitter_ms: f64,
    packet_loss: f64,
    bandwidth_utilization: f64,
) -> f64 {
    let latency_score = (1.0 - avg_latency_ms.max(0.0) / LATENCY_FLOOR_MS).max(0.0);
    let loss_score = (1.0 - packet_loss.clamp(0.0, 1.0) * LOSS_SCALE).max(0.0);
    let jitter_score = (1.0 - jitter_ms.max(0.0) / JITTER_FLOOR_MS).max(0.0);
    let throughput_score = (bandwidth_utilization.max(0.0) / THROUGHPUT_CAP).min(1.0);

    let score = WEIGHTS[0] * latency_score
        + WEIGHTS[1] * loss_score
        + WEIGHTS[2] * jitter_score
        + WEIGHTS[3] * throughput_score;
    score.clamp(0.0, 1.0)
}

/// Snapshot of one peer's rolling quality state
#[derive(Debug, Clone)]
pub struct QualityMetrics {
    /// Mean latency over the window, ms
    pub avg_latency_ms: f64,
    /// Mean absolute successive-latency delta, ms
    pub jitter_ms: f64,
    /// Mean loss ratio over the window, `[0, 1]`
    pub packet_loss: f64,
    /// Mean observed throughput over the window, bytes/s
    pub bandwidth_utilization: f64,
    /// Composite score, `[0, 1]`
    pub stability_score: f64,
    /// When the most recent sample arrived; monotonic per peer
    pub timestamp: Instant,
}

/// Monitor tuning
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Samples kept per peer
    pub window: usize,
    /// A peer silent for longer than this is dropped from monitoring
    pub stale_timeout: Duration,
    /// Sweep cadence for stale peers
    pub sweep_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: 30,
            stale_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

struct PeerWindow {
    latencies: VecDeque<f64>,
    losses: VecDeque<f64>,
    utilizations: VecDeque<f64>,
    last_update: Instant,
}

impl PeerWindow {
    fn new() -> Self {
        Self {
            latencies: VecDeque::new(),
            losses: VecDeque::new(),
            utilizations: VecDeque::new(),
            last_update: Instant::now(),
        }
    }
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn successive_delta_mean(values: &VecDeque<f64>) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let deltas: f64 = values
        .iter()
        .zip(values.iter().skip(1))
        .map(|(a, b)| (b - a).abs())
        .sum();
    deltas / (values.len() - 1) as f64
}

/// Rolling per-peer quality windows
pub struct QualityMonitor {
    config: MonitorConfig,
    windows: DashMap<PeerId, PeerWindow>,
}

impl QualityMonitor {
    /// New monitor with the given tuning
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Start tracking a peer
    pub fn register(&self, peer: &str) {
        self.windows.insert(peer.to_string(), PeerWindow::new());
    }

    /// Stop tracking a peer
    pub fn deregister(&self, peer: &str) {
        self.windows.remove(peer);
    }

    /// Whether a peer is currently tracked
    #[must_use]
    pub fn is_tracked(&self, peer: &str) -> bool {
        self.windows.contains_key(peer)
    }

    /// Fold one measurement into the peer's window. Unknown peers are
    /// ignored.
    pub fn record_sample(&self, peer: &str, latency_ms: f64, loss: f64, utilization: f64) {
        if let Some(mut entry) = self.windows.get_mut(peer) {
            let window = entry.value_mut();
            window.latencies.push_back(latency_ms.max(0.0));
            window.losses.push_back(loss.clamp(0.0, 1.0));
            window.utilizations.push_back(utilization.max(0.0));
            while window.latencies.len() > self.config.window {
                window.latencies.pop_front();
                window.losses.pop_front();
                window.utilizations.pop_front();
            }
            window.last_update = Instant::now();
        }
    }

    /// Current metrics snapshot for a peer, `None` while untracked or empty
    #[must_use]
    pub fn metrics(&self, peer: &str) -> Option<QualityMetrics> {
        let entry = self.windows.get(peer)?;
        let window = entry.value();
        if window.latencies.is_empty() {
            return None;
        }

        let avg_latency_ms = mean(&window.latencies);
        let jitter_ms = successive_delta_mean(&window.latencies);
        let packet_loss = mean(&window.losses);
        let bandwidth_utilization = mean(&window.utilizations);

        Some(QualityMetrics {
            avg_latency_ms,
            jitter_ms,
            packet_loss,
            bandwidth_utilization,
            stability_score: stability_score(
                avg_latency_ms,
                jitter_ms,
                packet_loss,
                bandwidth_utilization,
            ),
            timestamp: window.last_update,
        })
    }

    /// Drop peers that have gone silent past the stale timeout, returning
    /// the dropped names
    pub fn sweep_stale(&self) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .windows
            .iter()
            .filter(|entry| entry.value().last_update.elapsed() > self.config.stale_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for peer in &stale {
            self.windows.remove(peer);
            tracing::info!(peer = %peer, "peer silent beyond timeout, dropped from monitoring");
        }
        stale
    }

    /// Periodic stale sweep, until `stop` flips
    pub async fn run_sweeper(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let _ = self.sweep_stale();
                }
            }
        }
    }
}
