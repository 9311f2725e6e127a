//! Bandwidth fairness across peers.
//!
//! Total link capacity is split by weight. On every recomputation pass each
//! peer's recent usage (moving average of the last 10 samples) is compared
//! against its current fair share: under 80% utilisation nudges the weight
//! up 10%, over 90% nudges it down 10%, and all fair shares are then
//! recomputed simultaneously from the updated weight sum so weights stay
//! comparable across peers. Guaranteed bandwidth is 20% of fair share,
//! burst the remaining 80%.

use crate::peer::PeerId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Weight bounds; weights live in `(0, 1]`
const MIN_WEIGHT: f64 = 0.01;
const MAX_WEIGHT: f64 = 1.0;

/// Share of fair share that is guaranteed vs. burst
const GUARANTEED_FRACTION: f64 = 0.2;
const BURST_FRACTION: f64 = 0.8;

/// Usage-vs-share thresholds for weight nudges
const UNDERUSE_THRESHOLD: f64 = 0.8;
const OVERUSE_THRESHOLD: f64 = 0.9;

/// A peer's current slice of the link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthAllocation {
    /// Always-available floor, bytes/s
    pub guaranteed: u64,
    /// Opportunistic headroom above the floor, bytes/s
    pub burst: u64,
    /// Fairness weight in `(0, 1]`
    pub weight: f64,
}

/// Allocator tuning
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Total link capacity to distribute, bytes/s
    pub total_bandwidth: u64,
    /// How often fair shares are recomputed
    pub recompute_interval: Duration,
    /// Usage samples kept per peer for the moving average
    pub history_len: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_bandwidth: 10 * 1024 * 1024, // 10 MB/s
            recompute_interval: Duration::from_secs(1),
            history_len: 10,
        }
    }
}

struct PeerShare {
    weight: f64,
    usage: VecDeque<f64>,
    allocation: BandwidthAllocation,
}

/// Distributes total link capacity across active peers by weight
pub struct BandwidthAllocator {
    config: AllocatorConfig,
    shares: Mutex<HashMap<PeerId, PeerShare>>,
}

impl BandwidthAllocator {
    /// New allocator over the configured capacity
    #[must_use]
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            shares: Mutex::new(HashMap::new()),
        }
    }

    /// The recomputation cadence callers should drive [`recompute`] at
    #[must_use]
    pub fn recompute_interval(&self) -> Duration {
        self.config.recompute_interval
    }

    /// Register a peer with the default starting weight
    pub fn register(&self, peer: &str) {
        let initial = BandwidthAllocation {
            guaranteed: (self.config.total_bandwidth as f64 * GUARANTEED_FRACTION) as u64,
            burst: (self.config.total_bandwidth as f64 * BURST_FRACTION) as u64,
            weight: 0.5,
        };
        self.shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                peer.to_string(),
                PeerShare {
                    weight: 0.5,
                    usage: VecDeque::new(),
                    allocation: initial,
                },
            );
    }

    /// Drop a peer from allocation
    pub fn deregister(&self, peer: &str) {
        self.shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    /// Feed one observed usage sample (bytes/s) into the peer's history
    pub fn record_usage(&self, peer: &str, bytes_per_sec: f64) {
        let mut shares = self.shares.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(share) = shares.get_mut(peer) {
            share.usage.push_back(bytes_per_sec);
            while share.usage.len() > self.config.history_len {
                share.usage.pop_front();
            }
        }
    }

    /// One fairness pass: nudge weights against recent usage, then
    /// recompute every peer's fair share from the updated weight sum.
    pub fn recompute(&self) {
        let mut shares = self.shares.lock().unwrap_or_else(PoisonError::into_inner);
        if shares.is_empty() {
            return;
        }

        let total = self.config.total_bandwidth as f64;
        let old_weight_sum: f64 = shares.values().map(|s| s.weight).sum();

        // Phase 1: judge usage against the *current* fair share and nudge.
        for share in shares.values_mut() {
            let fair_share = share.weight / old_weight_sum * total;
            let avg_usage = if share.usage.is_empty() {
                0.0
            } else {
                share.usage.iter().sum::<f64>() / share.usage.len() as f64
            };

            if avg_usage < fair_share * UNDERUSE_THRESHOLD {
                share.weight *= 1.1;
            } else if avg_usage > fair_share * OVERUSE_THRESHOLD {
                share.weight *= 0.9;
            }
            share.weight = share.weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
        }

        // Phase 2: all fair shares from the updated sum, simultaneously.
        let new_weight_sum: f64 = shares.values().map(|s| s.weight).sum();
        for share in shares.values_mut() {
            let fair_share = share.weight / new_weight_sum * total;
            share.allocation = BandwidthAllocation {
                guaranteed: (fair_share * GUARANTEED_FRACTION) as u64,
                burst: (fair_share * BURST_FRACTION) as u64,
                weight: share.weight,
            };
        }
    }

    /// A peer's current allocation
    #[must_use]
    pub fn allocation(&self, peer: &str) -> Option<BandwidthAllocation> {
        self.shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|share| share.allocation)
    }

    /// Snapshot of all current allocations
    #[must_use]
    pub fn allocations(&self) -> Vec<(PeerId, BandwidthAllocation)> {
        self.shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(peer, share)| (peer.clone(), share.allocation))
            .collect()
    }
}
