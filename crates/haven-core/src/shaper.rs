//! Per-peer traffic shaping and QoS policy.
//!
//! Each registered peer owns one admission-controlled queue carrying both
//! traffic directions, so the peer's bandwidth ceiling governs its aggregate
//! rate. Within the queue, higher stamped priority is served first and FIFO
//! order holds inside a priority class; scheduling *across* peers is the
//! bandwidth allocator's business, never the shaper's.
//!
//! Admission decisions (budget, staleness) are made against the policy
//! current at dequeue time. A packet dropped as stale or on overflow is a
//! policy outcome counted in [`ShapingStats`], not an error, and is never
//! reported per-packet.

use crate::peer::PeerId;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Highest allowed scheduling priority
pub const MAX_PRIORITY: u8 = 9;

/// Per-peer quality-of-service policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QoSPolicy {
    /// Scheduling priority within the peer's queue, 0-9
    pub priority: u8,
    /// Bandwidth ceiling in bytes/s; 0 means unlimited
    pub bandwidth_limit: u64,
    /// Maximum tolerated queueing delay in ms; 0 means best-effort
    pub latency_target_ms: u64,
}

impl QoSPolicy {
    /// Build a policy; priority is clamped into `0..=`[`MAX_PRIORITY`]
    #[must_use]
    pub fn new(priority: u8, bandwidth_limit: u64, latency_target_ms: u64) -> Self {
        Self {
            priority: priority.min(MAX_PRIORITY),
            bandwidth_limit,
            latency_target_ms,
        }
    }
}

/// Which way a queued packet is headed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    /// Decrypted tunnel payload bound for the virtual interface
    Inbound,
    /// Local stack payload bound for the peer's tunnel
    Outbound,
}

/// A packet admitted to a peer's queue
#[derive(Debug)]
pub struct QueuedPacket {
    /// Direction this packet travels on dequeue
    pub direction: PacketDirection,
    /// Payload bytes
    pub data: Vec<u8>,
    /// Arrival timestamp, judged against `latency_target_ms` at dequeue
    pub enqueued_at: Instant,
    priority: u8,
    seq: u64,
}

impl PartialEq for QueuedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedPacket {}

impl PartialOrd for QueuedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Shaper tuning
#[derive(Debug, Clone)]
pub struct ShaperConfig {
    /// Window over which the bandwidth budget is accounted
    pub measurement_interval: Duration,
    /// Queue admission bound per peer
    pub max_queue_packets: usize,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            measurement_interval: Duration::from_millis(100),
            max_queue_packets: 4096,
        }
    }
}

/// Aggregate shaping outcomes for one peer
#[derive(Debug, Clone, Default)]
pub struct ShapingStats {
    /// Bytes dequeued for delivery
    pub bytes_sent: u64,
    /// Packets dequeued for delivery
    pub packets_sent: u64,
    /// Packets dropped for exceeding the latency target
    pub packets_dropped_stale: u64,
    /// Packets refused at admission because the queue was full
    pub packets_dropped_overflow: u64,
    /// Observed delivery rate over the last completed interval, bytes/s
    pub current_rate: f64,
}

struct PeerQueue {
    policy: QoSPolicy,
    /// Fair-share ceiling pushed by the allocator; applies only while the
    /// policy carries no explicit operator limit
    allocated_ceiling: u64,
    heap: BinaryHeap<QueuedPacket>,
    next_seq: u64,
    interval_start: Instant,
    /// Budget accounting with carry: overshoot in one interval debits the
    /// next, so usage over any longer window stays within the limit plus
    /// at most one packet
    window_bytes: u64,
    /// Bytes delivered since the last rollover, for the rate estimate
    sent_since_rollover: u64,
    stats: ShapingStats,
}

impl PeerQueue {
    fn new(policy: QoSPolicy) -> Self {
        Self {
            policy,
            allocated_ceiling: 0,
            heap: BinaryHeap::new(),
            next_seq: 0,
            interval_start: Instant::now(),
            window_bytes: 0,
            sent_since_rollover: 0,
            stats: ShapingStats::default(),
        }
    }

    fn effective_limit(&self) -> u64 {
        if self.policy.bandwidth_limit > 0 {
            self.policy.bandwidth_limit
        } else {
            self.allocated_ceiling
        }
    }
}

/// Admission-controlled packet queues, one per registered peer
pub struct TrafficShaper {
    config: ShaperConfig,
    queues: DashMap<PeerId, PeerQueue>,
}

impl TrafficShaper {
    /// New shaper with the given tuning
    #[must_use]
    pub fn new(config: ShaperConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
        }
    }

    /// Register a peer with its initial policy. Re-registration resets the
    /// queue.
    pub fn register(&self, peer: &str, policy: QoSPolicy) {
        self.queues.insert(peer.to_string(), PeerQueue::new(policy));
    }

    /// Drop a peer's queue and policy
    pub fn deregister(&self, peer: &str) {
        self.queues.remove(peer);
    }

    /// Append a packet to the peer's queue, stamped with the arrival time
    /// and the current policy priority.
    ///
    /// Returns false when the peer is unknown or the queue is full (counted
    /// as an overflow drop).
    pub fn enqueue(&self, peer: &str, direction: PacketDirection, data: Vec<u8>) -> bool {
        let Some(mut entry) = self.queues.get_mut(peer) else {
            tracing::debug!(peer, "enqueue for unregistered peer dropped");
            return false;
        };
        let q = entry.value_mut();

        if q.heap.len() >= self.config.max_queue_packets {
            q.stats.packets_dropped_overflow += 1;
            return false;
        }

        let packet = QueuedPacket {
            direction,
            data,
            enqueued_at: Instant::now(),
            priority: q.policy.priority,
            seq: q.next_seq,
        };
        q.next_seq += 1;
        q.heap.push(packet);
        true
    }

    /// Replace the peer's policy atomically. Queued packets keep their
    /// stamped priority; admission checks use the new policy from the next
    /// dequeue on.
    ///
    /// Returns false when the peer is unknown.
    pub fn update_policy(&self, peer: &str, policy: QoSPolicy) -> bool {
        match self.queues.get_mut(peer) {
            Some(mut entry) => {
                entry.value_mut().policy = policy;
                true
            }
            None => false,
        }
    }

    /// The peer's current policy
    #[must_use]
    pub fn policy(&self, peer: &str) -> Option<QoSPolicy> {
        self.queues.get(peer).map(|entry| entry.value().policy)
    }

    /// Push the allocator's fair-share ceiling for a peer
    pub fn set_rate_ceiling(&self, peer: &str, bytes_per_sec: u64) {
        if let Some(mut entry) = self.queues.get_mut(peer) {
            entry.value_mut().allocated_ceiling = bytes_per_sec;
        }
    }

    /// One shaping pass: dequeue every packet currently admissible under
    /// the peer's bandwidth budget, dropping stale packets along the way.
    #[must_use]
    pub fn drain_ready(&self, peer: &str) -> Vec<QueuedPacket> {
        let Some(mut entry) = self.queues.get_mut(peer) else {
            return Vec::new();
        };
        let q = entry.value_mut();
        let now = Instant::now();
        let interval = self.config.measurement_interval;

        let limit = q.effective_limit();
        let budget = if limit == 0 {
            u64::MAX
        } else {
            (limit as f64 * interval.as_secs_f64()).max(1.0) as u64
        };

        let elapsed = now.duration_since(q.interval_start);
        if elapsed >= interval {
            q.stats.current_rate = q.sent_since_rollover as f64 / elapsed.as_secs_f64();
            q.sent_since_rollover = 0;
            q.interval_start = now;

            // Refill: one budget per elapsed interval, carrying overshoot
            // forward as debt.
            if limit == 0 {
                q.window_bytes = 0;
            } else {
                let periods = (elapsed.as_secs_f64() / interval.as_secs_f64()) as u64;
                q.window_bytes = q.window_bytes.saturating_sub(budget.saturating_mul(periods));
            }
        }

        let mut out = Vec::new();
        while let Some(top) = q.heap.peek() {
            let target = q.policy.latency_target_ms;
            if target > 0 && now.duration_since(top.enqueued_at).as_millis() as u64 > target {
                q.heap.pop();
                q.stats.packets_dropped_stale += 1;
                continue;
            }
            if q.window_bytes >= budget {
                break;
            }
            if let Some(packet) = q.heap.pop() {
                let len = packet.data.len() as u64;
                q.window_bytes = q.window_bytes.saturating_add(len);
                q.sent_since_rollover += len;
                q.stats.bytes_sent += len;
                q.stats.packets_sent += 1;
                out.push(packet);
            }
        }
        out
    }

    /// Aggregate shaping outcomes for a peer
    #[must_use]
    pub fn stats(&self, peer: &str) -> Option<ShapingStats> {
        self.queues.get(peer).map(|entry| entry.value().stats.clone())
    }

    /// Number of packets waiting in a peer's queue
    #[must_use]
    pub fn queue_depth(&self, peer: &str) -> usize {
        self.queues
            .get(peer)
            .map_or(0, |entry| entry.value().heap.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shaper() -> TrafficShaper {
        TrafficShaper::new(ShaperConfig::default())
    }

    fn payload(n: usize) -> Vec<u8> {
        vec![0xAB; n]
    }

    #[test]
    fn priority_is_clamped() {
        let policy = QoSPolicy::new(42, 0, 0);
        assert_eq!(policy.priority, MAX_PRIORITY);
    }

    #[test]
    fn fifo_within_one_priority_class() {
        let s = shaper();
        s.register("p", QoSPolicy::default());

        for i in 0u8..5 {
            assert!(s.enqueue("p", PacketDirection::Inbound, vec![i]));
        }
        let drained = s.drain_ready("p");
        let order: Vec<u8> = drained.iter().map(|pkt| pkt.data[0]).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn higher_stamped_priority_overtakes_backlog() {
        let s = shaper();
        s.register("p", QoSPolicy::new(1, 0, 0));

        s.enqueue("p", PacketDirection::Inbound, vec![1]);
        s.enqueue("p", PacketDirection::Inbound, vec![2]);

        // Raise the policy priority; new arrivals outrank the backlog.
        s.update_policy("p", QoSPolicy::new(7, 0, 0));
        s.enqueue("p", PacketDirection::Inbound, vec![3]);

        let order: Vec<u8> = s.drain_ready("p").iter().map(|pkt| pkt.data[0]).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn bandwidth_budget_bounds_one_interval() {
        let s = TrafficShaper::new(ShaperConfig {
            measurement_interval: Duration::from_millis(100),
            ..ShaperConfig::default()
        });
        // 1000 B/s over a 100ms interval = 100 B budget.
        s.register("p", QoSPolicy::new(0, 1000, 0));

        for _ in 0..5 {
            s.enqueue("p", PacketDirection::Outbound, payload(60));
        }

        // 60 admitted, 120 crosses the budget after the second packet.
        let first = s.drain_ready("p");
        assert_eq!(first.len(), 2);

        // Same interval: budget already spent, nothing more flows.
        let second = s.drain_ready("p");
        assert!(second.is_empty());
        assert_eq!(s.queue_depth("p"), 3);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let s = shaper();
        s.register("p", QoSPolicy::default());

        for _ in 0..100 {
            s.enqueue("p", PacketDirection::Inbound, payload(1500));
        }
        assert_eq!(s.drain_ready("p").len(), 100);
    }

    #[test]
    fn stale_packets_drop_against_current_policy() {
        let s = shaper();
        // Enqueued under best-effort; the stricter target applies at
        // dequeue time.
        s.register("p", QoSPolicy::default());
        s.enqueue("p", PacketDirection::Inbound, payload(10));
        s.enqueue("p", PacketDirection::Inbound, payload(10));

        s.update_policy("p", QoSPolicy::new(0, 0, 1));
        std::thread::sleep(Duration::from_millis(20));

        assert!(s.drain_ready("p").is_empty());
        let stats = s.stats("p").unwrap();
        assert_eq!(stats.packets_dropped_stale, 2);
        assert_eq!(stats.packets_sent, 0);
    }

    #[test]
    fn overflow_is_counted_not_errored() {
        let s = TrafficShaper::new(ShaperConfig {
            max_queue_packets: 2,
            ..ShaperConfig::default()
        });
        s.register("p", QoSPolicy::default());

        assert!(s.enqueue("p", PacketDirection::Inbound, payload(1)));
        assert!(s.enqueue("p", PacketDirection::Inbound, payload(1)));
        assert!(!s.enqueue("p", PacketDirection::Inbound, payload(1)));
        assert_eq!(s.stats("p").unwrap().packets_dropped_overflow, 1);
    }

    #[test]
    fn allocator_ceiling_applies_only_without_operator_limit() {
        let s = TrafficShaper::new(ShaperConfig {
            measurement_interval: Duration::from_millis(100),
            ..ShaperConfig::default()
        });
        s.register("p", QoSPolicy::default());
        s.set_rate_ceiling("p", 1000); // 100 B per interval

        for _ in 0..5 {
            s.enqueue("p", PacketDirection::Outbound, payload(60));
        }
        assert_eq!(s.drain_ready("p").len(), 2);

        // An explicit operator limit overrides the allocator ceiling.
        s.register("q", QoSPolicy::new(0, 10_000, 0));
        s.set_rate_ceiling("q", 100);
        for _ in 0..5 {
            s.enqueue("q", PacketDirection::Outbound, payload(60));
        }
        // 10 kB/s over 100ms = 1000 B budget, all five fit.
        assert_eq!(s.drain_ready("q").len(), 5);
    }

    #[test]
    fn unknown_peer_enqueue_is_a_noop() {
        let s = shaper();
        assert!(!s.enqueue("ghost", PacketDirection::Inbound, payload(1)));
        assert!(s.drain_ready("ghost").is_empty());
        assert!(s.policy("ghost").is_none());
    }
}
