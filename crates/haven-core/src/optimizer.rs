//! Closed-loop QoS optimization.
//!
//! Per peer, on a cooldown: ask the advisor for a change, apply it only
//! above the confidence threshold, wait for the link to stabilize, then
//! keep the change if the weighted performance score improved and revert it
//! otherwise. The loop is stoppable at any cycle boundary and reports a
//! final outcome when it stops.

use crate::advisor::{NetworkConditions, OptimizationSuggestion, StrategyAdvisor, TunableParameter};
use crate::monitor::{QualityMetrics, QualityMonitor};
use crate::peer::PeerId;
use crate::shaper::{MAX_PRIORITY, QoSPolicy, TrafficShaper};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Performance score weights: latency, loss, bandwidth, stability
const SCORE_WEIGHTS: [f64; 4] = [0.3, 0.3, 0.2, 0.2];

/// Weighted performance score in `[0, 1]`, the optimizer's keep/revert
/// criterion
#[must_use]
pub fn performance_score(metrics: &QualityMetrics) -> f64 {
    let latency_score = (1.0 - metrics.avg_latency_ms / 200.0).max(0.0);
    let loss_score = (1.0 - metrics.packet_loss * 20.0).max(0.0);
    let bandwidth_score = (metrics.bandwidth_utilization / (1024.0 * 1024.0)).min(1.0);
    let stability = metrics.stability_score;

    SCORE_WEIGHTS[0] * latency_score
        + SCORE_WEIGHTS[1] * loss_score
        + SCORE_WEIGHTS[2] * bandwidth_score
        + SCORE_WEIGHTS[3] * stability
}

/// Optimizer tuning
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Pause between optimization attempts
    pub cooldown: Duration,
    /// Settle time after applying a change, before scoring it
    pub stabilization: Duration,
    /// Suggestions at or below this confidence are never applied
    pub confidence_threshold: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            stabilization: Duration::from_secs(10),
            confidence_threshold: 0.7,
        }
    }
}

/// Final report emitted when a peer's optimization loop stops
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Whether any change survived the keep/revert test
    pub success: bool,
    /// Metrics when the loop started
    pub metrics_before: Option<QualityMetrics>,
    /// Metrics when the loop stopped
    pub metrics_after: Option<QualityMetrics>,
    /// Changes kept, in application order
    pub applied_changes: Vec<(TunableParameter, u64)>,
    /// Relative score improvement over the run
    pub improvement: f64,
}

struct OptimizerSession {
    stop: watch::Sender<bool>,
    handle: JoinHandle<OptimizationOutcome>,
}

/// Per-peer adaptive QoS tuning loops
pub struct AutoOptimizer {
    config: OptimizerConfig,
    shaper: Arc<TrafficShaper>,
    monitor: Arc<QualityMonitor>,
    advisor: Arc<dyn StrategyAdvisor>,
    sessions: DashMap<PeerId, OptimizerSession>,
}

impl AutoOptimizer {
    /// New optimizer wired to the shaper it mutates and the monitor it
    /// scores with
    #[must_use]
    pub fn new(
        config: OptimizerConfig,
        shaper: Arc<TrafficShaper>,
        monitor: Arc<QualityMonitor>,
        advisor: Arc<dyn StrategyAdvisor>,
    ) -> Self {
        Self {
            config,
            shaper,
            monitor,
            advisor,
            sessions: DashMap::new(),
        }
    }

    /// Start the optimization loop for a peer. Returns false when a loop is
    /// already running for it.
    pub fn start(&self, peer: &str) -> bool {
        if self.sessions.contains_key(peer) {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_optimization(
            peer.to_string(),
            self.config.clone(),
            Arc::clone(&self.shaper),
            Arc::clone(&self.monitor),
            Arc::clone(&self.advisor),
            stop_rx,
        ));

        self.sessions.insert(
            peer.to_string(),
            OptimizerSession {
                stop: stop_tx,
                handle,
            },
        );
        tracing::info!(peer, "optimization started");
        true
    }

    /// Stop the peer's loop and collect its final outcome. `None` when no
    /// loop was running.
    pub async fn stop(&self, peer: &str) -> Option<OptimizationOutcome> {
        let (_, session) = self.sessions.remove(peer)?;
        let _ = session.stop.send(true);
        match session.handle.await {
            Ok(outcome) => {
                tracing::info!(
                    peer,
                    success = outcome.success,
                    improvement = outcome.improvement,
                    "optimization stopped"
                );
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!(peer, "optimization task failed: {e}");
                None
            }
        }
    }

    /// Stop every running loop
    pub async fn stop_all(&self) {
        let peers: Vec<PeerId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            let _ = self.stop(&peer).await;
        }
    }

    /// Whether a loop is running for the peer
    #[must_use]
    pub fn is_running(&self, peer: &str) -> bool {
        self.sessions.contains_key(peer)
    }
}

/// Apply a suggestion to a policy, returning the changed copy
fn apply_suggestion(policy: &QoSPolicy, suggestion: &OptimizationSuggestion) -> QoSPolicy {
    let mut next = *policy;
    match suggestion.parameter {
        TunableParameter::Priority => {
            next.priority = u8::try_from(suggestion.suggested_value)
                .unwrap_or(MAX_PRIORITY)
                .min(MAX_PRIORITY);
        }
        TunableParameter::BandwidthLimit => next.bandwidth_limit = suggestion.suggested_value,
        TunableParameter::LatencyTarget => next.latency_target_ms = suggestion.suggested_value,
    }
    next
}

/// Sleep that wakes early when `stop` flips; returns true when stopped
async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        _ = tokio::time::sleep(duration) => *stop.borrow(),
    }
}

async fn run_optimization(
    peer: PeerId,
    config: OptimizerConfig,
    shaper: Arc<TrafficShaper>,
    monitor: Arc<QualityMonitor>,
    advisor: Arc<dyn StrategyAdvisor>,
    mut stop: watch::Receiver<bool>,
) -> OptimizationOutcome {
    let metrics_before = monitor.metrics(&peer);
    let score_before = metrics_before.as_ref().map_or(0.0, performance_score);
    let mut best_score = score_before;
    let mut applied_changes = Vec::new();

    while !*stop.borrow() {
        if let Some(metrics) = monitor.metrics(&peer) {
            let conditions = NetworkConditions::from(&metrics);
            if let Some(prior) = shaper.policy(&peer) {
                if let Some(suggestion) = advisor.suggest(&conditions, &prior) {
                    if suggestion.confidence > config.confidence_threshold {
                        let candidate = apply_suggestion(&prior, &suggestion);
                        shaper.update_policy(&peer, candidate);
                        tracing::debug!(
                            peer = %peer,
                            parameter = %suggestion.parameter,
                            value = suggestion.suggested_value,
                            "trial change applied"
                        );

                        if sleep_or_stop(config.stabilization, &mut stop).await {
                            // Stopped mid-trial: revert, the change was
                            // never scored.
                            shaper.update_policy(&peer, prior);
                            break;
                        }

                        let new_score =
                            monitor.metrics(&peer).as_ref().map_or(0.0, performance_score);
                        if new_score > best_score {
                            best_score = new_score;
                            applied_changes
                                .push((suggestion.parameter, suggestion.suggested_value));
                            advisor.train(&conditions, suggestion.parameter, new_score);
                        } else {
                            shaper.update_policy(&peer, prior);
                            tracing::debug!(peer = %peer, "trial change reverted");
                        }
                    } else {
                        tracing::debug!(
                            peer = %peer,
                            confidence = suggestion.confidence,
                            "suggestion below confidence threshold, skipped"
                        );
                    }
                }
            }
        }

        if sleep_or_stop(config.cooldown, &mut stop).await {
            break;
        }
    }

    let metrics_after = monitor.metrics(&peer);
    let improvement = if best_score > 0.0 {
        (best_score - score_before) / best_score
    } else {
        0.0
    };

    OptimizationOutcome {
        success: !applied_changes.is_empty(),
        metrics_before,
        metrics_after,
        applied_changes,
        improvement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorConfig;
    use crate::shaper::ShaperConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Advisor stub with a fixed suggestion and confidence
    struct FixedAdvisor {
        confidence: f64,
        suggestions: AtomicU32,
        trained: AtomicU32,
    }

    impl FixedAdvisor {
        fn new(confidence: f64) -> Self {
            Self {
                confidence,
                suggestions: AtomicU32::new(0),
                trained: AtomicU32::new(0),
            }
        }
    }

    impl StrategyAdvisor for FixedAdvisor {
        fn suggest(
            &self,
            _conditions: &NetworkConditions,
            policy: &QoSPolicy,
        ) -> Option<OptimizationSuggestion> {
            self.suggestions.fetch_add(1, Ordering::Relaxed);
            Some(OptimizationSuggestion {
                parameter: TunableParameter::Priority,
                current_value: u64::from(policy.priority),
                suggested_value: 7,
                confidence: self.confidence,
            })
        }

        fn train(&self, _: &NetworkConditions, _: TunableParameter, _: f64) {
            self.trained.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fast_config() -> OptimizerConfig {
        OptimizerConfig {
            cooldown: Duration::from_millis(20),
            stabilization: Duration::from_millis(20),
            confidence_threshold: 0.7,
        }
    }

    fn rig(advisor: Arc<dyn StrategyAdvisor>) -> (AutoOptimizer, Arc<TrafficShaper>, Arc<QualityMonitor>) {
        let shaper = Arc::new(TrafficShaper::new(ShaperConfig::default()));
        let monitor = Arc::new(QualityMonitor::new(MonitorConfig::default()));
        shaper.register("p", QoSPolicy::default());
        monitor.register("p");
        let optimizer = AutoOptimizer::new(
            fast_config(),
            Arc::clone(&shaper),
            Arc::clone(&monitor),
            advisor,
        );
        (optimizer, shaper, monitor)
    }

    #[tokio::test]
    async fn low_confidence_suggestions_are_never_applied() {
        let advisor = Arc::new(FixedAdvisor::new(0.5));
        let (optimizer, shaper, monitor) = rig(Arc::clone(&advisor) as Arc<dyn StrategyAdvisor>);
        monitor.record_sample("p", 10.0, 0.0, 0.0);

        assert!(optimizer.start("p"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let outcome = optimizer.stop("p").await.unwrap();

        assert!(advisor.suggestions.load(Ordering::Relaxed) > 0);
        assert!(!outcome.success);
        assert!(outcome.applied_changes.is_empty());
        assert_eq!(shaper.policy("p").unwrap(), QoSPolicy::default());
    }

    #[tokio::test]
    async fn threshold_is_strictly_greater_than() {
        // Exactly 0.7 must not pass a `> 0.7` gate.
        let advisor = Arc::new(FixedAdvisor::new(0.7));
        let (optimizer, shaper, monitor) = rig(Arc::clone(&advisor) as Arc<dyn StrategyAdvisor>);
        monitor.record_sample("p", 10.0, 0.0, 0.0);

        optimizer.start("p");
        tokio::time::sleep(Duration::from_millis(120)).await;
        let outcome = optimizer.stop("p").await.unwrap();

        assert!(outcome.applied_changes.is_empty());
        assert_eq!(shaper.policy("p").unwrap(), QoSPolicy::default());
    }

    #[tokio::test]
    async fn improving_change_is_kept_and_trained() {
        let advisor = Arc::new(FixedAdvisor::new(0.95));
        let (optimizer, shaper, monitor) = rig(Arc::clone(&advisor) as Arc<dyn StrategyAdvisor>);

        // Mediocre before, excellent after the stabilization window: the
        // sampler keeps feeding better numbers while the trial runs.
        monitor.record_sample("p", 150.0, 0.2, 0.0);
        optimizer.start("p");
        for _ in 0..12 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            monitor.record_sample("p", 5.0, 0.0, 900_000.0);
        }
        let outcome = optimizer.stop("p").await.unwrap();

        assert!(outcome.success);
        assert!(outcome.applied_changes.contains(&(TunableParameter::Priority, 7)));
        assert_eq!(shaper.policy("p").unwrap().priority, 7);
        assert!(advisor.trained.load(Ordering::Relaxed) > 0);
        assert!(outcome.improvement > 0.0);
    }

    #[tokio::test]
    async fn non_improving_change_is_reverted() {
        let advisor = Arc::new(FixedAdvisor::new(0.95));
        let (optimizer, shaper, monitor) = rig(advisor as Arc<dyn StrategyAdvisor>);

        // Metrics never change, so the trial cannot improve the score.
        monitor.record_sample("p", 50.0, 0.0, 100_000.0);
        optimizer.start("p");
        tokio::time::sleep(Duration::from_millis(120)).await;
        let outcome = optimizer.stop("p").await.unwrap();

        assert!(!outcome.success);
        assert_eq!(shaper.policy("p").unwrap(), QoSPolicy::default());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let advisor = Arc::new(FixedAdvisor::new(0.1));
        let (optimizer, _shaper, _monitor) = rig(advisor as Arc<dyn StrategyAdvisor>);

        assert!(optimizer.start("p"));
        assert!(!optimizer.start("p"));
        assert!(optimizer.is_running("p"));

        optimizer.stop_all().await;
        assert!(!optimizer.is_running("p"));
    }
}
