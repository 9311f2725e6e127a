//! Pluggable optimization strategy advisor.
//!
//! The optimizer asks an advisor what to change; whether the advice comes
//! from a heuristic table or a trained model is invisible behind the trait.
//! Suggestions carry a confidence and the optimizer only acts above its
//! threshold, so a cautious advisor can always answer.

use crate::monitor::QualityMetrics;
use crate::shaper::{MAX_PRIORITY, QoSPolicy};

/// Observed network conditions fed to the advisor
#[derive(Debug, Clone, Copy)]
pub struct NetworkConditions {
    /// Mean latency, ms
    pub latency_ms: f64,
    /// Observed throughput, bytes/s
    pub bandwidth_utilization: f64,
    /// Loss ratio, `[0, 1]`
    pub packet_loss: f64,
    /// Latency jitter, ms
    pub jitter_ms: f64,
    /// Composite stability, `[0, 1]`
    pub stability: f64,
}

impl From<&QualityMetrics> for NetworkConditions {
    fn from(metrics: &QualityMetrics) -> Self {
        Self {
            latency_ms: metrics.avg_latency_ms,
            bandwidth_utilization: metrics.bandwidth_utilization,
            packet_loss: metrics.packet_loss,
            jitter_ms: metrics.jitter_ms,
            stability: metrics.stability_score,
        }
    }
}

/// The QoS policy field a suggestion targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunableParameter {
    /// `QoSPolicy::priority`
    Priority,
    /// `QoSPolicy::bandwidth_limit`
    BandwidthLimit,
    /// `QoSPolicy::latency_target_ms`
    LatencyTarget,
}

impl std::fmt::Display for TunableParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunableParameter::Priority => write!(f, "priority"),
            TunableParameter::BandwidthLimit => write!(f, "bandwidth_limit"),
            TunableParameter::LatencyTarget => write!(f, "latency_target_ms"),
        }
    }
}

/// One proposed policy change
#[derive(Debug, Clone, Copy)]
pub struct OptimizationSuggestion {
    /// Field to change
    pub parameter: TunableParameter,
    /// Value the field holds now
    pub current_value: u64,
    /// Proposed value
    pub suggested_value: u64,
    /// Advisor's confidence in the change, `[0, 1]`
    pub confidence: f64,
}

/// Strategy advisor collaborator.
///
/// `suggest` proposes at most one change for the given conditions; `train`
/// feeds back the performance score a kept change achieved, for advisors
/// that learn.
pub trait StrategyAdvisor: Send + Sync {
    /// Propose a policy change, or `None` when nothing looks worth doing
    fn suggest(
        &self,
        conditions: &NetworkConditions,
        policy: &QoSPolicy,
    ) -> Option<OptimizationSuggestion>;

    /// Record the outcome of an applied suggestion
    fn train(&self, conditions: &NetworkConditions, parameter: TunableParameter, score: f64);
}

/// Threshold-rule advisor.
///
/// Deterministic rules over the same five condition inputs a learned
/// implementation would see. Confidence scales with how far past a
/// threshold the observation sits.
#[derive(Debug, Default)]
pub struct HeuristicAdvisor;

/// Latency past which raising priority is proposed, ms
const HIGH_LATENCY_MS: f64 = 100.0;
/// Loss ratio past which capping bandwidth is proposed
const HIGH_LOSS: f64 = 0.05;
/// Stability above which relaxing a strict latency target is proposed
const COMFORTABLE_STABILITY: f64 = 0.9;

impl HeuristicAdvisor {
    /// New heuristic advisor
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl StrategyAdvisor for HeuristicAdvisor {
    fn suggest(
        &self,
        conditions: &NetworkConditions,
        policy: &QoSPolicy,
    ) -> Option<OptimizationSuggestion> {
        // Sustained loss: cap the peer below its observed rate so the queue
        // stops overrunning the path.
        if conditions.packet_loss > HIGH_LOSS && conditions.bandwidth_utilization > 0.0 {
            let proposed = (conditions.bandwidth_utilization * 0.75) as u64;
            if policy.bandwidth_limit == 0 || proposed < policy.bandwidth_limit {
                let overshoot = (conditions.packet_loss / HIGH_LOSS).min(4.0);
                return Some(OptimizationSuggestion {
                    parameter: TunableParameter::BandwidthLimit,
                    current_value: policy.bandwidth_limit,
                    suggested_value: proposed.max(1),
                    confidence: (0.5 + 0.125 * overshoot).min(1.0),
                });
            }
        }

        // Sustained latency: climb the scheduling priority.
        if conditions.latency_ms > HIGH_LATENCY_MS && policy.priority < MAX_PRIORITY {
            let overshoot = (conditions.latency_ms / HIGH_LATENCY_MS - 1.0).min(1.0);
            return Some(OptimizationSuggestion {
                parameter: TunableParameter::Priority,
                current_value: u64::from(policy.priority),
                suggested_value: u64::from((policy.priority + 2).min(MAX_PRIORITY)),
                confidence: 0.6 + 0.4 * overshoot,
            });
        }

        // Calm link with a strict latency target: relax it and stop
        // shedding packets that would have arrived fine.
        if conditions.stability > COMFORTABLE_STABILITY
            && policy.latency_target_ms > 0
            && policy.latency_target_ms < 200
        {
            return Some(OptimizationSuggestion {
                parameter: TunableParameter::LatencyTarget,
                current_value: policy.latency_target_ms,
                suggested_value: policy.latency_target_ms * 2,
                confidence: 0.75,
            });
        }

        None
    }

    fn train(&self, conditions: &NetworkConditions, parameter: TunableParameter, score: f64) {
        // Heuristics do not learn; keep the feedback visible for tuning.
        tracing::debug!(
            %parameter,
            score,
            latency = conditions.latency_ms,
            loss = conditions.packet_loss,
            "advisor feedback recorded"
        );
    }
}
