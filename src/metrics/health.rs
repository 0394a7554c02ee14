use super::MetricsSnapshot;
use crate::pool::PoolStats;
use crate::resilience::{CircuitSnapshot, CircuitState, RateLimiterSnapshot};
use crate::scheduler::QueueStats;
use serde::Serialize;

/// Consolidated health view returned by `health_check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    /// Probe round-trip when a probe endpoint is configured, else the recent average.
    pub response_time_ms: Option<u64>,
    pub error_rate: f64,
    pub circuit_breaker_state: Vec<CircuitSnapshot>,
    pub connection_pool_stats: PoolStats,
    pub queue_stats: QueueStats,
}

impl HealthReport {
    /// Healthy while the recent error rate stays below `threshold` and no circuit is open.
    pub fn evaluate(error_rate: f64, threshold: f64, circuits: &[CircuitSnapshot]) -> bool {
        let any_open = circuits.iter().any(|c| c.state == CircuitState::Open);
        error_rate < threshold && !any_open
    }
}

/// Everything `get_detailed_status` exposes.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedStatus {
    pub accepting: bool,
    pub health: HealthReport,
    pub metrics: MetricsSnapshot,
    pub rate_limits: RateLimiterSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit(state: CircuitState) -> CircuitSnapshot {
        CircuitSnapshot {
            key: "/r".into(),
            state,
            failure_count: 0,
            success_count: 0,
            failure_threshold: 5,
            success_threshold: 3,
            trials_admitted: 0,
            open_remaining_ms: None,
        }
    }

    #[test]
    fn test_health_evaluation() {
        assert!(HealthReport::evaluate(0.1, 0.5, &[circuit(CircuitState::Closed)]));
        assert!(!HealthReport::evaluate(0.6, 0.5, &[]));
        assert!(!HealthReport::evaluate(0.0, 0.5, &[circuit(CircuitState::Open)]));
        assert!(HealthReport::evaluate(0.0, 0.5, &[circuit(CircuitState::HalfOpen)]));
    }
}
