use crate::discovery::ServiceInstance;
use std::sync::Arc;

const LATENCY_WEIGHT: f64 = 0.4;
const FAILURE_WEIGHT: f64 = 0.4;
const CONNECTION_WEIGHT: f64 = 0.2;

/// Highest score wins, where
///
/// `score = 1 - (0.4 * latency/max_latency + 0.4 * failure_rate + 0.2 * conns/max_conns)`
///
/// Latency and connections are normalized against the largest value among
/// the candidates. Ties go to the earliest registered instance.
pub struct HealthBasedBalancer;

impl HealthBasedBalancer {
    pub fn select(&self, candidates: &[Arc<ServiceInstance>]) -> Option<usize> {
        let max_latency = candidates
            .iter()
            .map(|i| i.response_time())
            .fold(0.0_f64, f64::max);
        let max_conns = candidates
            .iter()
            .map(|i| i.active_connections())
            .max()
            .unwrap_or(0);

        let mut best: Option<(usize, f64)> = None;
        for (idx, inst) in candidates.iter().enumerate() {
            let s = score(inst, max_latency, max_conns);
            match best {
                Some((_, top)) if s <= top => {}
                _ => best = Some((idx, s)),
            }
        }
        best.map(|(idx, _)| idx)
    }
}

pub fn score(inst: &ServiceInstance, max_latency: f64, max_conns: usize) -> f64 {
    let latency = if max_latency > 0.0 {
        inst.response_time() / max_latency
    } else {
        0.0
    };
    let conns = if max_conns > 0 {
        inst.active_connections() as f64 / max_conns as f64
    } else {
        0.0
    };
    let failure = inst.failure_rate().clamp(0.0, 1.0);
    1.0 - (LATENCY_WEIGHT * latency + FAILURE_WEIGHT * failure + CONNECTION_WEIGHT * conns)
}
